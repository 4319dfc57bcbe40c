use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    Laravel,
    Nodejs,
}

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Laravel => "laravel",
            Self::Nodejs => "nodejs",
        }
    }

    pub fn all() -> [Template; 2] {
        [Self::Laravel, Self::Nodejs]
    }

    /// Add-ons this template can run.
    pub fn supported_addons(&self) -> &'static [AddOn] {
        match self {
            Self::Laravel => &[AddOn::Redis, AddOn::Mailhog, AddOn::Phpmyadmin],
            Self::Nodejs => &[AddOn::Redis, AddOn::Mailhog],
        }
    }

    /// Services every project of this template gets regardless of add-ons.
    pub fn base_services(&self) -> &'static [ServiceKind] {
        match self {
            Self::Laravel => &[ServiceKind::App, ServiceKind::Db, ServiceKind::Vite],
            Self::Nodejs => &[ServiceKind::App],
        }
    }
}

impl FromStr for Template {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "laravel" => Ok(Self::Laravel),
            "nodejs" | "node" => Ok(Self::Nodejs),
            _ => Err(format!("Invalid template: {}", s)),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Creating,
    Ready,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Transitional states the poller must not overwrite.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Creating | Self::Stopping)
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Logical service classes that receive a host port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    App,
    Db,
    Redis,
    Vite,
    Phpmyadmin,
    Mailhog,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Db => "db",
            Self::Redis => "redis",
            Self::Vite => "vite",
            Self::Phpmyadmin => "phpmyadmin",
            Self::Mailhog => "mailhog",
        }
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(Self::App),
            "db" => Ok(Self::Db),
            "redis" => Ok(Self::Redis),
            "vite" => Ok(Self::Vite),
            "phpmyadmin" => Ok(Self::Phpmyadmin),
            "mailhog" => Ok(Self::Mailhog),
            _ => Err(format!("Invalid service: {}", s)),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Optional services a project can enable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AddOn {
    Redis,
    Mailhog,
    Phpmyadmin,
}

impl AddOn {
    pub fn service(&self) -> ServiceKind {
        match self {
            Self::Redis => ServiceKind::Redis,
            Self::Mailhog => ServiceKind::Mailhog,
            Self::Phpmyadmin => ServiceKind::Phpmyadmin,
        }
    }
}

impl FromStr for AddOn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redis" => Ok(Self::Redis),
            "mailhog" => Ok(Self::Mailhog),
            "phpmyadmin" => Ok(Self::Phpmyadmin),
            _ => Err(format!("Invalid service: {}", s)),
        }
    }
}

pub type PortMap = BTreeMap<ServiceKind, u16>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub password: String,
}

impl DatabaseConfig {
    pub fn for_project(name: &str) -> Self {
        let db_name = name.replace('-', "_");
        Self {
            name: db_name,
            user: "devdock".to_string(),
            password: "secret".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    #[serde(default)]
    pub services: Vec<AddOn>,
    #[serde(default = "default_php_version")]
    pub php_version: String,
    #[serde(default = "default_node_version")]
    pub node_version: String,
    pub database: DatabaseConfig,
}

pub fn default_php_version() -> String {
    "8.3".to_string()
}

pub fn default_node_version() -> String {
    "20".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub template: Template,
    pub path: PathBuf,
    pub ports: PortMap,
    pub status: ProjectStatus,
    pub config: ProjectConfig,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProjectRecord {
    pub fn port(&self, service: ServiceKind) -> Option<u16> {
        self.ports.get(&service).copied()
    }

    pub fn has_addon(&self, addon: AddOn) -> bool {
        self.config.services.contains(&addon)
    }

    pub fn compose_file(&self) -> PathBuf {
        self.path.join("docker-compose.yml")
    }

    pub fn env_file(&self) -> PathBuf {
        self.path.join(".env")
    }

    pub fn app_url(&self) -> Option<String> {
        self.port(ServiceKind::App)
            .map(|p| format!("http://localhost:{}", p))
    }
}

/// One `ip domain` line in the managed hosts section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainMapping {
    pub domain: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyRoute {
    pub domain: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelInfo {
    pub project: String,
    pub local_port: u16,
    pub public_url: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NgrokSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authtoken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

// Operation tracking models

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Start,
    Stop,
    Restart,
    Rebuild,
    Delete,
    Regenerate,
    Install,
    Uninstall,
    Env,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Rebuild => "rebuild",
            Self::Delete => "delete",
            Self::Regenerate => "regenerate",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Env => "env",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationStep {
    pub name: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub project: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub steps: Vec<OperationStep>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// API view types

#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
    pub name: Template,
    pub description: &'static str,
    pub base_services: Vec<ServiceKind>,
    pub addons: Vec<AddOn>,
    pub default_php_version: Option<String>,
    pub default_node_version: String,
    pub port_baselines: PortMap,
}
