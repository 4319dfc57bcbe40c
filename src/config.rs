//! Unified configuration for devdock.
//!
//! Settings are read from `devdock.toml`, layered as
//! defaults → file → environment → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 3500
//! dev_mode = false
//!
//! [paths]
//! projects_dir = "~/devdock/projects"
//! data_dir = "~/.local/share/devdock"
//! hosts_file = "/etc/hosts"
//!
//! [ports]
//! app = 8000
//! node_app = 3000
//! db = 3306
//! redis = 6379
//! vite = 5173
//! phpmyadmin = 8080
//! mailhog = 8025
//!
//! [docker]
//! compose_cmd = ["docker", "compose"]
//! command_timeout_secs = 900
//! probe_timeout_secs = 15
//!
//! [poller]
//! enabled = true
//! interval_secs = 10
//!
//! [proxy]
//! enabled = true
//! listen = "127.0.0.1:8090"
//!
//! [ngrok]
//! binary = "ngrok"
//! api_url = "http://127.0.0.1:4040"
//!
//! [logging]
//! json = false
//! file = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::dashboard::models::ServiceKind;

pub const CONFIG_FILE_NAME: &str = "devdock.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevdockConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub ports: PortBaselines,
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub ngrok: NgrokSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3500
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
}

fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devdock")
        .join("projects")
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devdock")
}

fn default_hosts_file() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            projects_dir: default_projects_dir(),
            data_dir: default_data_dir(),
            hosts_file: default_hosts_file(),
        }
    }
}

/// Lowest port tried for each service class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortBaselines {
    #[serde(default = "default_app")]
    pub app: u16,
    #[serde(default = "default_node_app")]
    pub node_app: u16,
    #[serde(default = "default_db")]
    pub db: u16,
    #[serde(default = "default_redis")]
    pub redis: u16,
    #[serde(default = "default_vite")]
    pub vite: u16,
    #[serde(default = "default_phpmyadmin")]
    pub phpmyadmin: u16,
    #[serde(default = "default_mailhog")]
    pub mailhog: u16,
}

fn default_app() -> u16 {
    8000
}
fn default_node_app() -> u16 {
    3000
}
fn default_db() -> u16 {
    3306
}
fn default_redis() -> u16 {
    6379
}
fn default_vite() -> u16 {
    5173
}
fn default_phpmyadmin() -> u16 {
    8080
}
fn default_mailhog() -> u16 {
    8025
}

impl Default for PortBaselines {
    fn default() -> Self {
        Self {
            app: default_app(),
            node_app: default_node_app(),
            db: default_db(),
            redis: default_redis(),
            vite: default_vite(),
            phpmyadmin: default_phpmyadmin(),
            mailhog: default_mailhog(),
        }
    }
}

impl PortBaselines {
    /// Baseline for a service. Node.js apps start from `node_app`.
    pub fn baseline(&self, service: ServiceKind, node: bool) -> u16 {
        match service {
            ServiceKind::App if node => self.node_app,
            ServiceKind::App => self.app,
            ServiceKind::Db => self.db,
            ServiceKind::Redis => self.redis,
            ServiceKind::Vite => self.vite,
            ServiceKind::Phpmyadmin => self.phpmyadmin,
            ServiceKind::Mailhog => self.mailhog,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSection {
    /// Program plus leading args, e.g. `["docker", "compose"]` or `["docker-compose"]`.
    #[serde(default = "default_compose_cmd")]
    pub compose_cmd: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_compose_cmd() -> Vec<String> {
    vec!["docker".to_string(), "compose".to_string()]
}
fn default_command_timeout() -> u64 {
    900
}
fn default_probe_timeout() -> u64 {
    15
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            compose_cmd: default_compose_cmd(),
            command_timeout_secs: default_command_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    10
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_proxy_listen")]
    pub listen: String,
}

fn default_proxy_listen() -> String {
    "127.0.0.1:8090".to_string()
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_proxy_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NgrokSection {
    #[serde(default = "default_ngrok_binary")]
    pub binary: String,
    #[serde(default = "default_ngrok_api")]
    pub api_url: String,
}

fn default_ngrok_binary() -> String {
    "ngrok".to_string()
}
fn default_ngrok_api() -> String {
    "http://127.0.0.1:4040".to_string()
}

impl Default for NgrokSection {
    fn default() -> Self {
        Self {
            binary: default_ngrok_binary(),
            api_url: default_ngrok_api(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub file: bool,
}

impl DevdockConfig {
    /// Load a config file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: DevdockConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the config path: explicit flag, `$DEVDOCK_CONFIG`, then the user config dir.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var("DEVDOCK_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("devdock")
            .join(CONFIG_FILE_NAME)
    }

    /// Load from the resolved path and apply environment overrides.
    pub fn load_layered(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit);
        let mut config = Self::load(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `DEVDOCK_*` overrides. The lookup is injected so tests don't touch the process env.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("DEVDOCK_PROJECTS_DIR") {
            self.paths.projects_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("DEVDOCK_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("DEVDOCK_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(file) = lookup("DEVDOCK_HOSTS_FILE") {
            self.paths.hosts_file = PathBuf::from(file);
        }
    }

    /// Serialize to TOML, used by `devdock init` and `devdock config`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn projects_file(&self) -> PathBuf {
        self.paths.data_dir.join("projects.json")
    }

    pub fn proxy_file(&self) -> PathBuf {
        self.paths.data_dir.join("proxy-config.json")
    }

    pub fn ngrok_file(&self) -> PathBuf {
        self.paths.data_dir.join("ngrok-config.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.paths.data_dir.join("logs")
    }
}
