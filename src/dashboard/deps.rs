//! Declared Composer / npm dependencies and the commands that change them.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::executor::CommandSpec;
use crate::errors::{DashboardError, DashboardResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Composer,
    Npm,
}

impl PackageManager {
    pub fn manifest(&self) -> &'static str {
        match self {
            Self::Composer => "composer.json",
            Self::Npm => "package.json",
        }
    }

    fn sections(&self) -> (&'static str, &'static str) {
        match self {
            Self::Composer => ("require", "require-dev"),
            Self::Npm => ("dependencies", "devDependencies"),
        }
    }
}

impl FromStr for PackageManager {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "composer" => Ok(Self::Composer),
            "npm" => Ok(Self::Npm),
            other => Err(DashboardError::Validation(format!(
                "Unknown package manager '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Dependency {
    pub name: String,
    pub version: String,
    pub dev: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DependencyList {
    pub composer: Vec<Dependency>,
    pub npm: Vec<Dependency>,
}

fn collect(manifest: &serde_json::Value, section: &str, dev: bool) -> Vec<Dependency> {
    manifest
        .get(section)
        .and_then(|v| v.as_object())
        .map(|deps| {
            deps.iter()
                .map(|(name, version)| Dependency {
                    name: name.clone(),
                    version: version.as_str().unwrap_or("*").to_string(),
                    dev,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse one manifest's runtime and dev dependencies.
pub fn parse_manifest(manager: PackageManager, content: &str) -> DashboardResult<Vec<Dependency>> {
    let manifest: serde_json::Value = serde_json::from_str(content).map_err(|e| {
        DashboardError::Validation(format!("Invalid {}: {}", manager.manifest(), e))
    })?;
    let (runtime, dev) = manager.sections();
    let mut deps = collect(&manifest, runtime, false);
    deps.extend(collect(&manifest, dev, true));
    Ok(deps)
}

async fn read_manifest(dir: &Path, manager: PackageManager) -> DashboardResult<Vec<Dependency>> {
    let path = dir.join(manager.manifest());
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => parse_manifest(manager, &content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(DashboardError::Other(
            anyhow::Error::new(e).context(format!("Failed to read {}", path.display())),
        )),
    }
}

/// Dependencies declared in the project directory.
pub async fn list_dependencies(dir: &Path) -> DashboardResult<DependencyList> {
    Ok(DependencyList {
        composer: read_manifest(dir, PackageManager::Composer).await?,
        npm: read_manifest(dir, PackageManager::Npm).await?,
    })
}

/// Composer accepts `vendor/package` optionally followed by `:constraint`;
/// npm names may be scoped and carry `@version`.
pub fn validate_package(manager: PackageManager, package: &str) -> DashboardResult<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || "-_./@:^~*<>=|, ".contains(c);
    let well_formed = !package.trim().is_empty()
        && !package.starts_with('-')
        && package.chars().all(allowed)
        && match manager {
            PackageManager::Composer => package.split(':').next().is_some_and(|n| n.contains('/')),
            PackageManager::Npm => true,
        };
    if well_formed {
        Ok(())
    } else {
        Err(DashboardError::Validation(format!(
            "Invalid {} package '{}'",
            match manager {
                PackageManager::Composer => "composer",
                PackageManager::Npm => "npm",
            },
            package
        )))
    }
}

pub fn install_command(manager: PackageManager, package: &str, dev: bool) -> CommandSpec {
    match manager {
        PackageManager::Composer => {
            let spec = CommandSpec::new("composer").arg("require");
            let spec = if dev { spec.arg("--dev") } else { spec };
            spec.args([package, "--no-interaction"])
        }
        PackageManager::Npm => {
            let spec = CommandSpec::new("npm").arg("install");
            let spec = if dev { spec.arg("--save-dev") } else { spec };
            spec.arg(package)
        }
    }
}

pub fn remove_command(manager: PackageManager, package: &str) -> CommandSpec {
    match manager {
        PackageManager::Composer => CommandSpec::new("composer").args(["remove", package, "--no-interaction"]),
        PackageManager::Npm => CommandSpec::new("npm").args(["uninstall", package]),
    }
}
