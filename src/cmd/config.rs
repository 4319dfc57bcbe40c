//! Configuration commands: `devdock init` and `devdock config`.

use std::path::Path;

use anyhow::{Context, Result};

use devdock::config::DevdockConfig;

pub fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        println!("devdock.toml already exists at {}", config_path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let toml = DevdockConfig::default().to_toml()?;
    std::fs::write(config_path, toml)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Created devdock.toml at {}", config_path.display());
    println!();
    println!("You can now customize:");
    println!("  - [server] port, dev_mode");
    println!("  - [paths] projects_dir, data_dir, hosts_file");
    println!("  - [ports] baseline host ports per service");
    println!();
    Ok(())
}

/// Print the effective configuration after file and environment layers.
pub fn cmd_config(config: &DevdockConfig, config_path: &Path) -> Result<()> {
    println!();
    if config_path.exists() {
        println!("# Config file: {}", config_path.display());
    } else {
        println!("# No config file at {} (using defaults)", config_path.display());
    }
    println!("# Effective values (with env overrides):");
    println!();
    print!("{}", config.to_toml()?);
    println!();
    Ok(())
}
