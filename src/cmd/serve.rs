//! Dashboard server command: `devdock serve`.

use std::path::PathBuf;

use anyhow::Result;
use devdock::config::DevdockConfig;

/// Flags that override the file and environment layers.
#[derive(Debug, Clone, Default)]
pub struct ServeOverrides {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub projects_dir: Option<PathBuf>,
    pub dev: bool,
}

impl ServeOverrides {
    pub fn apply(&self, config: &mut DevdockConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.paths.data_dir = dir.clone();
        }
        if let Some(dir) = &self.projects_dir {
            config.paths.projects_dir = dir.clone();
        }
        if self.dev {
            config.server.dev_mode = true;
        }
    }
}

pub async fn cmd_serve(config: DevdockConfig, open: bool) -> Result<()> {
    // No browser inside dev containers.
    let open = open && !config.server.dev_mode;
    devdock::dashboard::server::start_server(config, open).await
}
