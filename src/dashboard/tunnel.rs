//! ngrok tunnel supervision.
//!
//! Tunnels live only in process memory: each is a child `ngrok http <port>`
//! process plus the public URL read back from the agent's local API.
//! Settings (authtoken, region) persist in `ngrok-config.json`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::models::{NgrokSettings, TunnelInfo};
use super::store::JsonDocument;
use crate::config::NgrokSection;
use crate::errors::{DashboardError, DashboardResult};

const URL_POLL_ATTEMPTS: u32 = 10;
const URL_POLL_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<ApiTunnel>,
}

#[derive(Debug, Deserialize)]
struct ApiTunnel {
    public_url: String,
    #[serde(default)]
    proto: String,
    #[serde(default)]
    config: Option<ApiTunnelConfig>,
}

#[derive(Debug, Deserialize)]
struct ApiTunnelConfig {
    #[serde(default)]
    addr: String,
}

/// Pick the public URL for `port`, preferring https.
fn public_url_for(list: &TunnelList, port: u16) -> Option<String> {
    let suffix = format!(":{}", port);
    let port_str = port.to_string();
    let matching: Vec<&ApiTunnel> = list
        .tunnels
        .iter()
        .filter(|t| {
            t.config
                .as_ref()
                .is_some_and(|c| c.addr.ends_with(&suffix) || c.addr == port_str)
        })
        .collect();
    matching
        .iter()
        .find(|t| t.proto == "https")
        .or_else(|| matching.first())
        .map(|t| t.public_url.clone())
}

struct RunningTunnel {
    child: Child,
    info: TunnelInfo,
}

pub struct TunnelManager {
    binary: String,
    api_url: String,
    settings: JsonDocument<NgrokSettings>,
    tunnels: Mutex<HashMap<String, RunningTunnel>>,
    /// Projects whose agent is spawned but not yet registered.
    starting: std::sync::Mutex<HashSet<String>>,
    client: reqwest::Client,
}

/// Releases a `starting` reservation however `start` returns.
struct StartingGuard<'a> {
    starting: &'a std::sync::Mutex<HashSet<String>>,
    project: String,
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        let mut starting = self
            .starting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        starting.remove(&self.project);
    }
}

impl TunnelManager {
    pub fn new(ngrok: &NgrokSection, settings_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: ngrok.binary.clone(),
            api_url: ngrok.api_url.trim_end_matches('/').to_string(),
            settings: JsonDocument::open(settings_path),
            tunnels: Mutex::new(HashMap::new()),
            starting: std::sync::Mutex::new(HashSet::new()),
            client: reqwest::Client::new(),
        }
    }

    pub async fn settings(&self) -> NgrokSettings {
        self.settings.snapshot().await
    }

    pub async fn update_settings(&self, new: NgrokSettings) -> DashboardResult<NgrokSettings> {
        let saved = self
            .settings
            .update(move |current| {
                *current = new.clone();
                Ok(new)
            })
            .await?;
        tracing::info!(has_authtoken = saved.authtoken.is_some(), "ngrok settings saved");
        Ok(saved)
    }

    /// Running tunnels. Children that exited on their own are dropped.
    pub async fn list(&self) -> Vec<TunnelInfo> {
        let mut tunnels = self.tunnels.lock().await;
        tunnels.retain(|project, tunnel| match tunnel.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::info!(project, %status, "ngrok tunnel exited");
                false
            }
            Err(e) => {
                tracing::warn!(project, error = %e, "failed to check ngrok process");
                false
            }
        });
        let mut infos: Vec<TunnelInfo> = tunnels.values().map(|t| t.info.clone()).collect();
        infos.sort_by(|a, b| a.project.cmp(&b.project));
        infos
    }

    /// Spawn `ngrok http <port>` for `project`. The tunnel map is only
    /// locked to reserve and to register, never while the agent boots.
    pub async fn start(&self, project: &str, local_port: u16) -> DashboardResult<TunnelInfo> {
        let _reservation = self.reserve(project).await?;

        let settings = self.settings.snapshot().await;
        let mut cmd = Command::new(&self.binary);
        cmd.arg("http")
            .arg(local_port.to_string())
            .arg("--log")
            .arg("stdout")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(token) = &settings.authtoken {
            cmd.env("NGROK_AUTHTOKEN", token);
        }
        if let Some(region) = &settings.region {
            cmd.arg("--region").arg(region);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DashboardError::ExternalTool(format!(
                    "'{}' was not found; install ngrok or set ngrok.binary",
                    self.binary
                ))
            } else {
                DashboardError::ExternalTool(format!("Failed to start {}: {}", self.binary, e))
            }
        })?;
        tracing::info!(project, local_port, pid = ?child.id(), "ngrok started");

        let public_url = self.wait_for_url(&mut child, local_port).await?;
        let info = TunnelInfo {
            project: project.to_string(),
            local_port,
            public_url,
            started_at: Utc::now(),
        };
        self.tunnels.lock().await.insert(
            project.to_string(),
            RunningTunnel {
                child,
                info: info.clone(),
            },
        );
        Ok(info)
    }

    async fn reserve(&self, project: &str) -> DashboardResult<StartingGuard<'_>> {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(existing) = tunnels.get_mut(project) {
            if matches!(existing.child.try_wait(), Ok(None)) {
                return Err(DashboardError::Conflict(format!(
                    "A tunnel for '{}' is already running",
                    project
                )));
            }
            tunnels.remove(project);
        }
        let mut starting = self
            .starting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !starting.insert(project.to_string()) {
            return Err(DashboardError::Conflict(format!(
                "A tunnel for '{}' is already starting",
                project
            )));
        }
        Ok(StartingGuard {
            starting: &self.starting,
            project: project.to_string(),
        })
    }

    async fn wait_for_url(&self, child: &mut Child, port: u16) -> DashboardResult<Option<String>> {
        for _ in 0..URL_POLL_ATTEMPTS {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(DashboardError::ExternalTool(format!(
                    "ngrok exited immediately ({}); check the authtoken",
                    status
                )));
            }
            match self.fetch_public_url(port).await {
                Ok(Some(url)) => return Ok(Some(url)),
                Ok(None) => {}
                Err(e) => tracing::debug!(error = %e, "ngrok API not ready"),
            }
            tokio::time::sleep(URL_POLL_DELAY).await;
        }
        tracing::warn!(port, "ngrok did not report a public URL in time");
        Ok(None)
    }

    async fn fetch_public_url(&self, port: u16) -> Result<Option<String>, reqwest::Error> {
        let list: TunnelList = self
            .client
            .get(format!("{}/api/tunnels", self.api_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(public_url_for(&list, port))
    }

    pub async fn stop(&self, project: &str) -> DashboardResult<TunnelInfo> {
        let mut tunnels = self.tunnels.lock().await;
        let mut tunnel = tunnels
            .remove(project)
            .ok_or_else(|| DashboardError::NotFound(format!("Tunnel for '{}'", project)))?;
        if let Err(e) = tunnel.child.kill().await {
            tracing::warn!(project, error = %e, "failed to kill ngrok");
        }
        tracing::info!(project, "ngrok tunnel stopped");
        Ok(tunnel.info)
    }

    /// Kill every tunnel; used on shutdown.
    pub async fn stop_all(&self) {
        let mut tunnels = self.tunnels.lock().await;
        for (project, mut tunnel) in tunnels.drain() {
            if let Err(e) = tunnel.child.kill().await {
                tracing::warn!(project, error = %e, "failed to kill ngrok");
            }
        }
    }
}
