//! `docker compose` command builders and `ps` output parsing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::executor::{CommandExecutor, CommandOutput, CommandSpec};
use super::models::ProjectStatus;
use crate::config::DockerSection;
use crate::errors::{ExecError, StatusError};

/// Lifecycle state Docker reports for one container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Removing,
    Dead,
    Unknown,
}

impl ContainerState {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "removing" => Self::Removing,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Paused => "paused",
            Self::Exited => "exited",
            Self::Removing => "removing",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContainerInfo {
    pub service: String,
    pub name: String,
    pub state: ContainerState,
    pub exit_code: Option<i32>,
    pub health: Option<String>,
    pub status_text: Option<String>,
}

/// Raw row of `docker compose ps --format json`.
#[derive(Debug, Deserialize)]
struct PsRow {
    #[serde(rename = "Service", default)]
    service: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i32>,
    #[serde(rename = "Health", default)]
    health: Option<String>,
    #[serde(rename = "Status", default)]
    status: Option<String>,
}

impl From<PsRow> for ContainerInfo {
    fn from(row: PsRow) -> Self {
        Self {
            service: row.service,
            name: row.name,
            state: ContainerState::parse(&row.state),
            exit_code: row.exit_code,
            health: row.health.filter(|h| !h.is_empty()),
            status_text: row.status.filter(|s| !s.is_empty()),
        }
    }
}

/// Parse `ps --format json` output. Accepts one object per line or a single
/// array; lines that are not JSON are skipped.
pub fn parse_ps_output(output: &str) -> Result<Vec<ContainerInfo>, StatusError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        if let Ok(rows) = serde_json::from_str::<Vec<PsRow>>(trimmed) {
            return Ok(rows.into_iter().map(ContainerInfo::from).collect());
        }
    }

    let mut containers = Vec::new();
    let mut saw_json = false;
    let mut last_error = None;
    for line in trimmed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with('[') {
            match serde_json::from_str::<Vec<PsRow>>(line) {
                Ok(rows) => {
                    saw_json = true;
                    containers.extend(rows.into_iter().map(ContainerInfo::from));
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        } else if line.starts_with('{') {
            match serde_json::from_str::<PsRow>(line) {
                Ok(row) => {
                    saw_json = true;
                    containers.push(row.into());
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        } else {
            tracing::debug!(line, "skipping non-JSON compose output");
        }
    }

    if !saw_json {
        if let Some(err) = last_error {
            return Err(StatusError::Parse(err));
        }
    }
    Ok(containers)
}

/// Collapse container states into one project status.
pub fn derive_status(containers: &[ContainerInfo]) -> ProjectStatus {
    if containers.is_empty() {
        return ProjectStatus::Stopped;
    }
    if containers.iter().all(|c| c.state == ContainerState::Running) {
        return ProjectStatus::Running;
    }
    let failed = containers.iter().any(|c| match c.state {
        ContainerState::Dead => true,
        ContainerState::Exited => c.exit_code.is_some_and(|code| code != 0),
        _ => false,
    });
    if failed {
        return ProjectStatus::Error;
    }
    let app_running = containers
        .iter()
        .any(|c| c.service == "app" && c.state == ContainerState::Running);
    if app_running {
        ProjectStatus::Running
    } else {
        ProjectStatus::Stopped
    }
}

/// Map a failed `ps` invocation to a status error.
fn classify_failure(dir: &Path, err: ExecError) -> StatusError {
    match err {
        ExecError::NotFound(program) => {
            StatusError::DockerUnavailable(format!("{} is not installed", program))
        }
        ExecError::NonZeroExit { code, stderr } => {
            let lower = stderr.to_ascii_lowercase();
            if lower.contains("cannot connect to the docker daemon")
                || lower.contains("is the docker daemon running")
                || lower.contains("error during connect")
            {
                StatusError::DockerUnavailable(stderr)
            } else if lower.contains("no configuration file provided")
                || lower.contains("can't find a suitable configuration file")
            {
                StatusError::ComposeFileMissing(dir.to_path_buf())
            } else {
                StatusError::Exec(ExecError::NonZeroExit { code, stderr })
            }
        }
        other => StatusError::Exec(other),
    }
}

/// Builds and runs `docker compose` commands for a project directory.
#[derive(Clone)]
pub struct ComposeClient {
    executor: Arc<dyn CommandExecutor>,
    prefix: Vec<String>,
    command_timeout: Duration,
    probe_timeout: Duration,
}

impl ComposeClient {
    pub fn new(executor: Arc<dyn CommandExecutor>, docker: &DockerSection) -> Self {
        Self {
            executor,
            prefix: docker.compose_cmd.clone(),
            command_timeout: Duration::from_secs(docker.command_timeout_secs),
            probe_timeout: Duration::from_secs(docker.probe_timeout_secs),
        }
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    fn base(&self, dir: &Path) -> CommandSpec {
        CommandSpec::from_prefix(&self.prefix)
            .cwd(dir)
            .timeout(self.command_timeout)
    }

    pub fn up(&self, dir: &Path) -> CommandSpec {
        self.base(dir).args(["up", "-d"])
    }

    pub fn up_recreate(&self, dir: &Path) -> CommandSpec {
        self.base(dir).args(["up", "-d", "--force-recreate"])
    }

    pub fn down(&self, dir: &Path, volumes: bool) -> CommandSpec {
        let spec = self.base(dir).arg("down");
        if volumes { spec.arg("-v") } else { spec }
    }

    pub fn restart(&self, dir: &Path) -> CommandSpec {
        self.base(dir).arg("restart")
    }

    pub fn build(&self, dir: &Path, no_cache: bool) -> CommandSpec {
        let spec = self.base(dir).arg("build");
        if no_cache { spec.arg("--no-cache") } else { spec }
    }

    pub fn logs(&self, dir: &Path, service: Option<&str>, tail: u32) -> CommandSpec {
        let spec = self
            .base(dir)
            .args(["logs", "--no-color", "--tail"])
            .arg(tail.to_string())
            .timeout(self.probe_timeout);
        match service {
            Some(service) => spec.arg(service),
            None => spec,
        }
    }

    /// `exec -T <service> <cmd...>`; no TTY since output is captured.
    pub fn exec<I, S>(&self, dir: &Path, service: &str, command: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base(dir).args(["exec", "-T"]).arg(service).args(command)
    }

    pub fn ps_spec(&self, dir: &Path) -> CommandSpec {
        self.base(dir)
            .args(["ps", "--all", "--format", "json"])
            .timeout(self.probe_timeout)
    }

    /// Container states for the project in `dir`.
    pub async fn ps(&self, dir: &Path) -> Result<Vec<ContainerInfo>, StatusError> {
        if !dir.join("docker-compose.yml").exists() {
            return Err(StatusError::ComposeFileMissing(dir.to_path_buf()));
        }
        let output = self
            .executor
            .run(&self.ps_spec(dir))
            .await
            .and_then(CommandOutput::into_result)
            .map_err(|e| classify_failure(dir, e))?;
        parse_ps_output(&output.stdout)
    }

    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.executor.run(spec).await
    }
}
