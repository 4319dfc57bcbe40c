//! Project lifecycle: create, start, stop, restart, rebuild, delete, and the
//! ad-hoc commands (terminal, artisan, logs, env, dependencies) that act on
//! one project directory.
//!
//! Long actions take the project's operation lock and run in a background
//! task; the caller gets the operation id back immediately.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::compose::{ComposeClient, ContainerInfo};
use super::deps::{self, DependencyList, PackageManager};
use super::env;
use super::executor::{CommandExecutor, CommandOutput, CommandSpec};
use super::models::{
    AddOn, DatabaseConfig, OperationKind, ProjectConfig, ProjectRecord, ProjectStatus, ServiceKind,
    Template, default_node_version, default_php_version,
};
use super::operations::{OperationHandle, OperationRegistry, forward_output};
use super::ports::{PortAllocator, PortProbe, used_ports};
use super::status::{ProbeResult, StatusProbe};
use super::store::{ProjectStore, write_atomic};
use super::templates::{self, SlotValues};
use super::ws::{WsEvent, broadcast_event};
use crate::config::DevdockConfig;
use crate::errors::{DashboardError, DashboardResult, ExecError};
use crate::util::validate_project_name;

const NODE_ENTRY: &str = "const http = require('http');

const port = process.env.PORT || 3000;

http
  .createServer((req, res) => {
    res.writeHead(200, { 'Content-Type': 'text/plain' });
    res.end('Hello from {{PROJECT_NAME}}\\n');
  })
  .listen(port, () => console.log(`listening on ${port}`));
";

fn default_template() -> Template {
    Template::Laravel
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default = "default_template")]
    pub template: Template,
    #[serde(default)]
    pub services: Vec<AddOn>,
    /// Requested host ports by service; others are allocated.
    #[serde(default)]
    pub ports: BTreeMap<ServiceKind, u16>,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub node_version: Option<String>,
}

fn validate_version(label: &str, version: &str) -> DashboardResult<()> {
    let ok = !version.is_empty()
        && version.len() <= 10
        && version.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !version.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(DashboardError::Validation(format!(
            "Invalid {} version '{}'",
            label, version
        )))
    }
}

/// Shell used for the project terminal.
fn host_shell(command: &str) -> CommandSpec {
    if cfg!(windows) {
        CommandSpec::new("cmd").args(["/C", command])
    } else {
        CommandSpec::new("sh").args(["-c", command])
    }
}

pub struct ProjectManager {
    config: Arc<DevdockConfig>,
    store: Arc<ProjectStore>,
    compose: ComposeClient,
    operations: Arc<OperationRegistry>,
    port_probe: Arc<dyn PortProbe>,
    status_probe: Arc<dyn StatusProbe>,
    events: broadcast::Sender<String>,
}

impl ProjectManager {
    pub fn new(
        config: Arc<DevdockConfig>,
        store: Arc<ProjectStore>,
        compose: ComposeClient,
        operations: Arc<OperationRegistry>,
        port_probe: Arc<dyn PortProbe>,
        status_probe: Arc<dyn StatusProbe>,
    ) -> Arc<Self> {
        let events = operations.events().clone();
        Arc::new(Self {
            config,
            store,
            compose,
            operations,
            port_probe,
            status_probe,
            events,
        })
    }

    fn executor(&self) -> &dyn CommandExecutor {
        self.compose.executor().as_ref()
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.docker.command_timeout_secs)
    }

    fn announce(&self, record: ProjectRecord) {
        broadcast_event(&self.events, &WsEvent::ProjectUpdate { project: record });
    }

    async fn set_status(&self, name: &str, status: ProjectStatus, error: Option<String>) {
        match self.store.update_status(name, status, error).await {
            Ok(record) => self.announce(record),
            Err(e) => tracing::warn!(project = name, error = %e, "failed to record status"),
        }
    }

    /// Record the outcome, then release the operation lock.
    async fn finish(&self, name: &str, handle: OperationHandle, result: DashboardResult<ProjectStatus>) {
        match result {
            Ok(status) => {
                self.set_status(name, status, None).await;
                handle.succeed();
            }
            Err(DashboardError::Exec(ExecError::Cancelled)) => {
                self.set_status(name, ProjectStatus::Error, Some("Operation cancelled".into()))
                    .await;
                handle.cancelled();
            }
            Err(e) => {
                let message = e.to_string();
                self.set_status(name, ProjectStatus::Error, Some(message.clone()))
                    .await;
                handle.fail(message);
            }
        }
    }

    pub async fn list(&self) -> Vec<ProjectRecord> {
        self.store.list().await
    }

    pub async fn get(&self, name: &str) -> DashboardResult<ProjectRecord> {
        self.store.require(name).await
    }

    // ── Create ───────────────────────────────────────────────────────

    /// Allocate ports, insert a `creating` record and scaffold in the background.
    pub async fn create(self: &Arc<Self>, request: CreateProjectRequest) -> DashboardResult<(ProjectRecord, String)> {
        validate_project_name(&request.name)?;
        let php_version = request.php_version.unwrap_or_else(default_php_version);
        let node_version = request.node_version.unwrap_or_else(default_node_version);
        validate_version("PHP", &php_version)?;
        validate_version("Node.js", &node_version)?;

        let template = request.template;
        let mut addons: Vec<AddOn> = Vec::new();
        for addon in request.services {
            if !template.supported_addons().contains(&addon) {
                tracing::warn!(template = %template, addon = ?addon, "add-on not supported; ignoring");
                continue;
            }
            if !addons.contains(&addon) {
                addons.push(addon);
            }
        }

        let path = self.config.paths.projects_dir.join(&request.name);
        if path.exists() {
            return Err(DashboardError::Conflict(format!(
                "Directory {} already exists",
                path.display()
            )));
        }

        // Claim the project name in the operation registry first so a
        // conflict never leaves a `creating` record behind.
        let handle = self.operations.begin(&request.name, OperationKind::Create)?;

        let name = request.name.clone();
        let custom = request.ports;
        let baselines = self.config.ports.clone();
        let probe = Arc::clone(&self.port_probe);
        let inserted = self
            .store
            .update(move |records| {
                if records.iter().any(|p| p.name == name) {
                    return Err(DashboardError::Conflict(format!(
                        "Project '{}' already exists",
                        name
                    )));
                }
                let used = used_ports(records.iter());
                let ports = PortAllocator::new(&baselines, probe.as_ref())
                    .allocate(template, &addons, &custom, &used)?;
                let now = Utc::now();
                let record = ProjectRecord {
                    id: Uuid::new_v4().to_string(),
                    name: name.clone(),
                    template,
                    path,
                    ports,
                    status: ProjectStatus::Creating,
                    config: ProjectConfig {
                        services: addons,
                        php_version,
                        node_version,
                        database: DatabaseConfig::for_project(&name),
                    },
                    created_at: now,
                    last_activity: now,
                    error: None,
                };
                records.push(record.clone());
                Ok(record)
            })
            .await;
        let record = match inserted {
            Ok(record) => record,
            Err(e) => {
                handle.fail(e.to_string());
                return Err(e);
            }
        };

        let operation_id = handle.id().to_string();
        tracing::info!(project = %record.name, template = %record.template, ports = ?record.ports, "project created");
        self.announce(record.clone());

        let manager = Arc::clone(self);
        let task_record = record.clone();
        tokio::spawn(async move {
            let result = manager
                .scaffold(&task_record, &handle)
                .await
                .map(|_| ProjectStatus::Ready);
            manager.finish(&task_record.name, handle, result).await;
        });

        Ok((record, operation_id))
    }

    async fn scaffold(&self, record: &ProjectRecord, handle: &OperationHandle) -> DashboardResult<()> {
        handle.step("Creating project directory");
        tokio::fs::create_dir_all(&record.path)
            .await
            .with_context(|| format!("Failed to create {}", record.path.display()))?;

        match record.template {
            Template::Laravel => {
                handle.step("Installing Laravel");
                let spec = CommandSpec::new("composer")
                    .args([
                        "create-project",
                        "laravel/laravel",
                        ".",
                        "--prefer-dist",
                        "--no-interaction",
                    ])
                    .cwd(&record.path)
                    .timeout(self.command_timeout());
                handle.exec(self.executor(), &spec).await?;
            }
            Template::Nodejs => {
                handle.step("Initializing package.json");
                let spec = CommandSpec::new("npm")
                    .args(["init", "-y"])
                    .cwd(&record.path)
                    .timeout(self.command_timeout());
                handle.exec(self.executor(), &spec).await?;
                prepare_node_package(record).await?;
            }
        }

        handle.step("Generating Docker files");
        let written = write_project_files(record).await?;
        handle.log(format!("Wrote {}", written.join(", ")));

        if record.template == Template::Laravel {
            handle.step("Generating application key");
            let spec = CommandSpec::new("php")
                .args(["artisan", "key:generate", "--no-interaction"])
                .cwd(&record.path)
                .timeout(self.command_timeout());
            match handle.exec(self.executor(), &spec).await {
                Ok(_) => {}
                Err(ExecError::Cancelled) => return Err(ExecError::Cancelled.into()),
                Err(e) => {
                    tracing::warn!(project = %record.name, error = %e, "key:generate failed");
                    handle.log(format!("Skipping key generation: {}", e));
                }
            }
        }
        Ok(())
    }

    // ── Container lifecycle ──────────────────────────────────────────

    pub async fn start(self: &Arc<Self>, name: &str) -> DashboardResult<String> {
        self.launch(name, OperationKind::Start).await
    }

    pub async fn stop(self: &Arc<Self>, name: &str) -> DashboardResult<String> {
        self.launch(name, OperationKind::Stop).await
    }

    pub async fn restart(self: &Arc<Self>, name: &str) -> DashboardResult<String> {
        self.launch(name, OperationKind::Restart).await
    }

    pub async fn rebuild(self: &Arc<Self>, name: &str) -> DashboardResult<String> {
        self.launch(name, OperationKind::Rebuild).await
    }

    async fn launch(self: &Arc<Self>, name: &str, kind: OperationKind) -> DashboardResult<String> {
        let record = self.store.require(name).await?;
        if record.status == ProjectStatus::Creating {
            return Err(DashboardError::Conflict(format!(
                "Project '{}' is still being created",
                name
            )));
        }
        if !record.compose_file().exists() {
            return Err(DashboardError::Validation(format!(
                "docker-compose.yml is missing for '{}'; regenerate the Docker files first",
                name
            )));
        }

        let handle = self.operations.begin(name, kind)?;
        let operation_id = handle.id().to_string();
        if kind == OperationKind::Stop {
            self.set_status(name, ProjectStatus::Stopping, None).await;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.run_compose(&record.path, kind, &handle).await;
            manager.finish(&record.name, handle, result).await;
        });
        Ok(operation_id)
    }

    async fn run_compose(
        &self,
        dir: &Path,
        kind: OperationKind,
        handle: &OperationHandle,
    ) -> DashboardResult<ProjectStatus> {
        let executor = self.executor();
        match kind {
            OperationKind::Start => {
                handle.step("Starting containers");
                handle.exec(executor, &self.compose.up(dir)).await?;
                Ok(ProjectStatus::Running)
            }
            OperationKind::Stop => {
                handle.step("Stopping containers");
                handle.exec(executor, &self.compose.down(dir, false)).await?;
                Ok(ProjectStatus::Stopped)
            }
            OperationKind::Restart => {
                handle.step("Restarting containers");
                handle.exec(executor, &self.compose.restart(dir)).await?;
                Ok(ProjectStatus::Running)
            }
            OperationKind::Rebuild => {
                handle.step("Building images");
                match handle.exec(executor, &self.compose.build(dir, false)).await {
                    Ok(_) => {}
                    Err(ExecError::Cancelled) => return Err(ExecError::Cancelled.into()),
                    Err(e) => {
                        handle.log(format!("Cached build failed ({}); retrying without cache", e));
                        handle.step("Building images without cache");
                        handle.exec(executor, &self.compose.build(dir, true)).await?;
                    }
                }
                handle.step("Recreating containers");
                handle.exec(executor, &self.compose.up_recreate(dir)).await?;
                Ok(ProjectStatus::Running)
            }
            other => Err(DashboardError::Validation(format!(
                "'{}' is not a container operation",
                other.as_str()
            ))),
        }
    }

    // ── Delete / regenerate ──────────────────────────────────────────

    /// Tear down containers and volumes, remove the directory and the record.
    pub async fn delete(&self, name: &str) -> DashboardResult<ProjectRecord> {
        let record = self.store.require(name).await?;
        let handle = self.operations.begin(name, OperationKind::Delete)?;

        let result: DashboardResult<ProjectRecord> = async {
            if record.compose_file().exists() {
                handle.step("Removing containers");
                if let Err(e) = handle
                    .exec(self.executor(), &self.compose.down(&record.path, true))
                    .await
                {
                    tracing::warn!(project = name, error = %e, "compose down failed; removing files anyway");
                    handle.log(format!("compose down failed: {}", e));
                }
            }
            // Only a directory named after the project is ever removed.
            let owned = record.path.file_name().is_some_and(|n| n == name);
            if owned && record.path.exists() {
                handle.step("Removing project directory");
                tokio::fs::remove_dir_all(&record.path)
                    .await
                    .with_context(|| format!("Failed to remove {}", record.path.display()))?;
            }
            self.store.remove(name).await
        }
        .await;

        match result {
            Ok(removed) => {
                handle.succeed();
                tracing::info!(project = name, "project deleted");
                broadcast_event(
                    &self.events,
                    &WsEvent::ProjectRemoved {
                        name: name.to_string(),
                    },
                );
                Ok(removed)
            }
            Err(e) => {
                handle.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Re-render the Docker files from the stored record.
    pub async fn regenerate(&self, name: &str) -> DashboardResult<Vec<String>> {
        let record = self.store.require(name).await?;
        let handle = self.operations.begin(name, OperationKind::Regenerate)?;
        handle.step("Generating Docker files");
        match write_project_files(&record).await {
            Ok(written) => {
                handle.succeed();
                if let Err(e) = self.store.touch(name).await {
                    tracing::warn!(project = %name, error = %e, "failed to record activity");
                }
                Ok(written)
            }
            Err(e) => {
                handle.fail(e.to_string());
                Err(e)
            }
        }
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub async fn status(&self, name: &str) -> DashboardResult<ProbeResult> {
        let record = self.store.require(name).await?;
        Ok(self.status_probe.probe(&record).await?)
    }

    pub async fn services(&self, name: &str) -> DashboardResult<Vec<ContainerInfo>> {
        let record = self.store.require(name).await?;
        Ok(self.compose.ps(&record.path).await?)
    }

    pub async fn logs(&self, name: &str, service: Option<&str>, tail: u32) -> DashboardResult<String> {
        let record = self.store.require(name).await?;
        if let Some(service) = service {
            let known = record.ports.keys().any(|s| s.as_str() == service);
            if !known {
                return Err(DashboardError::Validation(format!(
                    "Project '{}' has no '{}' service",
                    name, service
                )));
            }
        }
        let output = self
            .compose
            .run(&self.compose.logs(&record.path, service, tail))
            .await?
            .into_result()?;
        Ok(output.stdout)
    }

    // ── Ad-hoc commands ──────────────────────────────────────────────

    /// Run `spec` while mirroring output to `command_output` events.
    async fn run_adhoc(&self, name: &str, spec: CommandSpec) -> DashboardResult<CommandOutput> {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_output(rx, self.events.clone(), name.to_string(), None));
        let output = self
            .executor()
            .run_streaming(&spec, tx, CancellationToken::new())
            .await;
        let _ = forwarder.await;
        if let Err(e) = self.store.touch(name).await {
            tracing::warn!(project = %name, error = %e, "failed to record activity");
        }
        Ok(output?)
    }

    /// Terminal: run `command` in the project directory, or inside the app
    /// container when `container` is set. A non-zero exit is returned as output.
    pub async fn exec(&self, name: &str, command: &str, container: bool) -> DashboardResult<CommandOutput> {
        let record = self.store.require(name).await?;
        if command.trim().is_empty() {
            return Err(DashboardError::Validation("Command is required".into()));
        }
        let spec = if container {
            self.compose.exec(&record.path, "app", ["sh", "-c", command])
        } else {
            host_shell(command)
                .cwd(&record.path)
                .timeout(self.command_timeout())
        };
        tracing::debug!(project = name, command, container, "terminal command");
        self.run_adhoc(name, spec).await
    }

    pub async fn artisan(&self, name: &str, command: &str) -> DashboardResult<CommandOutput> {
        let record = self.store.require(name).await?;
        if record.template != Template::Laravel {
            return Err(DashboardError::Validation(format!(
                "Project '{}' is not a Laravel project",
                name
            )));
        }
        let mut args: Vec<String> = vec!["php".into(), "artisan".into()];
        args.extend(command.split_whitespace().map(str::to_string));
        if args.len() == 2 {
            return Err(DashboardError::Validation("Artisan command is required".into()));
        }
        let spec = self.compose.exec(&record.path, "app", args);
        self.run_adhoc(name, spec).await
    }

    // ── Env ──────────────────────────────────────────────────────────

    pub async fn read_env(&self, name: &str) -> DashboardResult<BTreeMap<String, String>> {
        let record = self.store.require(name).await?;
        env::read_env_file(&record.env_file()).await
    }

    pub async fn write_env(
        &self,
        name: &str,
        updates: BTreeMap<String, String>,
    ) -> DashboardResult<BTreeMap<String, String>> {
        let record = self.store.require(name).await?;
        let handle = self.operations.begin(name, OperationKind::Env)?;
        handle.step("Updating .env");
        let result = async {
            env::write_env_file(&record.env_file(), &updates).await?;
            env::read_env_file(&record.env_file()).await
        }
        .await;
        match result {
            Ok(values) => {
                handle.succeed();
                if let Err(e) = self.store.touch(name).await {
                    tracing::warn!(project = %name, error = %e, "failed to record activity");
                }
                Ok(values)
            }
            Err(e) => {
                handle.fail(e.to_string());
                Err(e)
            }
        }
    }

    // ── Dependencies ─────────────────────────────────────────────────

    pub async fn dependencies(&self, name: &str) -> DashboardResult<DependencyList> {
        let record = self.store.require(name).await?;
        deps::list_dependencies(&record.path).await
    }

    pub async fn add_dependency(
        self: &Arc<Self>,
        name: &str,
        manager: PackageManager,
        package: &str,
        dev: bool,
    ) -> DashboardResult<String> {
        deps::validate_package(manager, package)?;
        let spec = deps::install_command(manager, package, dev);
        self.run_dependency_op(name, OperationKind::Install, format!("Installing {}", package), spec)
            .await
    }

    pub async fn remove_dependency(
        self: &Arc<Self>,
        name: &str,
        manager: PackageManager,
        package: &str,
    ) -> DashboardResult<String> {
        deps::validate_package(manager, package)?;
        let spec = deps::remove_command(manager, package);
        self.run_dependency_op(name, OperationKind::Uninstall, format!("Removing {}", package), spec)
            .await
    }

    async fn run_dependency_op(
        self: &Arc<Self>,
        name: &str,
        kind: OperationKind,
        step: String,
        spec: CommandSpec,
    ) -> DashboardResult<String> {
        let record = self.store.require(name).await?;
        let handle = self.operations.begin(name, kind)?;
        let operation_id = handle.id().to_string();
        let spec = spec.cwd(&record.path).timeout(self.command_timeout());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            handle.step(&step);
            // Dependency changes leave the project status alone.
            match handle.exec(manager.executor(), &spec).await {
                Ok(_) => {
                    if let Err(e) = manager.store.touch(&record.name).await {
                        tracing::warn!(project = %record.name, error = %e, "failed to record activity");
                    }
                    handle.succeed();
                }
                Err(ExecError::Cancelled) => handle.cancelled(),
                Err(e) => handle.fail(e.to_string()),
            }
        });
        Ok(operation_id)
    }
}

/// Write the generated files into the project directory. An existing `.env`
/// keeps its other keys; generated keys overwrite theirs.
pub async fn write_project_files(record: &ProjectRecord) -> DashboardResult<Vec<String>> {
    let files = templates::project_files(record)?;
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let target: PathBuf = record.path.join(file.path);
        if file.path == ".env" && target.exists() {
            let generated = env::parse_env(&file.content)?;
            env::write_env_file(&target, &generated).await?;
        } else {
            let content = file.content;
            let dest = target.clone();
            tokio::task::spawn_blocking(move || write_atomic(&dest, content.as_bytes()))
                .await
                .context("file write task panicked")??;
        }
        written.push(file.path.to_string());
    }
    Ok(written)
}

/// Give an `npm init` package a runnable entry point and `dev`/`start` scripts.
async fn prepare_node_package(record: &ProjectRecord) -> DashboardResult<()> {
    let manifest_path = record.path.join("package.json");
    let mut manifest: serde_json::Value = match tokio::fs::read_to_string(&manifest_path).await {
        Ok(content) => serde_json::from_str(&content).context("package.json is not valid JSON")?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => json!({ "name": record.name, "version": "1.0.0" }),
        Err(e) => return Err(anyhow::Error::new(e).context("Failed to read package.json").into()),
    };
    if let Some(object) = manifest.as_object_mut() {
        let scripts = object.entry("scripts").or_insert_with(|| json!({}));
        if let Some(scripts) = scripts.as_object_mut() {
            scripts
                .entry("dev")
                .or_insert_with(|| json!("node index.js"));
            scripts
                .entry("start")
                .or_insert_with(|| json!("node index.js"));
        }
    }
    let bytes = serde_json::to_vec_pretty(&manifest).context("Failed to serialize package.json")?;
    tokio::fs::write(&manifest_path, bytes)
        .await
        .context("Failed to write package.json")?;

    let entry = record.path.join("index.js");
    if !entry.exists() {
        let content = templates::render(NODE_ENTRY, &SlotValues::for_project(record))?;
        tokio::fs::write(&entry, content)
            .await
            .context("Failed to write index.js")?;
    }
    Ok(())
}
