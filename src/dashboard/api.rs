use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use super::compose::ComposeClient;
use super::deps::PackageManager;
use super::executor::CommandExecutor;
use super::hosts::{DEFAULT_IP, HostsFile};
use super::models::{DomainMapping, NgrokSettings, ProxyRoute, ServiceKind};
use super::operations::OperationRegistry;
use super::ports::{PortProbe, used_ports};
use super::projects::{CreateProjectRequest, ProjectManager};
use super::proxy::ProxyRegistry;
use super::status::{ArtisanInspector, ComposeStatusProbe, QueueInspector, StatusProbe};
use super::store::ProjectStore;
use super::templates;
use super::tunnel::TunnelManager;
use super::ws::ws_handler;
use crate::config::DevdockConfig;
use crate::errors::DashboardError;
use crate::util::normalize_host;

/// Lines of log output returned when `tail` is not given.
const DEFAULT_LOG_TAIL: u32 = 200;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub config: Arc<DevdockConfig>,
    pub ws_tx: broadcast::Sender<String>,
    pub store: Arc<ProjectStore>,
    pub projects: Arc<ProjectManager>,
    pub operations: Arc<OperationRegistry>,
    pub status_probe: Arc<dyn StatusProbe>,
    pub queues: Arc<dyn QueueInspector>,
    pub hosts: HostsFile,
    pub proxy: Arc<ProxyRegistry>,
    pub tunnels: TunnelManager,
    pub port_probe: Arc<dyn PortProbe>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire every service over one executor and port probe.
    pub fn new(
        config: DevdockConfig,
        executor: Arc<dyn CommandExecutor>,
        port_probe: Arc<dyn PortProbe>,
    ) -> SharedState {
        let config = Arc::new(config);
        let (ws_tx, _rx) = broadcast::channel::<String>(256);
        let store = Arc::new(ProjectStore::open(config.projects_file()));
        let operations = OperationRegistry::new(ws_tx.clone());
        let compose = ComposeClient::new(executor, &config.docker);
        let status_probe: Arc<dyn StatusProbe> = Arc::new(ComposeStatusProbe::new(compose.clone()));
        let projects = ProjectManager::new(
            Arc::clone(&config),
            Arc::clone(&store),
            compose.clone(),
            Arc::clone(&operations),
            Arc::clone(&port_probe),
            Arc::clone(&status_probe),
        );

        Arc::new(Self {
            ws_tx,
            store,
            projects,
            operations,
            status_probe,
            queues: Arc::new(ArtisanInspector::new(compose)),
            hosts: HostsFile::new(config.paths.hosts_file.clone()),
            proxy: Arc::new(ProxyRegistry::open(config.proxy_file())),
            tunnels: TunnelManager::new(&config.ngrok, config.ngrok_file()),
            port_probe,
            config,
        })
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub container: bool,
}

#[derive(Deserialize)]
pub struct ArtisanRequest {
    pub command: String,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub service: Option<String>,
    pub tail: Option<u32>,
}

#[derive(Deserialize)]
pub struct AddDependencyRequest {
    pub manager: PackageManager,
    pub package: String,
    #[serde(default)]
    pub dev: bool,
}

#[derive(Deserialize)]
pub struct ManagerQuery {
    pub manager: PackageManager,
}

#[derive(Deserialize)]
pub struct AddDomainRequest {
    pub domain: String,
    pub project: Option<String>,
    pub ip: Option<String>,
}

#[derive(Deserialize)]
pub struct StartTunnelRequest {
    pub project: String,
}

#[derive(Serialize)]
pub struct PortCheck {
    pub port: u16,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
}

#[derive(Serialize)]
pub struct NgrokConfigView {
    pub authtoken_set: bool,
    pub region: Option<String>,
}

impl From<NgrokSettings> for NgrokConfigView {
    fn from(settings: NgrokSettings) -> Self {
        Self {
            authtoken_set: settings.authtoken.is_some_and(|t| !t.is_empty()),
            region: settings.region,
        }
    }
}

// ── Envelope and error handling ───────────────────────────────────────

fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}

fn accepted<T: Serialize>(data: T) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::ACCEPTED, ok(data))
}

pub struct ApiError(DashboardError);

impl<E: Into<DashboardError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            DashboardError::ProjectNotFound(_) | DashboardError::NotFound(_) => StatusCode::NOT_FOUND,
            DashboardError::Validation(_) | DashboardError::Port(_) => StatusCode::BAD_REQUEST,
            DashboardError::Conflict(_) => StatusCode::CONFLICT,
            DashboardError::Permission { .. } => StatusCode::FORBIDDEN,
            DashboardError::ExternalTool(_)
            | DashboardError::Exec(_)
            | DashboardError::Status(_)
            | DashboardError::Template(_)
            | DashboardError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            let message = format!("{:#}", self.0);
            tracing::error!(error = %message, "request failed");
        }
        let body = match &self.0 {
            DashboardError::Permission {
                message,
                instructions,
            } => json!({
                "success": false,
                "error": message,
                "instructions": instructions,
            }),
            // Keep the context chain for wrapped errors.
            DashboardError::Other(e) => json!({ "success": false, "error": format!("{:#}", e) }),
            other => json!({ "success": false, "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{name}", get(get_project).delete(delete_project))
        .route("/api/projects/{name}/start", post(start_project))
        .route("/api/projects/{name}/stop", post(stop_project))
        .route("/api/projects/{name}/restart", post(restart_project))
        .route("/api/projects/{name}/rebuild", post(rebuild_project))
        .route("/api/projects/{name}/status", get(project_status))
        .route("/api/projects/{name}/regenerate-docker", post(regenerate_docker))
        .route("/api/projects/{name}/exec", post(exec_command))
        .route("/api/projects/{name}/env", get(get_env).put(put_env))
        .route("/api/projects/{name}/artisan", post(run_artisan))
        .route("/api/projects/{name}/queue", get(queue_status))
        .route("/api/projects/{name}/schedule", get(schedule_list))
        .route("/api/projects/{name}/services", get(list_services))
        .route("/api/projects/{name}/logs", get(project_logs))
        .route(
            "/api/projects/{name}/dependencies",
            get(list_dependencies).post(add_dependency),
        )
        .route(
            "/api/projects/{name}/dependencies/{*package}",
            axum::routing::delete(remove_dependency),
        )
        .route("/api/templates", get(list_templates))
        .route("/api/domains", get(list_domains).post(add_domain))
        .route("/api/domains/{domain}", axum::routing::delete(remove_domain))
        .route("/api/proxy/routes", get(list_proxy_routes).post(add_proxy_route))
        .route("/api/proxy/routes/{domain}", axum::routing::delete(remove_proxy_route))
        .route("/api/ngrok/tunnels", get(list_tunnels).post(start_tunnel))
        .route("/api/ngrok/tunnels/{project}", axum::routing::delete(stop_tunnel))
        .route("/api/ngrok/config", get(get_ngrok_config).put(put_ngrok_config))
        .route("/api/operations", get(list_operations))
        .route("/api/operations/{id}", get(get_operation))
        .route("/api/operations/{id}/cancel", post(cancel_operation))
        .route("/api/ports/check/{port}", get(check_port))
        .route("/ws", get(ws_handler))
}

// ── Handlers: projects ────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<SharedState>) -> impl IntoResponse {
    ok(state.projects.list().await)
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<impl IntoResponse> {
    let (project, operation_id) = state.projects.create(req).await?;
    Ok(accepted(json!({ "project": project, "operation_id": operation_id })))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.projects.get(&name).await?))
}

/// Delete the project, then drop its proxy routes, hosts entries and tunnel.
async fn delete_project(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = state.projects.delete(&name).await?;

    if let Err(e) = state.proxy.remove_project(&name).await {
        tracing::warn!(project = %name, error = %e, "failed to remove proxy routes");
    }
    match state.hosts.remove_project(&name).await {
        Ok(0) => {}
        Ok(count) => tracing::info!(project = %name, count, "hosts entries removed"),
        Err(e) => tracing::warn!(project = %name, error = %e, "hosts entries left in place"),
    }
    if state.tunnels.stop(&name).await.is_ok() {
        tracing::info!(project = %name, "tunnel stopped with project");
    }

    Ok(ok(removed))
}

async fn start_project(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let operation_id = state.projects.start(&name).await?;
    Ok(accepted(json!({ "operation_id": operation_id })))
}

async fn stop_project(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let operation_id = state.projects.stop(&name).await?;
    Ok(accepted(json!({ "operation_id": operation_id })))
}

async fn restart_project(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let operation_id = state.projects.restart(&name).await?;
    Ok(accepted(json!({ "operation_id": operation_id })))
}

async fn rebuild_project(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let operation_id = state.projects.rebuild(&name).await?;
    Ok(accepted(json!({ "operation_id": operation_id })))
}

async fn project_status(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.projects.status(&name).await?))
}

async fn regenerate_docker(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let files = state.projects.regenerate(&name).await?;
    Ok(ok(json!({ "files": files })))
}

async fn list_templates(State(state): State<SharedState>) -> impl IntoResponse {
    ok(templates::catalog(&state.config.ports))
}

// ── Handlers: terminal, env, laravel ──────────────────────────────────

async fn exec_command(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.projects.exec(&name, &req.command, req.container).await?))
}

async fn get_env(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.projects.read_env(&name).await?))
}

async fn put_env(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(updates): Json<BTreeMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    if updates.is_empty() {
        return Err(DashboardError::Validation("No env values supplied".into()).into());
    }
    Ok(ok(state.projects.write_env(&name, updates).await?))
}

async fn run_artisan(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(req): Json<ArtisanRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.projects.artisan(&name, &req.command).await?))
}

async fn queue_status(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state.store.require(&name).await?;
    Ok(ok(state.queues.queues(&record).await?))
}

async fn schedule_list(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state.store.require(&name).await?;
    Ok(ok(state.queues.schedule(&record).await?))
}

async fn list_services(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.projects.services(&name).await?))
}

async fn project_logs(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let service = query.service.as_deref().filter(|s| !s.is_empty());
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL);
    let logs = state.projects.logs(&name, service, tail).await?;
    Ok(ok(json!({ "logs": logs })))
}

// ── Handlers: dependencies ────────────────────────────────────────────

async fn list_dependencies(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.projects.dependencies(&name).await?))
}

async fn add_dependency(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(req): Json<AddDependencyRequest>,
) -> ApiResult<impl IntoResponse> {
    let operation_id = state
        .projects
        .add_dependency(&name, req.manager, req.package.trim(), req.dev)
        .await?;
    Ok(accepted(json!({ "operation_id": operation_id })))
}

async fn remove_dependency(
    State(state): State<SharedState>,
    Path((name, package)): Path<(String, String)>,
    Query(query): Query<ManagerQuery>,
) -> ApiResult<impl IntoResponse> {
    let package = package.trim_start_matches('/');
    let operation_id = state
        .projects
        .remove_dependency(&name, query.manager, package)
        .await?;
    Ok(accepted(json!({ "operation_id": operation_id })))
}

// ── Handlers: domains and proxy ───────────────────────────────────────

async fn list_domains(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.hosts.list().await?))
}

async fn add_domain(
    State(state): State<SharedState>,
    Json(req): Json<AddDomainRequest>,
) -> ApiResult<impl IntoResponse> {
    if let Some(project) = &req.project {
        state.store.require(project).await?;
    }
    let mapping = DomainMapping {
        domain: normalize_host(&req.domain),
        ip: req.ip.unwrap_or_else(|| DEFAULT_IP.to_string()),
        project: req.project,
    };
    let mappings = state.hosts.add(mapping).await?;
    Ok((StatusCode::CREATED, ok(mappings)))
}

async fn remove_domain(
    State(state): State<SharedState>,
    Path(domain): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.hosts.remove(&normalize_host(&domain)).await?))
}

async fn list_proxy_routes(State(state): State<SharedState>) -> impl IntoResponse {
    ok(state.proxy.list().await)
}

async fn add_proxy_route(
    State(state): State<SharedState>,
    Json(mut route): Json<ProxyRoute>,
) -> ApiResult<impl IntoResponse> {
    route.domain = normalize_host(&route.domain);
    if let Some(project) = &route.project {
        state.store.require(project).await?;
    }
    let saved = state.proxy.add(route).await?;
    Ok((StatusCode::CREATED, ok(saved)))
}

async fn remove_proxy_route(
    State(state): State<SharedState>,
    Path(domain): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.proxy.remove(&normalize_host(&domain)).await?))
}

// ── Handlers: ngrok ───────────────────────────────────────────────────

async fn list_tunnels(State(state): State<SharedState>) -> impl IntoResponse {
    ok(state.tunnels.list().await)
}

async fn start_tunnel(
    State(state): State<SharedState>,
    Json(req): Json<StartTunnelRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = state.store.require(&req.project).await?;
    let port = record.port(ServiceKind::App).ok_or_else(|| {
        DashboardError::Validation(format!("Project '{}' has no app port", record.name))
    })?;
    let tunnel = state.tunnels.start(&record.name, port).await?;
    Ok((StatusCode::CREATED, ok(tunnel)))
}

async fn stop_tunnel(
    State(state): State<SharedState>,
    Path(project): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.tunnels.stop(&project).await?))
}

async fn get_ngrok_config(State(state): State<SharedState>) -> impl IntoResponse {
    ok(NgrokConfigView::from(state.tunnels.settings().await))
}

async fn put_ngrok_config(
    State(state): State<SharedState>,
    Json(settings): Json<NgrokSettings>,
) -> ApiResult<impl IntoResponse> {
    let saved = state.tunnels.update_settings(settings).await?;
    Ok(ok(NgrokConfigView::from(saved)))
}

// ── Handlers: operations and ports ────────────────────────────────────

async fn list_operations(State(state): State<SharedState>) -> impl IntoResponse {
    ok(state.operations.list())
}

async fn get_operation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let op = state
        .operations
        .get(&id)
        .ok_or_else(|| DashboardError::NotFound(format!("Operation '{}'", id)))?;
    Ok(ok(op))
}

async fn cancel_operation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.operations.cancel(&id)?))
}

async fn check_port(
    State(state): State<SharedState>,
    Path(port): Path<u16>,
) -> ApiResult<impl IntoResponse> {
    if port == 0 {
        return Err(DashboardError::Validation("Port must be between 1 and 65535".into()).into());
    }
    let records = state.store.list().await;
    let used_by = used_ports(records.iter()).remove(&port);
    let available = used_by.is_none() && state.port_probe.is_free(port);
    Ok(ok(PortCheck {
        port,
        available,
        used_by,
    }))
}
