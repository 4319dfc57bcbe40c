use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    http::{StatusCode, Uri},
    response::IntoResponse,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState, SharedState};
use super::executor::SystemExecutor;
use super::ports::BindProbe;
use super::proxy::run_proxy;
use super::status::Poller;
use super::store::DataDirLock;
use crate::config::DevdockConfig;

/// Build the full application router: API, WebSocket and a JSON 404 fallback.
pub fn build_router(state: SharedState) -> Router {
    let dev_mode = state.config.server.dev_mode;
    let app = api::api_router().fallback(not_found).with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": format!("No route for {}", uri.path()) })),
    )
}

/// Run the dashboard until Ctrl+C.
pub async fn start_server(config: DevdockConfig, open_browser: bool) -> Result<()> {
    let _lock = DataDirLock::acquire(&config.paths.data_dir)?;
    tokio::fs::create_dir_all(&config.paths.projects_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.paths.projects_dir.display()))?;

    let state = AppState::new(config, Arc::new(SystemExecutor), Arc::new(BindProbe));
    recover_interrupted(&state).await?;
    let config = Arc::clone(&state.config);
    let cancel = CancellationToken::new();

    if config.poller.enabled {
        let poller = Poller {
            store: Arc::clone(&state.store),
            probe: Arc::clone(&state.status_probe),
            operations: Arc::clone(&state.operations),
            events: state.ws_tx.clone(),
            interval: Duration::from_secs(config.poller.interval_secs.max(1)),
        };
        tokio::spawn(poller.run(cancel.child_token()));
    }

    let proxy_task = if config.proxy.enabled {
        let routes = Arc::clone(&state.proxy);
        let listen = config.proxy.listen.clone();
        let token = cancel.child_token();
        Some(tokio::spawn(async move {
            if let Err(e) = run_proxy(&listen, routes, token).await {
                tracing::error!(addr = %listen, error = %format!("{:#}", e), "reverse proxy stopped");
            }
        }))
    } else {
        None
    };

    let app = build_router(Arc::clone(&state));
    let host = if config.server.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    let url = format!("http://localhost:{}", local_addr.port());
    tracing::info!(addr = %local_addr, projects_dir = %config.paths.projects_dir.display(), "devdock running");
    println!("devdock running at {}", url);

    if open_browser {
        if let Err(e) = open::that(&url) {
            tracing::warn!(error = %e, "could not open browser");
        }
    }

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    state.tunnels.stop_all().await;
    if let Some(task) = proxy_task {
        let _ = task.await;
    }
    tracing::info!("server shut down");
    println!("Server shut down gracefully.");
    Ok(())
}

/// A previous process died mid-create or mid-stop; nothing will finish
/// those records, so surface them as errors the user can act on.
async fn recover_interrupted(state: &SharedState) -> Result<()> {
    let recovered = state
        .store
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted projects")?;
    for record in &recovered {
        tracing::warn!(project = %record.name, "project was interrupted by a restart; marked as error");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
