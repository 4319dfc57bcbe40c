//! Domain → local port routing.
//!
//! Routes persist in `proxy-config.json`. When enabled, a second listener
//! forwards each request to `127.0.0.1:<port>` chosen by its `Host` header.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::models::ProxyRoute;
use super::store::JsonDocument;
use crate::errors::{DashboardError, DashboardResult};
use crate::util::{normalize_host, validate_domain};

/// Largest request body the proxy will buffer.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyRegistry {
    doc: JsonDocument<Vec<ProxyRoute>>,
}

impl ProxyRegistry {
    pub fn open(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            doc: JsonDocument::open(path),
        }
    }

    pub async fn list(&self) -> Vec<ProxyRoute> {
        let mut routes = self.doc.snapshot().await;
        routes.sort_by(|a, b| a.domain.cmp(&b.domain));
        routes
    }

    /// Port for a `Host` header value, if a route matches.
    pub async fn lookup(&self, host: &str) -> Option<u16> {
        let host = normalize_host(host);
        self.doc
            .snapshot()
            .await
            .into_iter()
            .find(|r| r.domain == host)
            .map(|r| r.port)
    }

    /// Add a route, replacing any existing route for the same domain.
    pub async fn add(&self, route: ProxyRoute) -> DashboardResult<ProxyRoute> {
        validate_domain(&route.domain)?;
        if route.port == 0 {
            return Err(DashboardError::Validation("Port must be between 1 and 65535".into()));
        }
        let saved = self
            .doc
            .update(move |routes| {
                routes.retain(|r| r.domain != route.domain);
                routes.push(route.clone());
                Ok(route)
            })
            .await?;
        tracing::info!(domain = %saved.domain, port = saved.port, "proxy route saved");
        Ok(saved)
    }

    pub async fn remove(&self, domain: &str) -> DashboardResult<ProxyRoute> {
        let domain = domain.to_string();
        self.doc
            .update(move |routes| {
                let index = routes
                    .iter()
                    .position(|r| r.domain == domain)
                    .ok_or_else(|| DashboardError::NotFound(format!("Proxy route '{}'", domain)))?;
                Ok(routes.remove(index))
            })
            .await
    }

    pub async fn remove_project(&self, project: &str) -> DashboardResult<usize> {
        let project = project.to_string();
        self.doc
            .update(move |routes| {
                let before = routes.len();
                routes.retain(|r| r.project.as_deref() != Some(project.as_str()));
                Ok(before - routes.len())
            })
            .await
    }
}

// ── Reverse proxy listener ───────────────────────────────────────────

#[derive(Clone)]
struct ProxyState {
    routes: Arc<ProxyRegistry>,
    client: reqwest::Client,
}

fn bad_gateway(message: String) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

async fn forward(State(state): State<ProxyState>, request: Request) -> Response {
    let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
    else {
        return bad_gateway("Missing Host header".into());
    };
    let Some(port) = state.routes.lookup(&host).await else {
        return bad_gateway(format!("No proxy route for host '{}'", normalize_host(&host)));
    };

    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://127.0.0.1:{}{}", port, path);

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return bad_gateway(format!("Failed to read request body: {}", e)),
    };

    let mut headers = HeaderMap::new();
    copy_headers(&parts.headers, &mut headers);
    if let Ok(value) = "http".parse() {
        headers.insert(HeaderName::from_static("x-forwarded-proto"), value);
    }
    if let Ok(value) = host.parse() {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }

    let upstream = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(url, error = %e, "proxy upstream unreachable");
            return bad_gateway(format!("Upstream 127.0.0.1:{} unreachable: {}", port, e));
        }
    };

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    copy_headers(upstream.headers(), &mut response_headers);
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return bad_gateway(format!("Failed to read upstream response: {}", e)),
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    // Length is recomputed from the buffered body.
    response_headers.remove(header::CONTENT_LENGTH);
    *response.headers_mut() = response_headers;
    response
}

/// Router that forwards every request by `Host` header.
pub fn proxy_router(routes: Arc<ProxyRegistry>) -> anyhow::Result<Router> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    Ok(Router::new()
        .fallback(forward)
        .with_state(ProxyState { routes, client }))
}

/// Serve the proxy on `listen` until `cancel` fires.
pub async fn run_proxy(
    listen: &str,
    routes: Arc<ProxyRegistry>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = proxy_router(routes)?;
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listen, "reverse proxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
