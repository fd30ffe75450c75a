use crate::api;
use crate::config::Config;
use crate::error::{full_body, text_error_response, ProxyBody, ProxyErrorCode};
use crate::lifecycle::LifecycleController;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::RegistryStore;
use crate::visitors::{VisitorEntry, VisitorLog};
use chrono::Utc;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, USER_AGENT};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Client address as seen by the upstream ingress
const X_REAL_IP: &str = "x-real-ip";

const PROXY_PREFIX: &str = "/proxy/";
const API_PREFIX: &str = "/api/";

/// Everything a request handler needs, shared across connections
pub struct AppState {
    pub config: Config,
    pub registry: Arc<RegistryStore>,
    pub visitors: VisitorLog,
    pub lifecycle: Arc<LifecycleController>,
    pub pool: ConnectionPool,
    started: Instant,
}

impl AppState {
    pub fn new(config: Config, lifecycle: Arc<LifecycleController>) -> Arc<Self> {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: std::time::Duration::from_secs(config.server.pool_idle_timeout_secs),
        });

        Arc::new(Self {
            registry: Arc::new(RegistryStore::new(config.storage.registry_path.clone())),
            visitors: VisitorLog::new(
                config.storage.visitor_log_path.clone(),
                config.storage.visitor_log_cap,
            ),
            lifecycle,
            pool,
            config,
            started: Instant::now(),
        })
    }

    /// Seconds since the state was created
    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// The loopback HTTP listener serving proxy, API and health routes
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener. Port 0 picks an ephemeral port.
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<AppState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            state,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let path = req.uri().path();

    if path.starts_with(API_PREFIX) {
        return Ok(api::handle(req, &state).await);
    }
    if path.starts_with(PROXY_PREFIX) {
        return Ok(proxy_request(req, &state, client_addr).await);
    }
    if path == "/health" {
        return Ok(health_response(&state));
    }

    Ok(text_error_response(ProxyErrorCode::NotFound, "Not Found"))
}

fn health_response(state: &AppState) -> Response<ProxyBody> {
    let stats = state.pool.stats();
    let body = serde_json::json!({
        "status": "ok",
        "uptime": state.uptime_secs(),
        "forwarded": {
            "total": stats.total_requests(),
            "failed": stats.failed_requests(),
        },
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Split `/proxy/<slug>/<rest>` into the slug and the forwarded path.
///
/// The slug is `[a-z0-9-]+` and must be followed by a slash. The forwarded
/// path is `/` + rest, query string included.
pub fn parse_proxy_path(path_and_query: &str) -> Option<(&str, String)> {
    let tail = path_and_query.strip_prefix(PROXY_PREFIX)?;
    let (slug, rest) = tail.split_once('/')?;

    let valid = !slug.is_empty()
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !valid {
        return None;
    }

    Some((slug, format!("/{}", rest)))
}

async fn proxy_request(
    mut req: Request<Incoming>,
    state: &AppState,
    client_addr: SocketAddr,
) -> Response<ProxyBody> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let Some((slug, rest)) = parse_proxy_path(&path_and_query) else {
        return text_error_response(ProxyErrorCode::NotFound, "Not Found");
    };

    let registry = state.registry.load().await;
    let Some(target) = registry.project(slug).and_then(|p| p.dynamic_target()) else {
        debug!(slug, "Unknown or non-dynamic project");
        return text_error_response(
            ProxyErrorCode::UnknownProject,
            format!("Project '{}' not found", slug),
        );
    };

    record_visit(state, slug, &req, client_addr, &path_and_query).await;

    if !state.lifecycle.is_running(&target.container).await {
        info!(slug, container = %target.container, "Project is stopped, serving holding page");
        state.lifecycle.trigger_start(&target.container);
        return holding_page(slug, state.config.server.holding_refresh_secs);
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    // the upstream ingress is trusted; only fill the chain in when it is missing
    if !headers.contains_key(X_FORWARDED_FOR) {
        if let Ok(value) = HeaderValue::from_str(&client_ip(headers, client_addr)) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    debug!(slug, port = target.port, path = %rest, request_id, "Forwarding request");

    let request_timeout = state.config.server.request_timeout();
    match tokio::time::timeout(request_timeout, state.pool.forward(req, target.port, &rest)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(slug, port = target.port, error = %e, "Failed to forward request");
            text_error_response(
                ProxyErrorCode::BackendUnavailable,
                format!("Project '{}' is not responding. Try again in a moment.", slug),
            )
        }
        Err(_) => {
            warn!(
                slug,
                port = target.port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            text_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Project '{}' did not respond within {} seconds.",
                    slug,
                    request_timeout.as_secs()
                ),
            )
        }
    }
}

/// `X-Real-IP` as set by the upstream ingress, else the peer address
fn client_ip(headers: &HeaderMap, client_addr: SocketAddr) -> String {
    headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| client_addr.ip().to_string())
}

/// Append to the visitor log and bump the registry counters.
/// Both writes finish before the request is forwarded; failures are logged only.
async fn record_visit<B>(
    state: &AppState,
    slug: &str,
    req: &Request<B>,
    client_addr: SocketAddr,
    path_and_query: &str,
) {
    let ip = client_ip(req.headers(), client_addr);
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let now = Utc::now();
    let entry = VisitorEntry {
        timestamp: now,
        slug: slug.to_string(),
        ip,
        user_agent,
        path: path_and_query.to_string(),
    };

    let (logged, accessed) = tokio::join!(
        state.visitors.append(entry),
        state.registry.record_access(slug, now)
    );
    if let Err(e) = logged {
        warn!(slug, error = %e, "Failed to append visitor log");
    }
    if let Err(e) = accessed {
        warn!(slug, error = %e, "Failed to record project access");
    }
}

fn holding_page(slug: &str, refresh_secs: u64) -> Response<ProxyBody> {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="{refresh}">
<title>{slug} - Starting...</title>
<style>
  body {{ background: #0a0a0f; color: #e2e8f0; font-family: Inter, sans-serif;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }}
  .box {{ text-align: center; }}
  .spinner {{ display: inline-block; width: 40px; height: 40px; border: 3px solid #1f2937;
             border-top-color: #60a5fa; border-radius: 50%;
             animation: spin 0.8s linear infinite; margin-bottom: 1rem; }}
  @keyframes spin {{ to {{ transform: rotate(360deg); }} }}
  h2 {{ font-size: 1.25rem; margin-bottom: 0.5rem; }}
  p {{ color: #64748b; font-size: 0.875rem; }}
</style>
</head>
<body>
<div class="box">
  <div class="spinner"></div>
  <h2>Starting {slug}...</h2>
  <p>Cold-starting container. Page will refresh automatically.</p>
</div>
</body>
</html>
"#,
        refresh = refresh_secs,
        slug = slug,
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header("Refresh", refresh_secs.to_string())
        .header(CACHE_CONTROL, "no-store")
        .body(full_body(html))
        .expect("valid response with StatusCode enum and static headers")
}
