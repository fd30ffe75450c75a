//! Pooled HTTP client for forwarding requests to project backends
//!
//! Backends listen on 127.0.0.1; the pool keeps idle keep-alive connections
//! per port so a busy project does not pay a TCP handshake per request.

use crate::error::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client (connect refused, reset, ...)
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building the outbound request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Counters for forwarded traffic
#[derive(Debug, Default)]
pub struct PoolStats {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Build the loopback URI for a backend port and forwarded path
pub fn backend_uri(port: u16, path_and_query: &str) -> String {
    format!("http://127.0.0.1:{}{}", port, path_and_query)
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `127.0.0.1:<port>` at `path_and_query`.
    ///
    /// Method, headers and body are passed through with `Host` rewritten to
    /// the backend address. Both bodies stream; nothing is buffered here.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
        path_and_query: &str,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let backend_req = build_backend_request(req, port, path_and_query)?;

        self.stats.record_request();
        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn build_backend_request<B>(req: Request<B>, port: u16, path_and_query: &str) -> Result<Request<B>, PoolError> {
    let (parts, body) = req.into_parts();
    let mut builder = Request::builder()
        .method(parts.method)
        .uri(backend_uri(port, path_and_query));

    for (key, value) in parts.headers.iter() {
        if key != HOST {
            builder = builder.header(key, value);
        }
    }

    let host = HeaderValue::from_str(&format!("127.0.0.1:{}", port))
        .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

    builder
        .header(HOST, host)
        .body(body)
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}
