//! Integration tests for project-proxy
//!
//! Each test runs a real `ProxyServer` on an ephemeral loopback port, backed by
//! a temp-dir registry, an in-memory container runtime and, where needed, a
//! tiny TCP backend standing in for a project container.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use project_proxy::config::Config;
use project_proxy::docker::{ContainerRuntime, RuntimeError, SharedRuntime};
use project_proxy::lifecycle::{LifecycleController, StartPolicy};
use project_proxy::proxy::{AppState, ProxyServer};
use project_proxy::registry::{ProjectEntry, Registry};
use project_proxy::watchdog::IdleWatchdog;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Test doubles
// ============================================================================

/// Container runtime that tracks state in memory
#[derive(Default)]
struct FakeRuntime {
    running: Mutex<HashSet<String>>,
    start_calls: Mutex<Vec<String>>,
    stop_calls: Mutex<Vec<String>>,
    start_delay: Mutex<Duration>,
}

impl FakeRuntime {
    fn set_running(&self, container: &str) {
        self.running.lock().insert(container.to_string());
    }

    fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    fn start_calls(&self) -> Vec<String> {
        self.start_calls.lock().clone()
    }

    fn stop_calls(&self) -> Vec<String> {
        self.stop_calls.lock().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, container: &str) -> Result<(), RuntimeError> {
        self.start_calls.lock().push(container.to_string());
        let delay = *self.start_delay.lock();
        tokio::time::sleep(delay).await;
        self.running.lock().insert(container.to_string());
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        self.stop_calls.lock().push(container.to_string());
        self.running.lock().remove(container);
        Ok(())
    }

    async fn restart(&self, container: &str) -> Result<(), RuntimeError> {
        self.running.lock().insert(container.to_string());
        Ok(())
    }

    async fn is_running(&self, container: &str) -> bool {
        self.running.lock().contains(container)
    }
}

/// Minimal HTTP/1.1 backend: answers `GET /index.html` with `hello` and
/// records every raw request it receives, head and body.
struct Backend {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl Backend {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let head_end = loop {
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    };
                    let content_length = String::from_utf8_lossy(&buf[..head_end])
                        .lines()
                        .find_map(|line| {
                            let (key, value) = line.split_once(':')?;
                            key.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    while buf.len() < head_end + content_length {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let body = if head.starts_with("GET /index.html ") {
                        "hello"
                    } else {
                        "other"
                    };
                    seen.lock().push(head);

                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Backend: fake\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            port,
            requests,
            handle,
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Accepts connections and never answers
async fn silent_backend() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            open.push(stream);
        }
    });
    (port, handle)
}

// ============================================================================
// Harness
// ============================================================================

struct TestProxy {
    addr: SocketAddr,
    state: Arc<AppState>,
    runtime: Arc<FakeRuntime>,
    lifecycle: Arc<LifecycleController>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestProxy {
    async fn start(registry: Registry) -> Self {
        Self::start_with(registry, |_| {}).await
    }

    async fn start_with(registry: Registry, configure: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.port = 0;
        config.storage.registry_path = dir.path().join("registry.json");
        config.storage.visitor_log_path = dir.path().join("visitors.json");
        configure(&mut config);

        let runtime = Arc::new(FakeRuntime::default());
        let policy = StartPolicy {
            poll_interval: Duration::from_millis(20),
            max_wait: Duration::from_secs(5),
            settle_delay: Duration::ZERO,
        };
        let lifecycle = LifecycleController::new(Arc::clone(&runtime) as SharedRuntime, policy);
        let state = AppState::new(config, Arc::clone(&lifecycle));
        state.registry.write(&registry).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&state), shutdown_rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            state,
            runtime,
            lifecycle,
            shutdown_tx,
            handle,
            _dir: dir,
        }
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.lifecycle.shutdown();
        let _ = self.handle.await;
    }
}

fn scenario_registry(port: u16) -> Registry {
    let epoch = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut registry = Registry::default();
    registry.projects.insert(
        "demo".to_string(),
        ProjectEntry::dynamic(port, "demo-c", epoch)
            .with_idle_timeout(600)
            .with_last_access(epoch),
    );
    registry
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!("{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", method, path, addr);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    http_request(addr, "GET", path, &[], "").await
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("no status line in: {}", response))
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split_once("\r\n\r\n").map(|(head, _)| head)?;
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn json_of(response: &str) -> serde_json::Value {
    serde_json::from_str(body_of(response)).unwrap_or_else(|e| panic!("invalid JSON ({}): {}", e, response))
}

fn project<'a>(listing: &'a serde_json::Value, slug: &str) -> &'a serde_json::Value {
    listing["projects"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["slug"] == slug)
        .unwrap_or_else(|| panic!("{} missing from listing", slug))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_cold_request_serves_holding_page_and_starts_once() {
    let proxy = TestProxy::start(scenario_registry(10005)).await;
    proxy.runtime.set_start_delay(Duration::from_millis(200));

    let response = http_get(proxy.addr, "/proxy/demo/index.html").await;

    assert_eq!(status_of(&response), 200, "Response: {}", response);
    assert_eq!(header_of(&response, "refresh"), Some("3"));
    assert!(header_of(&response, "content-type").unwrap().starts_with("text/html"));
    assert!(body_of(&response).contains(r#"http-equiv="refresh" content="3""#));
    assert!(body_of(&response).contains("Starting demo..."));

    // background start runs to completion without anyone awaiting it
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(proxy.runtime.start_calls(), vec!["demo-c".to_string()]);
    assert!(!proxy.lifecycle.is_starting("demo-c"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_running_project_is_proxied() {
    let backend = Backend::start().await;
    let proxy = TestProxy::start(scenario_registry(backend.port)).await;
    proxy.runtime.set_running("demo-c");

    let response = http_request(
        proxy.addr,
        "GET",
        "/proxy/demo/index.html",
        &[("User-Agent", "integration-test")],
        "",
    )
    .await;

    assert_eq!(status_of(&response), 200, "Response: {}", response);
    assert_eq!(body_of(&response), "hello");
    assert_eq!(header_of(&response, "x-backend"), Some("fake"));

    let registry = proxy.state.registry.load().await;
    let demo = registry.project("demo").unwrap();
    assert_eq!(demo.visitors, 1);
    assert!(demo.last_access.unwrap() > Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

    let seen = backend.requests();
    assert_eq!(seen.len(), 1);
    let head = seen[0].to_ascii_lowercase();
    assert!(head.starts_with("get /index.html http/1.1"), "Backend saw: {}", seen[0]);
    assert!(head.contains(&format!("host: 127.0.0.1:{}", backend.port)));
    assert!(head.contains("x-forwarded-for: 127.0.0.1"));
    assert!(head.contains("x-request-id:"));
    assert!(proxy.runtime.start_calls().is_empty());

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_query_string_forwarded() {
    let backend = Backend::start().await;
    let proxy = TestProxy::start(scenario_registry(backend.port)).await;
    proxy.runtime.set_running("demo-c");

    let response = http_get(proxy.addr, "/proxy/demo/search?q=rust&page=2").await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "other");

    let seen = backend.requests();
    assert!(seen[0].starts_with("GET /search?q=rust&page=2 HTTP/1.1"), "Backend saw: {}", seen[0]);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_request_body_reaches_backend() {
    let backend = Backend::start().await;
    let proxy = TestProxy::start(scenario_registry(backend.port)).await;
    proxy.runtime.set_running("demo-c");

    let payload = r#"{"name":"widget","qty":3}"#;
    let response = http_request(
        proxy.addr,
        "POST",
        "/proxy/demo/api/items",
        &[("Content-Type", "application/json")],
        payload,
    )
    .await;
    assert_eq!(status_of(&response), 200, "Response: {}", response);

    let seen = backend.requests();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("POST /api/items HTTP/1.1"), "Backend saw: {}", seen[0]);
    assert!(seen[0].ends_with(payload), "Backend saw: {}", seen[0]);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_forwarded_for_uses_client_address() {
    let backend = Backend::start().await;
    let proxy = TestProxy::start(scenario_registry(backend.port)).await;
    proxy.runtime.set_running("demo-c");

    http_request(proxy.addr, "GET", "/proxy/demo/index.html", &[("X-Real-IP", "203.0.113.7")], "").await;
    http_request(
        proxy.addr,
        "GET",
        "/proxy/demo/index.html",
        &[("X-Real-IP", "203.0.113.7"), ("X-Forwarded-For", "198.51.100.4, 10.0.0.2")],
        "",
    )
    .await;

    let seen = backend.requests();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].to_ascii_lowercase().contains("x-forwarded-for: 203.0.113.7\r\n"), "Backend saw: {}", seen[0]);
    assert!(
        seen[1].to_ascii_lowercase().contains("x-forwarded-for: 198.51.100.4, 10.0.0.2\r\n"),
        "Backend saw: {}",
        seen[1]
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_stop_then_listing_shows_stopped() {
    let proxy = TestProxy::start(scenario_registry(10005)).await;
    proxy.runtime.set_running("demo-c");

    let listing = json_of(&http_get(proxy.addr, "/api/projects").await);
    assert_eq!(project(&listing, "demo")["status"], "running");

    let response = http_request(proxy.addr, "POST", "/api/projects/demo/stop", &[], "").await;
    assert_eq!(status_of(&response), 200);
    let body = json_of(&response);
    assert_eq!(body["ok"], true);
    assert_eq!(body["message"], "demo stopped");

    let listing = json_of(&http_get(proxy.addr, "/api/projects").await);
    assert_eq!(project(&listing, "demo")["status"], "stopped");
    assert_eq!(proxy.runtime.stop_calls(), vec!["demo-c".to_string()]);

    proxy.shutdown().await;
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_concurrent_cold_requests_share_one_start() {
    let proxy = TestProxy::start(scenario_registry(10005)).await;
    proxy.runtime.set_start_delay(Duration::from_secs(3));

    let requests = (0..8).map(|_| http_get(proxy.addr, "/proxy/demo/index.html"));
    let responses = futures::future::join_all(requests).await;

    for response in &responses {
        assert_eq!(status_of(response), 200, "Response: {}", response);
        assert_eq!(header_of(response, "refresh"), Some("3"));
    }
    assert_eq!(proxy.runtime.start_calls(), vec!["demo-c".to_string()]);

    let registry = proxy.state.registry.load().await;
    assert_eq!(registry.project("demo").unwrap().visitors, 8);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_idle_sweep_boundary() {
    let proxy = TestProxy::start(scenario_registry(10005)).await;
    proxy.runtime.set_running("demo-c");

    let watchdog = IdleWatchdog::new(
        Arc::clone(&proxy.state.registry),
        Arc::clone(&proxy.lifecycle),
        Duration::from_secs(60),
        Duration::from_secs(10),
    );
    let last_access = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let report = watchdog.sweep_at(last_access + chrono::Duration::seconds(599)).await;
    assert!(report.stopped.is_empty());
    assert!(proxy.runtime.stop_calls().is_empty());

    let report = watchdog.sweep_at(last_access + chrono::Duration::seconds(601)).await;
    assert_eq!(report.stopped, vec!["demo".to_string()]);
    assert_eq!(proxy.runtime.stop_calls(), vec!["demo-c".to_string()]);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_zero_idle_timeout_never_swept() {
    let mut registry = scenario_registry(10005);
    registry.projects.get_mut("demo").unwrap().idle_timeout = Some(0);
    let proxy = TestProxy::start(registry).await;
    proxy.runtime.set_running("demo-c");

    let watchdog = IdleWatchdog::new(
        Arc::clone(&proxy.state.registry),
        Arc::clone(&proxy.lifecycle),
        Duration::from_secs(60),
        Duration::from_secs(10),
    );
    let report = watchdog.sweep_at(Utc::now() + chrono::Duration::days(3650)).await;

    assert!(report.stopped.is_empty());
    assert!(proxy.runtime.stop_calls().is_empty());

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_unknown_slug_returns_not_found() {
    let proxy = TestProxy::start(scenario_registry(10005)).await;

    let response = http_get(proxy.addr, "/proxy/does-not-exist/anything").await;

    assert_eq!(status_of(&response), 404);
    assert_eq!(body_of(&response), "Project 'does-not-exist' not found");
    assert!(proxy.runtime.start_calls().is_empty());
    assert_eq!(proxy.lifecycle.in_flight_count(), 0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_malformed_and_unrouted_paths() {
    let proxy = TestProxy::start(scenario_registry(10005)).await;

    let response = http_get(proxy.addr, "/proxy/demo").await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(body_of(&response), "Not Found");

    let response = http_get(proxy.addr, "/elsewhere").await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(body_of(&response), "Not Found");

    let response = http_get(proxy.addr, "/api/nothing-here").await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(json_of(&response)["error"], "Not found");
    assert_eq!(header_of(&response, "access-control-allow-origin"), Some("*"));

    assert!(proxy.runtime.start_calls().is_empty());
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_static_project_never_controlled() {
    let mut registry = scenario_registry(10005);
    registry.projects.insert(
        "docs".to_string(),
        ProjectEntry::static_site(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()).with_idle_timeout(1),
    );
    let proxy = TestProxy::start(registry).await;

    let listing = json_of(&http_get(proxy.addr, "/api/projects").await);
    assert_eq!(project(&listing, "docs")["status"], "active");

    let response = http_get(proxy.addr, "/proxy/docs/index.html").await;
    assert_eq!(status_of(&response), 404);

    let response = http_request(proxy.addr, "POST", "/api/projects/docs/start", &[], "").await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(json_of(&response)["error"], "Dynamic project not found");

    let watchdog = IdleWatchdog::new(
        Arc::clone(&proxy.state.registry),
        Arc::clone(&proxy.lifecycle),
        Duration::from_secs(60),
        Duration::from_secs(10),
    );
    watchdog.sweep_at(Utc::now()).await;

    assert!(proxy.runtime.start_calls().is_empty());
    assert!(proxy.runtime.stop_calls().iter().all(|c| c == "demo-c"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_settings_round_trip() {
    let mut registry = scenario_registry(10005);
    registry.projects.insert(
        "plain".to_string(),
        ProjectEntry::dynamic(10006, "plain-c", Utc::now()),
    );
    let proxy = TestProxy::start(registry).await;

    let response = http_request(
        proxy.addr,
        "PATCH",
        "/api/settings",
        &[("Content-Type", "application/json")],
        r#"{"defaultIdleTimeout": 1800}"#,
    )
    .await;
    assert_eq!(status_of(&response), 200, "Response: {}", response);
    assert_eq!(json_of(&response)["settings"]["defaultIdleTimeout"], 1800);

    let listing = json_of(&http_get(proxy.addr, "/api/projects").await);
    assert_eq!(listing["settings"]["defaultIdleTimeout"], 1800);
    assert_eq!(project(&listing, "plain")["effectiveIdleTimeout"], 1800);
    assert_eq!(project(&listing, "demo")["effectiveIdleTimeout"], 600);

    proxy.shutdown().await;
}

// ============================================================================
// Error paths and auxiliary routes
// ============================================================================

#[tokio::test]
async fn test_unreachable_backend_returns_502() {
    // Bind then drop to get a port with nothing listening
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let proxy = TestProxy::start(scenario_registry(port)).await;
    proxy.runtime.set_running("demo-c");

    let response = http_get(proxy.addr, "/proxy/demo/index.html").await;

    assert_eq!(status_of(&response), 502);
    assert_eq!(
        body_of(&response),
        "Project 'demo' is not responding. Try again in a moment."
    );
    assert_eq!(header_of(&response, "x-proxy-error"), Some("BACKEND_UNAVAILABLE"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_silent_backend_returns_504() {
    let (port, backend) = silent_backend().await;
    let proxy = TestProxy::start_with(scenario_registry(port), |config| {
        config.server.request_timeout_secs = 1;
    })
    .await;
    proxy.runtime.set_running("demo-c");

    let response = http_get(proxy.addr, "/proxy/demo/index.html").await;

    assert_eq!(status_of(&response), 504, "Response: {}", response);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("REQUEST_TIMEOUT"));
    assert!(body_of(&response).contains("did not respond"));

    backend.abort();
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_atypical_registry_entries_survive_traffic() {
    let backend = Backend::start().await;
    let proxy = TestProxy::start(Registry::default()).await;
    proxy.runtime.set_running("demo-c");
    let path = proxy.state.registry.path().to_path_buf();
    std::fs::write(
        &path,
        format!(
            r#"{{"projects":{{
                "demo":{{"type":"dynamic","port":{},"container":"demo-c","lastAccess":"2024-01-01 00:00:00",
                        "created":"2024-01-01T00:00:00Z"}},
                "blog":{{"type":"wordpress","port":10009,"theme":"dark"}}
              }},"nextPort":10010,"settings":{{"defaultIdleTimeout":3600}}}}"#,
            backend.port
        ),
    )
    .unwrap();

    let response = http_get(proxy.addr, "/proxy/demo/index.html").await;
    assert_eq!(status_of(&response), 200, "Response: {}", response);
    assert_eq!(body_of(&response), "hello");

    let listing = json_of(&http_get(proxy.addr, "/api/projects").await);
    assert_eq!(listing["projects"].as_array().unwrap().len(), 2);

    let on_disk: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["nextPort"], 10010);
    assert_eq!(on_disk["projects"]["demo"]["visitors"], 1);
    assert_ne!(on_disk["projects"]["demo"]["lastAccess"], "2024-01-01 00:00:00");
    assert_eq!(on_disk["projects"]["blog"]["type"], "wordpress");
    assert_eq!(on_disk["projects"]["blog"]["theme"], "dark");

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_visit_recorded_with_real_ip() {
    let proxy = TestProxy::start(scenario_registry(10005)).await;
    proxy.runtime.set_start_delay(Duration::from_secs(3));

    http_request(
        proxy.addr,
        "GET",
        "/proxy/demo/page?x=1",
        &[
            ("X-Real-IP", "203.0.113.7"),
            ("User-Agent", "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X)"),
        ],
        "",
    )
    .await;

    let stats = json_of(&http_get(proxy.addr, "/api/projects/demo/stats").await);
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["uniqueVisitors24h"], 1);
    assert_eq!(stats["devices"]["Tablet"], 1);
    assert_eq!(stats["recentVisitors"][0]["ip"], "203.0.113.7");
    assert_eq!(stats["recentVisitors"][0]["path"], "/proxy/demo/page?x=1");

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let proxy = TestProxy::start(Registry::default()).await;

    let response = http_get(proxy.addr, "/health").await;

    assert_eq!(status_of(&response), 200);
    let body = json_of(&response);
    assert_eq!(body["status"], "ok");
    assert!(body["uptime"].as_f64().unwrap() >= 0.0);
    assert_eq!(body["forwarded"]["total"], 0);
    assert_eq!(body["forwarded"]["failed"], 0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_missing_registry_serves_empty_listing() {
    let proxy = TestProxy::start(Registry::default()).await;
    std::fs::remove_file(proxy.state.registry.path()).unwrap();

    let listing = json_of(&http_get(proxy.addr, "/api/projects").await);
    assert!(listing["projects"].as_array().unwrap().is_empty());
    assert_eq!(listing["settings"]["defaultIdleTimeout"], 3600);

    proxy.shutdown().await;
}
