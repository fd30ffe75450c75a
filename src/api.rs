//! JSON management API served under `/api/`
//!
//! Lists projects with live status, reports visitor stats, drives container
//! lifecycle actions and patches registry settings. Every response carries
//! permissive CORS headers for the dashboard.

use crate::error::{full_body, json_error_response, ProxyBody, ProxyErrorCode};
use crate::proxy::AppState;
use crate::registry::{integer_from_value, ProjectEntry, ProjectPatch};
use anyhow::Result;
use chrono::{Duration, Utc};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE,
};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Trailing window for visitor stats
const STATS_WINDOW_HOURS: i64 = 24;

/// Body of `PATCH /api/settings`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub default_idle_timeout: Option<i64>,
}

/// Body of `PATCH /api/projects/{slug}`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub idle_timeout: Option<i64>,
    /// Absent leaves the description alone; `null` clears it
    #[serde(default, deserialize_with = "present_or_null")]
    pub description: Option<Option<String>>,
}

impl From<ProjectUpdate> for ProjectPatch {
    fn from(update: ProjectUpdate) -> Self {
        ProjectPatch {
            idle_timeout: update.idle_timeout,
            description: update.description,
        }
    }
}

fn present_or_null<'de, D>(deserializer: D) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// Accept `1800`, `1800.0` or `"1800"`
fn lenient_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => integer_from_value(&value)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid number of seconds: {}", value))),
    }
}

/// `{ok, message}` reply for lifecycle actions
#[derive(Debug, Serialize)]
struct ActionReply {
    ok: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// API route, parsed from the path after `/api/`
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Projects,
    Project(&'a str),
    Stats(&'a str),
    Action(&'a str, Action),
    Settings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Stop,
    Restart,
}

fn is_slug(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn parse_route(path: &str) -> Option<Route<'_>> {
    let rest = path.strip_prefix("/api/")?;
    let segments: Vec<&str> = rest.split('/').collect();

    match segments.as_slice() {
        ["projects"] => Some(Route::Projects),
        ["settings"] => Some(Route::Settings),
        ["projects", slug] if is_slug(slug) => Some(Route::Project(*slug)),
        ["projects", slug, "stats"] if is_slug(slug) => Some(Route::Stats(*slug)),
        ["projects", slug, action] if is_slug(slug) => {
            let action = match *action {
                "start" => Action::Start,
                "stop" => Action::Stop,
                "restart" => Action::Restart,
                _ => return None,
            };
            Some(Route::Action(*slug, action))
        }
        _ => None,
    }
}

/// Handle one `/api/*` request
pub async fn handle<B>(req: Request<B>, state: &AppState) -> Response<ProxyBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "API request");

    if method == Method::OPTIONS {
        return with_cors(
            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(full_body(Bytes::new()))
                .expect("valid response with StatusCode enum"),
        );
    }

    if let Some(token) = state.config.server.api_token.as_deref() {
        if !check_auth(&req, token) {
            warn!(%path, "Unauthorized API request");
            return with_cors(json_error_response(ProxyErrorCode::Unauthorized, "unauthorized"));
        }
    }

    let response = match (method, parse_route(&path)) {
        (Method::GET, Some(Route::Projects)) => list_projects(state).await,
        (Method::GET, Some(Route::Stats(slug))) => project_stats(state, slug).await,
        (Method::POST, Some(Route::Action(slug, action))) => project_action(state, slug, action).await,
        (Method::PATCH, Some(Route::Settings)) => update_settings(state, req).await,
        (Method::PATCH, Some(Route::Project(slug))) => update_project(state, slug, req).await,
        _ => Ok(json_error_response(ProxyErrorCode::NotFound, "Not found")),
    };

    with_cors(response.unwrap_or_else(|e| {
        error!(%path, error = %e, "API error");
        json_error_response(ProxyErrorCode::InternalError, format!("Internal error: {}", e))
    }))
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

async fn list_projects(state: &AppState) -> Result<Response<ProxyBody>> {
    let registry = state.registry.load().await;

    let statuses = futures::future::join_all(registry.projects.values().map(|project| async move {
        let Some(target) = project.dynamic_target() else {
            return if project.is_dynamic() { "stopped" } else { "active" };
        };
        if state.lifecycle.is_running(&target.container).await {
            "running"
        } else {
            "stopped"
        }
    }))
    .await;

    let mut projects = Vec::with_capacity(registry.projects.len());
    for ((slug, project), status) in registry.projects.iter().zip(statuses) {
        let mut item = match serde_json::to_value(project)? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        item.insert("slug".to_string(), Value::from(slug.as_str()));
        item.insert("status".to_string(), Value::from(status));
        item.insert(
            "effectiveIdleTimeout".to_string(),
            Value::from(project.effective_idle_timeout(&registry.settings)),
        );
        projects.push(Value::Object(item));
    }

    let body = serde_json::json!({
        "projects": projects,
        "settings": registry.settings,
    });
    Ok(json_response(StatusCode::OK, &body)?)
}

async fn project_stats(state: &AppState, slug: &str) -> Result<Response<ProxyBody>> {
    let stats = state
        .visitors
        .query_by_slug(slug, Duration::hours(STATS_WINDOW_HOURS), Utc::now())
        .await;
    Ok(json_response(StatusCode::OK, &stats)?)
}

async fn project_action(state: &AppState, slug: &str, action: Action) -> Result<Response<ProxyBody>> {
    let registry = state.registry.load().await;
    let Some(target) = registry.project(slug).and_then(ProjectEntry::dynamic_target) else {
        return Ok(json_error_response(
            ProxyErrorCode::UnknownProject,
            "Dynamic project not found",
        ));
    };
    let container = target.container.as_str();

    let outcome = match action {
        Action::Restart => match state.lifecycle.restart(container).await {
            Ok(()) => Ok(format!("{} restarted", slug)),
            Err(e) => Err((format!("Failed to restart {}", slug), e.to_string())),
        },
        Action::Stop => match state.lifecycle.stop(container).await {
            Ok(()) => Ok(format!("{} stopped", slug)),
            Err(e) => Err((format!("Failed to stop {}", slug), e.to_string())),
        },
        Action::Start => {
            if state.lifecycle.start(container).await {
                Ok(format!("{} started", slug))
            } else {
                Err((
                    "Failed to start".to_string(),
                    format!(
                        "{} did not start within {} seconds",
                        container,
                        state.lifecycle.policy().max_wait.as_secs()
                    ),
                ))
            }
        }
    };

    info!(slug, container, ?action, ok = outcome.is_ok(), "Lifecycle action");
    match outcome {
        Ok(message) => Ok(json_response(StatusCode::OK, &ActionReply::ok(message))?),
        Err((message, error)) => {
            let code = ProxyErrorCode::LifecycleFailed;
            let mut response = json_response(code.status_code(), &ActionReply::failed(message, error))?;
            response
                .headers_mut()
                .insert("X-Proxy-Error", HeaderValue::from_static(code.as_header_value()));
            Ok(response)
        }
    }
}

impl ActionReply {
    fn ok(message: String) -> Self {
        Self {
            ok: true,
            message,
            error: None,
        }
    }

    fn failed(message: String, error: String) -> Self {
        Self {
            ok: false,
            message,
            error: Some(error),
        }
    }
}

async fn update_settings<B>(state: &AppState, req: Request<B>) -> Result<Response<ProxyBody>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let update: SettingsUpdate = match read_json(req).await {
        Ok(update) => update,
        Err(response) => return Ok(response),
    };

    let settings = match update.default_idle_timeout {
        Some(secs) => {
            info!(default_idle_timeout = secs, "Updating default idle timeout");
            state.registry.set_default_idle_timeout(secs).await?
        }
        None => state.registry.load().await.settings,
    };

    let body = serde_json::json!({ "ok": true, "settings": settings });
    Ok(json_response(StatusCode::OK, &body)?)
}

async fn update_project<B>(state: &AppState, slug: &str, req: Request<B>) -> Result<Response<ProxyBody>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let update: ProjectUpdate = match read_json(req).await {
        Ok(update) => update,
        Err(response) => return Ok(response),
    };

    match state.registry.patch_project(slug, update.into()).await? {
        Some(project) => {
            info!(slug, "Updated project settings");
            let body = serde_json::json!({ "ok": true, "project": project });
            Ok(json_response(StatusCode::OK, &body)?)
        }
        None => Ok(json_error_response(ProxyErrorCode::NotFound, "Not found")),
    }
}

/// Collect a bounded body and parse it as JSON, or produce the 400/413 reply
async fn read_json<T, B>(req: Request<B>) -> std::result::Result<T, Response<ProxyBody>>
where
    T: for<'de> Deserialize<'de>,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(json_error_response(
                ProxyErrorCode::BodyTooLarge,
                format!("Request body exceeds {} bytes", MAX_BODY_BYTES),
            ));
        }
        Err(e) => {
            return Err(json_error_response(ProxyErrorCode::InvalidBody, e.to_string()));
        }
    };

    serde_json::from_slice(&body)
        .map_err(|e| json_error_response(ProxyErrorCode::InvalidBody, e.to_string()))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> serde_json::Result<Response<ProxyBody>> {
    let json = serde_json::to_string(body)?;
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(json))
        .expect("valid response with StatusCode enum and static headers"))
}

fn with_cors(mut response: Response<ProxyBody>) -> Response<ProxyBody> {
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PATCH, DELETE"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}
