//! Error types and error responses for the proxy and management surfaces

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Response body type shared by every handler
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Wrap a fully buffered body
pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Failure reading or writing one of the persisted JSON documents
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("refusing to overwrite unreadable file: {0}")]
    Unreadable(String),
}

/// Error codes for proxy and API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Route does not exist
    NotFound,
    /// Slug is unknown or not a dynamic project
    UnknownProject,
    /// Backend refused or dropped the connection
    BackendUnavailable,
    /// Backend did not answer in time
    RequestTimeout,
    /// Request body could not be parsed
    InvalidBody,
    /// Request body exceeded the size limit
    BodyTooLarge,
    /// Missing or wrong API token
    Unauthorized,
    /// Container start/stop/restart failed
    LifecycleFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::UnknownProject => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InvalidBody => StatusCode::BAD_REQUEST,
            ProxyErrorCode::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::LifecycleFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::UnknownProject => "UNKNOWN_PROJECT",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InvalidBody => "INVALID_BODY",
            ProxyErrorCode::BodyTooLarge => "BODY_TOO_LARGE",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::LifecycleFailed => "LIFECYCLE_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error body for the management API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// The error code
    pub code: ProxyErrorCode,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}"}}"#,
                self.error.replace('\"', "\\\""),
                self.code.as_header_value()
            )
        })
    }
}

/// Plain-text error for the proxy surface, tagged with X-Proxy-Error
pub fn text_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}

/// JSON error for the management API surface
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
