//! # Error Handling
//!
//! Two error layers live here:
//!
//! - [`LiveError`]: the voice pipeline's own taxonomy (decode, format, device,
//!   connection, lifecycle misuse). Every audio and session module returns it.
//! - [`AppError`]: what the HTTP control API sends back to clients. It knows how
//!   to turn itself into a JSON response and how to absorb a `LiveError`.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### thiserror
//! - **`#[derive(Error)]`**: Generates the `std::error::Error` impl for an enum
//! - **`#[error("...")]`**: Generates `Display` from a format string per variant
//! - **`#[from]`**: Generates a `From` conversion so `?` can convert automatically
//!
//! ### ResponseError
//! - actix-web calls `error_response()` whenever a handler returns `Err(AppError)`
//! - The mapping from variant to status code lives in exactly one place

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors raised by the codec, the audio devices, the scheduler, the transport
/// and the session controller.
///
/// ## Propagation rules:
/// - `Decode` / `Format` on one inbound chunk drop that chunk only
/// - `Device` / `Connection` during `start()` are fatal to that start
/// - `Connection` while listening closes the session
/// - `InvalidState` is returned when `start()` is called outside `Standby`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LiveError {
    /// Malformed base64 or PCM payload
    #[error("decode error: {0}")]
    Decode(String),

    /// Byte length or audio configuration does not match what is expected
    #[error("format error: {0}")]
    Format(String),

    /// Microphone or output device unavailable, denied, or revoked
    #[error("device error: {0}")]
    Device(String),

    /// Live session failed to open, or closed unexpectedly
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation not valid in the current session state
    #[error("invalid session state: {0}")]
    InvalidState(String),
}

impl LiveError {
    /// Short machine-readable name, used in logs and WebSocket error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            LiveError::Decode(_) => "decode_error",
            LiveError::Format(_) => "format_error",
            LiveError::Device(_) => "device_error",
            LiveError::Connection(_) => "connection_error",
            LiveError::InvalidState(_) => "invalid_state",
        }
    }

    /// Message safe to show an end user. Device and network failures collapse
    /// into a generic indication so no raw detail leaks past the API.
    pub fn public_message(&self) -> String {
        match self {
            LiveError::Device(_) | LiveError::Connection(_) => "connection error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<base64::DecodeError> for LiveError {
    fn from(err: base64::DecodeError) -> Self {
        LiveError::Decode(format!("invalid base64 audio: {}", err))
    }
}

/// Custom error types for the HTTP control API.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **Conflict**: Request is valid but not in the current session state (409 errors)
/// - **Unavailable**: Audio device or live backend unreachable (503 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, &str) {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.as_str()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.as_str()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "connection error",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Session failures become HTTP errors. Device and connection detail is
/// replaced by the generic public message.
impl From<LiveError> for AppError {
    fn from(err: LiveError) -> Self {
        match &err {
            LiveError::InvalidState(_) => AppError::Conflict(err.public_message()),
            LiveError::Device(_) | LiveError::Connection(_) => {
                AppError::Unavailable(err.public_message())
            }
            LiveError::Decode(_) | LiveError::Format(_) => AppError::BadRequest(err.public_message()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}
