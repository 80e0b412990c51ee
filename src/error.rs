//! # Error Handling
//!
//! Two error layers live here:
//!
//! - **AppError**: errors surfaced through the REST API, converted to JSON
//!   HTTP responses via actix's `ResponseError` trait.
//! - **EngineError**: the voice engine's domain taxonomy. These never map to
//!   HTTP status codes directly; the session worker decides per variant
//!   whether to drop a chunk, abort the turn, or tear the session down.
//!
//! ## Propagation policy:
//! - Codec-level and single-chunk errors (`MalformedAudio`) are recovered
//!   locally: the chunk is dropped and logged, the turn continues.
//! - Turn-level and device-level errors (`Collaborator`,
//!   `DeviceUnavailable`) force the turn back to idle and are surfaced as an
//!   `error` wire event.
//! - Out-of-state wire events (`ProtocolViolation`) are ignored with a
//!   warning; the session continues.
//! - Connection-level errors destroy the session.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors surfaced through the HTTP API.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (engine failures, lock poisoning, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
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

/// Type alias for Results that use the HTTP error type.
pub type AppResult<T> = Result<T, AppError>;

/// Domain errors raised inside the voice session engine.
///
/// ## Error Categories:
/// - **MalformedAudio**: the codec cannot interpret a payload. Recovered
///   locally — the chunk is dropped and the turn continues.
/// - **DeviceUnavailable**: the playback sink (or capture path) cannot be
///   acquired or fails mid-buffer. The turn aborts to idle.
/// - **Collaborator**: the recognition/synthesis or dialogue provider
///   failed. The turn aborts to idle, an `error` event is emitted, and no
///   automatic retry happens — retry is a caller decision.
/// - **ProtocolViolation**: a wire event arrived in a state that does not
///   permit it (e.g. `audio-chunk` with no active listening turn). Ignored
///   with a warning.
/// - **SessionClosed**: the session's worker or connection is gone; callers
///   should release the session.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    MalformedAudio(String),
    DeviceUnavailable(String),
    Collaborator(String),
    ProtocolViolation(String),
    SessionClosed(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::MalformedAudio(msg) => write!(f, "malformed audio: {}", msg),
            EngineError::DeviceUnavailable(msg) => write!(f, "device unavailable: {}", msg),
            EngineError::Collaborator(msg) => write!(f, "collaborator failure: {}", msg),
            EngineError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            EngineError::SessionClosed(msg) => write!(f, "session closed: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Machine-readable error code used in wire `error` events and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::MalformedAudio(_) => "malformed_audio",
            EngineError::DeviceUnavailable(_) => "device_unavailable",
            EngineError::Collaborator(_) => "collaborator_error",
            EngineError::ProtocolViolation(_) => "protocol_violation",
            EngineError::SessionClosed(_) => "session_closed",
        }
    }

    /// Whether this error aborts the current turn (as opposed to being
    /// recovered locally by dropping the offending chunk or event).
    pub fn aborts_turn(&self) -> bool {
        matches!(
            self,
            EngineError::DeviceUnavailable(_)
                | EngineError::Collaborator(_)
                | EngineError::SessionClosed(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Collaborator(err.to_string())
    }
}

/// Type alias for Results inside the engine.
pub type EngineResult<T> = Result<T, EngineError>;
