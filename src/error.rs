//! Error handling for Camwatch

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// AI backend failure kinds
#[derive(Debug, Clone, thiserror::Error)]
pub enum AiError {
    /// Request exceeded the configured timeout
    #[error("AI timeout: {0}")]
    Timeout(String),

    /// Response could not be parsed into the expected structure
    #[error("AI invalid response: {0}")]
    InvalidResponse(String),

    /// Backend rejected the credentials
    #[error("AI unauthorized: {0}")]
    Unauthorized(String),
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error (bad user input)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (capture already running)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transient capture read failure (retried by the orchestrator)
    #[error("Capture error: {0}")]
    Capture(String),

    /// Capture source exhausted its bounded retries
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// AI backend failure
    #[error(transparent)]
    Ai(#[from] AiError),

    /// Config error (malformed or missing required key)
    #[error("Config error: {0}")]
    Config(String),

    /// MQTT error
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Error::Capture(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            Error::SourceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            Error::Ai(e) => {
                let status = match e {
                    AiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    AiError::Unauthorized(_) | AiError::InvalidResponse(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                };
                (status, e.to_string())
            }
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            Error::Mqtt(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            Error::Serialization(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Error::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        tracing::error!(
            status = %status,
            message = %message,
            "Request error"
        );

        let body = Json(json!({ "error": message }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ai_error_display() {
        let e = Error::Ai(AiError::Timeout("no response within 60s".into()));
        assert_eq!(e.to_string(), "AI timeout: no response within 60s");
    }

    #[test]
    fn test_validation_display() {
        let e = Error::Validation("name and phrase are required".into());
        assert!(e.to_string().contains("name and phrase"));
    }
}
