//! Error handling for the FireShield relay

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Malformed inbound message
    #[error("Parse error: {0}")]
    Parse(String),

    /// Camera capture / control failure
    #[error("Camera error: {0}")]
    Camera(String),

    /// Detection engine returned an unusable answer
    #[error("Detection error: {0}")]
    Detection(String),

    /// Detection model missing or not loadable
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Broker publish / subscribe failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// Bounded call exceeded its limit
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Bounded call abandoned because shutdown was forced
    #[error("{0} cancelled")]
    Cancelled(&'static str),

    /// Chat notification failure
    #[error("Notify error: {0}")]
    Notify(String),

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

impl Error {
    /// Failures worth another attempt (network hiccups, slow peers)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Camera(_)
                | Error::Broker(_)
                | Error::Timeout { .. }
                | Error::Http(_)
                | Error::Io(_)
                | Error::Notify(_)
        )
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Error::Parse(_) => (StatusCode::BAD_REQUEST, "PARSE_ERROR"),
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Error::Camera(_) => (StatusCode::BAD_GATEWAY, "CAMERA_ERROR"),
            Error::Detection(_) => (StatusCode::BAD_GATEWAY, "DETECTION_ERROR"),
            Error::ModelUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "MODEL_UNAVAILABLE"),
            Error::Broker(_) => (StatusCode::BAD_GATEWAY, "BROKER_ERROR"),
            Error::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            Error::Cancelled(_) => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED"),
            Error::Notify(_) => (StatusCode::BAD_GATEWAY, "NOTIFY_ERROR"),
            Error::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR"),
            Error::Http(_) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Camera("status 500".into()).is_transient());
        assert!(Error::Timeout {
            operation: "camera capture",
            after: Duration::from_secs(10)
        }
        .is_transient());
        assert!(!Error::Parse("not json".into()).is_transient());
        assert!(!Error::ModelUnavailable("missing weights".into()).is_transient());
        assert!(!Error::Cancelled("camera capture").is_transient());
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            operation: "model load",
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "model load timed out after 30s");
    }
}
