use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] WebSocketError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::WebSocketError(WebSocketError::SerializationError(err.to_string()))
    }
}

// Add conversion from std::io::Error
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

// Implement actix_web::ResponseError for AppError
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::WebSocketError(e) => match e {
                WebSocketError::RouteNotFound(_) => StatusCode::NOT_FOUND,
                WebSocketError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
                WebSocketError::SerializationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
                WebSocketError::TransportError(_) => StatusCode::BAD_GATEWAY,
                WebSocketError::InternalLoopFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failures raised by a single connection or by route dispatch.
///
/// "Not found" is deliberately absent: unknown identities and groups are
/// reported as `false`, `None` or zero by the registries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebSocketError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Serialization failed: {0}")]
    SerializationError(String),

    #[error("No WebSocket handler registered for path {0}")]
    RouteNotFound(String),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Receive loop failed: {0}")]
    InternalLoopFailure(String),
}

impl From<serde_json::Error> for WebSocketError {
    fn from(err: serde_json::Error) -> Self {
        WebSocketError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_conversion() {
        // Test IO error conversion
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::InternalError(_)));

        // Test config error conversion
        let config_err = config::ConfigError::NotFound(String::from("key not found"));
        let app_err: AppError = config_err.into();
        assert!(matches!(app_err, AppError::ConfigError(_)));

        // Serialization errors land in the websocket taxonomy
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let app_err: AppError = json_err.into();
        assert!(matches!(
            app_err,
            AppError::WebSocketError(WebSocketError::SerializationError(_))
        ));
    }

    #[test]
    fn test_error_status_codes() {
        let err = AppError::WebSocketError(WebSocketError::RouteNotFound("/chat".into()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = AppError::WebSocketError(WebSocketError::TransportError("reset".into()));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        let err = AppError::ValidationError("invalid input".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = AppError::ConfigError("missing".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_display() {
        let err = AppError::ValidationError("test error".to_string());
        assert_eq!(err.to_string(), "Validation error: test error");

        let err = AppError::WebSocketError(WebSocketError::RouteNotFound("/chat".into()));
        assert_eq!(
            err.to_string(),
            "WebSocket error: No WebSocket handler registered for path /chat"
        );
    }
}
