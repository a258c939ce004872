//! Error types for the sandbox HTTP endpoint.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use mcpbox_core::SandboxError;
use serde_json::json;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors raised while setting up or running the server itself.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// A failed sandbox operation, rendered as `{"error": {"kind", "detail"}}`.
#[derive(Debug)]
pub struct ApiError(pub SandboxError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            SandboxError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SandboxError::Discovery(_) => StatusCode::BAD_GATEWAY,
            SandboxError::Build(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SandboxError::Start(_) => StatusCode::SERVICE_UNAVAILABLE,
            SandboxError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            SandboxError::UnknownSandbox(_) => StatusCode::NOT_FOUND,
            SandboxError::NotRunning { .. } => StatusCode::CONFLICT,
            SandboxError::Transport(e) => match e.kind {
                mcpbox_core::TransportErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
            SandboxError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = json!({
            "kind": self.0.kind(),
            "detail": self.0.to_string(),
        });
        if let Some(logs) = self.0.build_logs() {
            error["logs"] = json!(logs);
        }

        if status.is_server_error() {
            log::error!("{} ({}): {}", self.0.kind(), status, self.0);
        } else {
            log::warn!("{} ({}): {}", self.0.kind(), status, self.0);
        }
        (status, Json(json!({ "error": error }))).into_response()
    }
}
