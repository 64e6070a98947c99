//! Error types for the Scholar server.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::identity::IdentityError;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Scholar core error.
    #[error("Core error: {0}")]
    Core(#[from] scholar_core::Error),

    /// Request could not be authenticated.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A blocking task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl ServerError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Identity(e) => e.status_code(),
            Self::Config(_) | Self::Io(_) | Self::Core(_) | Self::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if let Self::Identity(e) = self {
            return e.into_response();
        }
        tracing::error!("Request failed: {}", self);
        let body = json!({ "success": false, "error": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ServerError::Config("bad".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServerError::Identity(IdentityError::Expired).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
