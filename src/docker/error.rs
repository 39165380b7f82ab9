//! Error types for Docker engine operations.

use axum::http::StatusCode;

/// Errors from the Docker facade.
#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    /// Docker daemon is not reachable.
    #[error("Docker not available: {reason}")]
    Unavailable { reason: String },

    /// Request rejected before reaching the daemon.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("No such container: {0}")]
    ContainerNotFound(String),

    /// Remove-then-recreate failed; `rollback` describes what happened to the
    /// original container.
    #[error("Container update failed: {reason} (rollback: {rollback})")]
    UpdateFailed { reason: String, rollback: String },

    /// Docker API error.
    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
}

impl DockerError {
    /// HTTP status for this error: daemon 404s stay 404, other daemon 4xx are
    /// client input problems, everything else is a server-side failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DockerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DockerError::ContainerNotFound(_) => StatusCode::NOT_FOUND,
            DockerError::Unavailable { .. } | DockerError::UpdateFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DockerError::Api(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => match *status_code {
                404 => StatusCode::NOT_FOUND,
                400..=499 => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            DockerError::Api(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == StatusCode::NOT_FOUND
    }
}

/// Result type for Docker operations.
pub type Result<T> = std::result::Result<T, DockerError>;
