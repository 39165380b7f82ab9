//! Error types for dockgate.

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub use crate::docker::DockerError;
pub use crate::files::FileError;

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("{entity} already exists: {id}")]
    Conflict { entity: String, id: String },

    #[error("Cannot remove the last admin user")]
    LastAdmin,
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Authentication and authorization errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("State cookie missing")]
    MissingState,

    #[error("Invalid state")]
    InvalidState,

    #[error("Authorization code missing")]
    MissingCode,

    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error("Invalid ID token: {0}")]
    InvalidIdToken(String),

    #[error("ID token carries no email")]
    MissingEmail,

    #[error("User not allowed to sign in")]
    NotAllowed,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Session token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// HTTP server lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server failed to start: {reason}")]
    StartupFailed { reason: String },

    #[error("TLS configuration failed: {0}")]
    Tls(String),
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by HTTP handlers, rendered as a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Attach an extra field next to `error`.
    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let Some(map) = self.body.as_object_mut() {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        self.body["error"].as_str().unwrap_or_default()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message(), "Request failed");
        }
        (self.status, Json(self.body)).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { .. } => ApiError::not_found(e.to_string()),
            DatabaseError::Conflict { .. } => ApiError::new(StatusCode::CONFLICT, e.to_string()),
            DatabaseError::LastAdmin => ApiError::bad_request(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<DockerError> for ApiError {
    fn from(e: DockerError) -> Self {
        ApiError::new(e.status_code(), e.to_string())
    }
}

impl From<FileError> for ApiError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::AccessDenied { .. } => ApiError::new(StatusCode::FORBIDDEN, e.to_string()),
            FileError::NotFound { .. } => ApiError::not_found(e.to_string()),
            FileError::InvalidInput(_) => ApiError::bad_request(e.to_string()),
            FileError::Binary { ref mime } => {
                let mime = mime.clone();
                ApiError::bad_request(e.to_string()).with_field("mime", mime)
            }
            FileError::Archive(_) | FileError::Io(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingState | AuthError::InvalidState | AuthError::MissingCode => {
                ApiError::bad_request(e.to_string())
            }
            AuthError::Exchange(_) => ApiError::internal(e.to_string()),
            _ => ApiError::new(StatusCode::UNAUTHORIZED, e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::bad_request(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::bad_request(e.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::bad_request(e.body_text())
    }
}
