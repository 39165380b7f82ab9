//! Route fragments, grouped by the gate they sit behind.

pub mod auth;
pub mod docker;
pub mod files;
pub mod system;
pub mod users;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// 302 to `location`.
pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// `{"message": ...}` with a 200.
pub(crate) fn message(text: &str) -> Response {
    axum::Json(json!({ "message": text })).into_response()
}
