//! Allow-list management.

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use serde::Deserialize;

use crate::auth::Session;
use crate::db::{AllowedUser, Role};
use crate::error::ApiError;
use crate::server::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users/allowed", get(list_allowed).post(add_allowed))
        .route("/users/allowed/{email}", delete(remove_allowed))
}

#[derive(Debug, Deserialize)]
pub struct AddAllowedRequest {
    pub email: String,
    /// Defaults to `user`.
    #[serde(default)]
    pub role: Option<String>,
}

/// GET /users/allowed - The allow-list.
pub async fn list_allowed(State(state): State<AppState>) -> Result<Json<Vec<AllowedUser>>, ApiError> {
    Ok(Json(state.store.list_allowed_users().await?))
}

/// POST /users/allowed - Allow a new email to sign in.
pub async fn add_allowed(
    State(state): State<AppState>,
    Session(claims): Session,
    payload: Result<Json<AddAllowedRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AllowedUser>), ApiError> {
    let Json(request) = payload?;
    let email = request.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::bad_request("a valid email is required"));
    }
    let role = match request.role.as_deref().map(str::trim) {
        None | Some("") => Role::User,
        Some(raw) => raw.parse::<Role>().map_err(ApiError::bad_request)?,
    };

    let allowed = state.store.add_allowed_user(email, role).await?;
    tracing::info!(email = %allowed.email, role = %allowed.role, by = %claims.email, "Allowed user added");
    Ok((StatusCode::CREATED, Json(allowed)))
}

/// DELETE /users/allowed/{email} - Remove an email from the allow-list.
pub async fn remove_allowed(
    State(state): State<AppState>,
    Session(claims): Session,
    Path(email): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.remove_allowed_user(&email).await?;
    tracing::info!(email = %email, by = %claims.email, "Allowed user removed");
    Ok(StatusCode::OK)
}
