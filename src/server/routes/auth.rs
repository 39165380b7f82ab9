//! OAuth sign-in, sign-out and the current-user endpoint.

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use super::found;
use crate::auth::{STATE_COOKIE, Session, generate_state};
use crate::db::User;
use crate::error::{ApiError, AuthError};
use crate::server::AppState;

/// Unauthenticated OAuth endpoints, mounted at the root and under `/auth`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/signin", get(sign_in))
        .route("/callback", get(callback))
        .route("/signout", get(sign_out))
        .route("/auth/signin", get(sign_in))
        .route("/auth/callback", get(callback))
        .route("/auth/signout", get(sign_out))
}

/// Endpoints that need a session.
pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/user", get(current_user))
        .route("/auth/", get(current_user))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
}

/// GET /signin - Set the state cookie and redirect to the provider.
pub async fn sign_in(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Response) {
    let oauth_state = generate_state();
    let location = state.identity.authorization_url(&oauth_state);
    let jar = jar.add(state.cookies.state_cookie(oauth_state));
    (jar, found(&location))
}

/// GET /callback - Finish sign-in and issue the session cookie.
pub async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Result<(CookieJar, Response), ApiError> {
    let expected = jar
        .get(STATE_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(AuthError::MissingState)?;
    let received = query.state.unwrap_or_default();
    if received.is_empty() || !bool::from(expected.as_bytes().ct_eq(received.as_bytes())) {
        return Err(AuthError::InvalidState.into());
    }

    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or(AuthError::MissingCode)?;

    let identity = state.identity.authenticate(&code).await?;
    let email = identity
        .email
        .filter(|e| !e.is_empty())
        .ok_or(AuthError::MissingEmail)?;

    let Some(allowed) = state.store.find_allowed_user(&email).await? else {
        tracing::info!(email = %email, "Sign-in refused, not on the allow-list");
        return Err(AuthError::NotAllowed.into());
    };

    let picture = identity.picture.unwrap_or_default();
    let user = state
        .store
        .upsert_user(&allowed.email, allowed.role, &picture)
        .await?;
    let token = state.sessions.issue(&user)?;

    tracing::info!(email = %user.email, role = %user.role, "User signed in");
    let jar = jar.add(state.cookies.token_cookie(token));
    Ok((jar, found(&state.config.allow_origin)))
}

/// GET /signout - Clear the session cookie.
pub async fn sign_out(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Response) {
    let jar = jar.add(state.cookies.clear_token_cookie());
    (jar, found(&state.config.allow_origin))
}

/// GET /user - The stored record for the session's email.
pub async fn current_user(
    State(state): State<AppState>,
    Session(claims): Session,
) -> Result<Json<User>, ApiError> {
    state
        .store
        .find_user(&claims.email)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("User not found"))
}
