//! Request-level session handling.
//!
//! `session_layer` runs on every route and only annotates the request;
//! rejection happens in `require_user` and `require_role`, layered on the
//! routes that need them.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;

use super::session::{Claims, SessionKeys, TOKEN_COOKIE};
use crate::db::Role;
use crate::error::ApiError;

/// Verified session claims, present in request extensions when the token
/// cookie checks out.
#[derive(Debug, Clone)]
pub struct Session(pub Claims);

/// Attach a [`Session`] when the request carries a valid token cookie.
pub async fn session_layer(State(keys): State<SessionKeys>, mut req: Request, next: Next) -> Response {
    let jar = CookieJar::from_headers(req.headers());
    if let Some(cookie) = jar.get(TOKEN_COOKIE) {
        match keys.verify(cookie.value()) {
            Ok(claims) => {
                req.extensions_mut().insert(Session(claims));
            }
            Err(e) => tracing::debug!(error = %e, "Ignoring invalid session cookie"),
        }
    }
    next.run(req).await
}

/// Reject requests without a session.
pub async fn require_user(req: Request, next: Next) -> Result<Response, ApiError> {
    if req.extensions().get::<Session>().is_none() {
        return Err(ApiError::unauthorized());
    }
    Ok(next.run(req).await)
}

/// Reject requests whose session role is not `role`.
pub async fn require_role(
    State(role): State<Role>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match req.extensions().get::<Session>() {
        Some(Session(claims)) if claims.has_role(role) => Ok(next.run(req).await),
        Some(Session(claims)) => {
            tracing::debug!(email = %claims.email, role = %claims.role, required = %role, "Role check failed");
            Err(ApiError::unauthorized())
        }
        None => Err(ApiError::unauthorized()),
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or_else(ApiError::unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use axum::middleware::{from_fn, from_fn_with_state};
    use axum::routing::get;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys::new(&SecretString::from("middleware-secret".to_string()))
    }

    fn token(role: &str) -> String {
        keys()
            .sign(&Claims {
                id: 1,
                email: "someone@example.com".to_string(),
                role: role.to_string(),
                picture: String::new(),
                exp: chrono::Utc::now().timestamp() + 60,
            })
            .unwrap()
    }

    fn app() -> Router {
        let admin = Router::new()
            .route("/admin", get(|| async { "admin ok" }))
            .route_layer(from_fn_with_state(Role::Admin, require_role));
        let user = Router::new()
            .route(
                "/me",
                get(|Session(claims): Session| async move { claims.email }),
            )
            .route_layer(from_fn(require_user));
        Router::new()
            .route("/open", get(|| async { "open" }))
            .merge(admin)
            .merge(user)
            .layer(from_fn_with_state(keys(), session_layer))
    }

    async fn status(path: &str, cookie: Option<String>) -> StatusCode {
        let mut req = Request::builder().uri(path);
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        app()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_open_route_without_session() {
        assert_eq!(status("/open", None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_require_user() {
        assert_eq!(status("/me", None).await, StatusCode::UNAUTHORIZED);
        let cookie = format!("{}={}", TOKEN_COOKIE, token("user"));
        assert_eq!(status("/me", Some(cookie)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_require_role_admin() {
        let user = format!("{}={}", TOKEN_COOKIE, token("user"));
        assert_eq!(status("/admin", Some(user)).await, StatusCode::UNAUTHORIZED);

        let admin = format!("{}={}", TOKEN_COOKIE, token("Admin"));
        assert_eq!(status("/admin", Some(admin)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_cookie_is_unauthenticated() {
        let cookie = format!("{}=not-a-token", TOKEN_COOKIE);
        assert_eq!(status("/open", Some(cookie.clone())).await, StatusCode::OK);
        assert_eq!(status("/me", Some(cookie)).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rejection_body() {
        let resp = app()
            .oneshot(Request::builder().uri("/admin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"error": "Unauthorized"}));
    }
}
