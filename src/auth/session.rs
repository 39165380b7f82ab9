//! Session tokens and the cookies that carry them.

use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::db::{Role, User};
use crate::error::AuthError;

/// Cookie holding the session JWT.
pub const TOKEN_COOKIE: &str = "token";
/// Cookie holding the OAuth state between sign-in and callback.
pub const STATE_COOKIE: &str = "csrf";

pub const TOKEN_MAX_AGE_SECS: i64 = 24 * 60 * 60;
pub const STATE_MAX_AGE_SECS: i64 = 60 * 60;

/// Claims carried by the session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: i64,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub picture: String,
    pub exp: i64,
}

impl Claims {
    pub fn has_role(&self, role: Role) -> bool {
        role.matches(&self.role)
    }
}

/// HS256 signing and verification of session tokens.
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: i64,
}

impl SessionKeys {
    pub fn new(secret: &SecretString) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            ttl_secs: TOKEN_MAX_AGE_SECS,
        }
    }

    /// Sign a session for `user`, expiring with the cookie.
    pub fn issue(&self, user: &User) -> Result<String, AuthError> {
        let claims = Claims {
            id: user.id,
            email: user.email.clone(),
            role: user.role.as_str().to_string(),
            picture: user.picture.clone(),
            exp: Utc::now().timestamp() + self.ttl_secs,
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        Ok(encode(&Header::new(Algorithm::HS256), claims, &self.encoding)?)
    }

    /// Verify signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Ok(decode::<Claims>(token, &self.decoding, &validation)?.claims)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("secret", &"[REDACTED]")
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

/// Attributes shared by every cookie the gateway sets.
#[derive(Debug, Clone)]
pub struct CookiePolicy {
    pub domain: String,
    /// Production: `Secure` and `SameSite=None`. Otherwise `SameSite=Lax`.
    pub secure: bool,
}

impl CookiePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            domain: config.cookie_domain.clone(),
            secure: config.is_production(),
        }
    }

    pub fn state_cookie(&self, state: String) -> Cookie<'static> {
        self.build(STATE_COOKIE, state, STATE_MAX_AGE_SECS)
    }

    pub fn token_cookie(&self, token: String) -> Cookie<'static> {
        self.build(TOKEN_COOKIE, token, TOKEN_MAX_AGE_SECS)
    }

    /// Immediately expired token cookie.
    pub fn clear_token_cookie(&self) -> Cookie<'static> {
        self.build(TOKEN_COOKIE, String::new(), 0)
    }

    fn build(&self, name: &'static str, value: String, max_age_secs: i64) -> Cookie<'static> {
        let same_site = if self.secure {
            SameSite::None
        } else {
            SameSite::Lax
        };
        Cookie::build((name, value))
            .path("/")
            .domain(self.domain.clone())
            .http_only(true)
            .secure(self.secure)
            .same_site(same_site)
            .max_age(time::Duration::seconds(max_age_secs))
            .build()
    }
}
