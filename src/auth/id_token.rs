//! Verification of OpenID Connect ID tokens.

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::AuthError;

pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
pub const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// Claims read from a verified ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Checks ID token signatures against the provider's published keys.
///
/// Keys are cached and refetched once when a token names an unknown `kid`.
pub struct IdTokenVerifier {
    http: reqwest::Client,
    jwks_url: Option<String>,
    audience: String,
    issuers: Vec<String>,
    keys: RwLock<Option<JwkSet>>,
}

impl IdTokenVerifier {
    pub fn google(client_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            jwks_url: Some(GOOGLE_JWKS_URL.to_string()),
            audience: client_id.into(),
            issuers: GOOGLE_ISSUERS.iter().map(|s| s.to_string()).collect(),
            keys: RwLock::new(None),
        }
    }

    /// A verifier with a fixed key set and no remote refresh.
    pub fn with_keys(keys: JwkSet, audience: impl Into<String>, issuers: &[&str]) -> Self {
        Self {
            http: reqwest::Client::new(),
            jwks_url: None,
            audience: audience.into(),
            issuers: issuers.iter().map(|s| s.to_string()).collect(),
            keys: RwLock::new(Some(keys)),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<IdTokenClaims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidIdToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidIdToken("token has no key id".to_string()))?;

        let key = match self.cached_key(&kid).await? {
            Some(key) => key,
            None => {
                self.refresh_keys().await?;
                self.cached_key(&kid).await?.ok_or_else(|| {
                    AuthError::InvalidIdToken(format!("unknown signing key '{}'", kid))
                })?
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_issuer(self.issuers.as_slice());

        let data = decode::<IdTokenClaims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidIdToken(e.to_string()))?;
        Ok(data.claims)
    }

    async fn cached_key(&self, kid: &str) -> Result<Option<DecodingKey>, AuthError> {
        let keys = self.keys.read().await;
        let Some(jwk) = keys.as_ref().and_then(|set| set.find(kid)) else {
            return Ok(None);
        };
        DecodingKey::from_jwk(jwk)
            .map(Some)
            .map_err(|e| AuthError::InvalidIdToken(e.to_string()))
    }

    async fn refresh_keys(&self) -> Result<(), AuthError> {
        let Some(url) = &self.jwks_url else {
            return Ok(());
        };
        let set: JwkSet = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::InvalidIdToken(format!("fetching signing keys: {}", e)))?
            .json()
            .await
            .map_err(|e| AuthError::InvalidIdToken(format!("parsing signing keys: {}", e)))?;
        tracing::debug!(keys = set.keys.len(), "Refreshed ID token signing keys");
        *self.keys.write().await = Some(set);
        Ok(())
    }
}
