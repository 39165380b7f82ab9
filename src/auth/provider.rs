//! Identity providers the sign-in flow can delegate to.

use async_trait::async_trait;

use super::id_token::IdTokenVerifier;
use super::oauth::{OAuthClient, OAuthConfig};
use crate::error::AuthError;

/// Who the provider says signed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub email: Option<String>,
    pub picture: Option<String>,
}

/// An OAuth identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Where to send the browser to start signing in.
    fn authorization_url(&self, state: &str) -> String;

    /// Trade the callback's authorization code for a verified identity.
    async fn authenticate(&self, code: &str) -> Result<Identity, AuthError>;
}

/// Google sign-in: code exchange plus ID token verification.
pub struct GoogleProvider {
    client: OAuthClient,
    verifier: IdTokenVerifier,
}

impl GoogleProvider {
    pub fn new(config: OAuthConfig) -> Self {
        let verifier = IdTokenVerifier::google(config.client_id.clone());
        Self {
            client: OAuthClient::new(config),
            verifier,
        }
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn authorization_url(&self, state: &str) -> String {
        self.client.authorization_url(state)
    }

    async fn authenticate(&self, code: &str) -> Result<Identity, AuthError> {
        let tokens = self.client.exchange_code(code).await?;
        let id_token = tokens.id_token.ok_or_else(|| {
            AuthError::InvalidIdToken("token response carries no id_token".to_string())
        })?;
        let claims = self.verifier.verify(&id_token).await?;
        Ok(Identity {
            subject: claims.sub,
            email: claims.email,
            picture: claims.picture,
        })
    }
}
