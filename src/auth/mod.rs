//! Sign-in through an OAuth identity provider and cookie-held JWT sessions.

pub mod id_token;
pub mod middleware;
pub mod oauth;
pub mod provider;
pub mod session;

pub use middleware::{Session, require_role, require_user, session_layer};
pub use oauth::{OAuthConfig, generate_state};
pub use provider::{GoogleProvider, Identity, IdentityProvider};
pub use session::{Claims, CookiePolicy, STATE_COOKIE, SessionKeys, TOKEN_COOKIE};
