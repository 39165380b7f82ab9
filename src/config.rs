//! Gateway configuration, built once at startup from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::auth::oauth::OAuthConfig;
use crate::error::ConfigError;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    /// Anything other than `production` is treated as development.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("production") {
            AppEnv::Production
        } else {
            AppEnv::Development
        }
    }
}

/// PEM certificate and key used when serving HTTPS.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Immutable gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: AppEnv,
    pub port: u16,
    /// Directory holding the database file.
    pub data_dir: PathBuf,
    /// Root of the file API sandbox.
    pub volume_dir: PathBuf,
    /// Host-side prefix for container volume binds (`<prefix>/<container>/<volume>`).
    pub host_volume_dir: String,
    pub db_filename: String,
    /// CORS origin and post-login redirect target.
    pub allow_origin: String,
    pub cookie_domain: String,
    pub tls: Option<TlsConfig>,
    pub oauth: OAuthConfig,
    pub jwt_secret: SecretString,
    /// Email seeded as the first admin allowed user.
    pub admin_email: String,
}

impl Config {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let with_default =
            |key: &str, default: &str| optional(key).unwrap_or_else(|| default.to_string());
        let required =
            |key: &str| optional(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let port_raw = with_default("PORT", "8181");
        let port = port_raw
            .parse::<u16>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "PORT".to_string(),
                message: format!("'{}': {}", port_raw, e),
            })?;

        let tls = match (optional("SSL_CERT_FILE"), optional("SSL_KEY_FILE")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_file: PathBuf::from(cert),
                key_file: PathBuf::from(key),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingEnvVar("SSL_KEY_FILE".to_string())),
            (None, Some(_)) => return Err(ConfigError::MissingEnvVar("SSL_CERT_FILE".to_string())),
        };

        let oauth = OAuthConfig::google(
            required("GOOGLE_CLIENT_ID")?,
            SecretString::from(required("GOOGLE_CLIENT_SECRET")?),
            absolute_url("GOOGLE_REDIRECT_URL", required("GOOGLE_REDIRECT_URL")?)?,
        );
        let allow_origin = absolute_url(
            "ALLOW_ORIGIN",
            with_default("ALLOW_ORIGIN", "http://localhost:8282"),
        )?;

        let admin_email = required("ADMIN_EMAIL")?;
        if !admin_email.contains('@') {
            return Err(ConfigError::InvalidValue {
                key: "ADMIN_EMAIL".to_string(),
                message: format!("'{}' is not an email address", admin_email),
            });
        }

        Ok(Self {
            app_env: AppEnv::parse(&with_default("APP_ENV", "development")),
            port,
            data_dir: PathBuf::from(with_default("DATA_DIR", "/gsm-data")),
            volume_dir: PathBuf::from(with_default("VOLUME_DIR", "/volumes")),
            host_volume_dir: with_default("HOST_VOLUME_DIR", "/gsm/volumes"),
            db_filename: with_default("DB_FILENAME", "app.db"),
            allow_origin,
            cookie_domain: with_default("COOKIE_DOMAIN", "localhost"),
            tls,
            oauth,
            jwt_secret: SecretString::from(with_default("JWT_SECRET", "secret")),
            admin_email,
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env == AppEnv::Production
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_filename)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

/// Check that `value` is an absolute http(s) URL, returning it unchanged.
fn absolute_url(key: &str, value: String) -> Result<String, ConfigError> {
    match url::Url::parse(&value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(value),
        Ok(parsed) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("unsupported scheme '{}'", parsed.scheme()),
        }),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}': {}", value, e),
        }),
    }
}
