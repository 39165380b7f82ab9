//! Persisted records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Access level attached to an allowed user and carried in session claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Mod,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Mod => "mod",
            Role::User => "user",
        }
    }

    /// Case-insensitive match against a role name taken from a token.
    pub fn matches(&self, claimed: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(claimed.trim())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "mod" => Ok(Role::Mod),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Login record, refreshed on every successful sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: Role,
    pub picture: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Entry in the sign-in allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowedUser {
    pub id: i64,
    pub email: String,
    pub role: Role,
    pub created_at: String,
}

/// Emails are compared and stored trimmed and lowercased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_is_case_insensitive() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(" MOD ".parse::<Role>().unwrap(), Role::Mod);
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_matches() {
        assert!(Role::Admin.matches("admin"));
        assert!(Role::Admin.matches("ADMIN"));
        assert!(!Role::Admin.matches("user"));
        assert!(!Role::Admin.matches(""));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Mod).unwrap(), "\"mod\"");
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Admin@Example.COM "), "admin@example.com");
    }
}
