//! Embedded libSQL store for login records and the sign-in allow-list.

pub mod models;

use std::path::Path;

use libsql::{Builder, Connection, Database, Row, params};

pub use models::{AllowedUser, Role, User, normalize_email};

use crate::error::DatabaseError;

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_create_users",
        sql: "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL,
                picture TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
    },
    Migration {
        version: "0002_create_allowed_users",
        sql: "CREATE TABLE IF NOT EXISTS allowed_users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL CHECK (role IN ('admin', 'mod', 'user')),
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_allowed_users_role ON allowed_users(role);",
    },
];

/// Handle to the gateway database.
pub struct Store {
    db: Database,
}

impl Store {
    /// Open (creating if needed) a local database file and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatabaseError::Connection(format!("{}: {}", parent.display(), e)))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        let store = Self { db };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "Database ready");
        Ok(store)
    }

    async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        // Wait on a locked database instead of failing with SQLITE_BUSY.
        // The pragma returns a row, so it goes through query().
        let mut rows = conn
            .query("PRAGMA busy_timeout = 5000", params![])
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        let _ = rows.next().await;
        Ok(conn)
    }

    async fn migrate(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            params![],
        )
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        for migration in MIGRATIONS {
            let mut rows = conn
                .query(
                    "SELECT 1 FROM schema_migrations WHERE version = ?1",
                    params![migration.version],
                )
                .await
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            if rows.next().await?.is_some() {
                continue;
            }

            conn.execute("BEGIN IMMEDIATE TRANSACTION", params![])
                .await
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            let result = async {
                conn.execute_batch(migration.sql).await?;
                conn.execute(
                    "INSERT INTO schema_migrations (version) VALUES (?1)",
                    params![migration.version],
                )
                .await?;
                Ok::<(), libsql::Error>(())
            }
            .await;
            if let Err(e) = result {
                rollback_quietly(&conn).await;
                return Err(DatabaseError::Migration(format!("{}: {}", migration.version, e)));
            }
            conn.execute("COMMIT TRANSACTION", params![])
                .await
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            tracing::debug!(version = migration.version, "Applied migration");
        }
        Ok(())
    }

    /// Insert the admin allowed user if no entry exists for `email`.
    /// Returns whether a row was created.
    pub async fn seed_admin(&self, email: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO allowed_users (email, role) VALUES (?1, ?2)",
                params![normalize_email(email), Role::Admin.as_str()],
            )
            .await?;
        if inserted > 0 {
            tracing::info!(email = %email, "Seeded admin allowed user");
        }
        Ok(inserted > 0)
    }

    pub async fn list_allowed_users(&self) -> Result<Vec<AllowedUser>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, email, role, created_at FROM allowed_users ORDER BY email",
                params![],
            )
            .await?;
        let mut users = Vec::new();
        while let Some(row) = rows.next().await? {
            users.push(allowed_from_row(&row)?);
        }
        Ok(users)
    }

    pub async fn find_allowed_user(&self, email: &str) -> Result<Option<AllowedUser>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, email, role, created_at FROM allowed_users WHERE email = ?1",
                params![normalize_email(email)],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(allowed_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Add an email to the allow-list. Fails with `Conflict` if it is already there.
    pub async fn add_allowed_user(&self, email: &str, role: Role) -> Result<AllowedUser, DatabaseError> {
        let email = normalize_email(email);
        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO allowed_users (email, role) VALUES (?1, ?2)",
                params![email.as_str(), role.as_str()],
            )
            .await?;
        if inserted == 0 {
            return Err(DatabaseError::Conflict {
                entity: "allowed user".to_string(),
                id: email,
            });
        }
        self.find_allowed_user(&email)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "allowed user".to_string(),
                id: email,
            })
    }

    /// Remove an email from the allow-list.
    ///
    /// The last-admin check and the delete share one immediate transaction.
    pub async fn remove_allowed_user(&self, email: &str) -> Result<(), DatabaseError> {
        let email = normalize_email(email);
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE TRANSACTION", params![]).await?;

        let result = async {
            let mut rows = conn
                .query(
                    "SELECT role FROM allowed_users WHERE email = ?1",
                    params![email.as_str()],
                )
                .await?;
            let Some(row) = rows.next().await? else {
                return Err(DatabaseError::NotFound {
                    entity: "allowed user".to_string(),
                    id: email.clone(),
                });
            };
            let role = parse_role(&row.get::<String>(0)?)?;
            drop(rows);

            if role == Role::Admin {
                let mut rows = conn
                    .query(
                        "SELECT COUNT(*) FROM allowed_users WHERE role = ?1",
                        params![Role::Admin.as_str()],
                    )
                    .await?;
                let admins = match rows.next().await? {
                    Some(row) => row.get::<i64>(0)?,
                    None => 0,
                };
                if admins <= 1 {
                    return Err(DatabaseError::LastAdmin);
                }
            }

            conn.execute(
                "DELETE FROM allowed_users WHERE email = ?1",
                params![email.as_str()],
            )
            .await?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => {
                conn.execute("COMMIT TRANSACTION", params![]).await?;
                tracing::info!(email = %email, "Removed allowed user");
                Ok(())
            }
            Err(e) => {
                rollback_quietly(&conn).await;
                Err(e)
            }
        }
    }

    /// Create or refresh the login record for `email`.
    pub async fn upsert_user(&self, email: &str, role: Role, picture: &str) -> Result<User, DatabaseError> {
        let email = normalize_email(email);
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO users (email, role, picture) VALUES (?1, ?2, ?3)
             ON CONFLICT(email) DO UPDATE SET
                role = excluded.role,
                picture = excluded.picture,
                updated_at = CURRENT_TIMESTAMP",
            params![email.as_str(), role.as_str(), picture],
        )
        .await?;
        self.find_user(&email)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "user".to_string(),
                id: email,
            })
    }

    pub async fn find_user(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, email, role, picture, created_at, updated_at FROM users WHERE email = ?1",
                params![normalize_email(email)],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(User {
            id: row.get::<i64>(0)?,
            email: row.get::<String>(1)?,
            role: parse_role(&row.get::<String>(2)?)?,
            picture: row.get::<String>(3)?,
            created_at: row.get::<String>(4)?,
            updated_at: row.get::<String>(5)?,
        }))
    }
}

async fn rollback_quietly(conn: &Connection) {
    let _ = conn.execute("ROLLBACK TRANSACTION", params![]).await;
}

fn parse_role(value: &str) -> Result<Role, DatabaseError> {
    value.parse().map_err(DatabaseError::Query)
}

fn allowed_from_row(row: &Row) -> Result<AllowedUser, DatabaseError> {
    Ok(AllowedUser {
        id: row.get::<i64>(0)?,
        email: row.get::<String>(1)?,
        role: parse_role(&row.get::<String>(2)?)?,
        created_at: row.get::<String>(3)?,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("data/app.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.db");
        Store::open(&path).await.unwrap();
        let reopened = Store::open(&path).await.unwrap();
        assert!(reopened.list_allowed_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seed_admin_once() {
        let (_dir, store) = store().await;
        assert!(store.seed_admin("Admin@Example.com").await.unwrap());
        assert!(!store.seed_admin("admin@example.com").await.unwrap());

        let users = store.list_allowed_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, "admin@example.com");
        assert_eq!(users[0].role, Role::Admin);
    }

    #[tokio::test]
    async fn test_add_duplicate_conflicts() {
        let (_dir, store) = store().await;
        store.add_allowed_user("a@x.io", Role::User).await.unwrap();
        let err = store.add_allowed_user("A@x.io", Role::Mod).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_last_admin_cannot_be_removed() {
        let (_dir, store) = store().await;
        store.seed_admin("root@x.io").await.unwrap();

        let err = store.remove_allowed_user("root@x.io").await.unwrap_err();
        assert!(matches!(err, DatabaseError::LastAdmin));
        assert!(store.find_allowed_user("root@x.io").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_admin_removable_when_another_exists() {
        let (_dir, store) = store().await;
        store.seed_admin("root@x.io").await.unwrap();
        store.add_allowed_user("second@x.io", Role::Admin).await.unwrap();

        store.remove_allowed_user("root@x.io").await.unwrap();
        assert!(store.find_allowed_user("root@x.io").await.unwrap().is_none());

        let err = store.remove_allowed_user("second@x.io").await.unwrap_err();
        assert!(matches!(err, DatabaseError::LastAdmin));
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_found() {
        let (_dir, store) = store().await;
        let err = store.remove_allowed_user("ghost@x.io").await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_non_admin() {
        let (_dir, store) = store().await;
        store.seed_admin("root@x.io").await.unwrap();
        store.add_allowed_user("u@x.io", Role::User).await.unwrap();
        store.remove_allowed_user("u@x.io").await.unwrap();
        assert_eq!(store.list_allowed_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_user_mirrors_latest_role() {
        let (_dir, store) = store().await;
        let first = store
            .upsert_user("p@x.io", Role::User, "https://img/1")
            .await
            .unwrap();
        let second = store
            .upsert_user("p@x.io", Role::Mod, "https://img/2")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.role, Role::Mod);
        assert_eq!(second.picture, "https://img/2");
        assert!(store.find_user("nobody@x.io").await.unwrap().is_none());
    }
}
