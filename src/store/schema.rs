//! Schema open, migrate, and validate.
//!
//! Migrations are embedded at compile time via `sqlx::migrate!("./migrations")`,
//! the same mechanism the teacher's `SQLiteCheckpointer::connect` uses. Each
//! migration step runs inside its own transaction — a partial failure never
//! leaves the schema at an intermediate version.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use tracing::instrument;

use crate::errors::SchemaError;

/// Expected tables; used by [`SchemaManager::validate`].
const EXPECTED_TABLES: &[&str] = &[
    "schema_version",
    "queue_sessions",
    "queue_tasks",
    "queue_metrics",
    "process_heartbeat",
    "circuit_breaker_state",
];

/// Owns the connection pool and brings the store to the expected schema
/// version.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    pool: SqlitePool,
}

impl SchemaManager {
    /// Open (creating if absent) the SQLite database at `path` and run
    /// embedded migrations.
    #[instrument(skip(path), err)]
    pub async fn open(path: &Path) -> Result<Self, SchemaError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SchemaError::OpenFailed {
                    path: path.display().to_string(),
                    source: sqlx::Error::Io(e),
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|source| SchemaError::OpenFailed {
                path: path.display().to_string(),
                source,
            })?;

        let manager = SchemaManager { pool };
        manager.initialize_schema().await?;
        Ok(manager)
    }

    /// Construct directly from an existing pool — used by tests that want
    /// an in-memory database shared across a single test.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        SchemaManager { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotently apply all embedded migrations, then record each one's
    /// version/description/checksum into `schema_version` — sqlx's own
    /// bookkeeping table is private to sqlx, so this crate keeps its own
    /// ledger for `current_version`/`validate` to read.
    #[instrument(skip(self), err)]
    pub async fn initialize_schema(&self) -> Result<(), SchemaError> {
        let migrator = sqlx::migrate!("./migrations");
        migrator
            .run(&self.pool)
            .await
            .map_err(|source| SchemaError::MigrationFailed {
                version: "latest".to_string(),
                source,
            })?;
        self.record_applied_migrations(&migrator).await
    }

    async fn record_applied_migrations(
        &self,
        migrator: &sqlx::migrate::Migrator,
    ) -> Result<(), SchemaError> {
        for migration in migrator.iter() {
            sqlx::query(
                r"
                INSERT OR IGNORE INTO schema_version (version, applied_at, description, checksum)
                VALUES (?1, ?2, ?3, ?4)
                ",
            )
            .bind(migration.version.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(migration.description.to_string())
            .bind(hex_encode(&migration.checksum))
            .execute(&self.pool)
            .await
            .map_err(|source| SchemaError::MigrationFailed {
                version: migration.version.to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// The most recently applied migration version, if any have run.
    #[instrument(skip(self), err)]
    pub async fn current_version(&self) -> Result<Option<String>, SchemaError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT version FROM schema_version ORDER BY applied_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|source| SchemaError::OpenFailed {
            path: "<pool>".to_string(),
            source,
        })?;
        Ok(row.map(|(v,)| v))
    }

    /// Whether the schema is not yet at `target` (the version string
    /// recorded by an embedded migration, e.g. `"0001"`).
    #[instrument(skip(self), err)]
    pub async fn needs_migration(&self, target: &str) -> Result<bool, SchemaError> {
        Ok(self.current_version().await?.as_deref() != Some(target))
    }

    /// Bring the schema up to `target`, applying every embedded migration
    /// (sqlx replays the full embedded set; there is no partial-forward
    /// application for a fixed, compile-time migration directory) and
    /// confirming `target` ended up recorded in `schema_version`.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self, target: &str) -> Result<(), SchemaError> {
        self.initialize_schema().await?;
        if self.current_version().await?.as_deref() != Some(target) {
            return Err(SchemaError::Invalid {
                reason: format!("target version `{target}` is not among the embedded migrations"),
            });
        }
        Ok(())
    }

    /// Every expected table exists and the version row is readable.
    #[instrument(skip(self), err)]
    pub async fn validate(&self) -> Result<bool, SchemaError> {
        for table in EXPECTED_TABLES {
            let exists: Option<(String,)> = sqlx::query_as(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            )
            .bind(table)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| SchemaError::OpenFailed {
                path: "<pool>".to_string(),
                source,
            })?;

            if exists.is_none() {
                return Err(SchemaError::Invalid {
                    reason: format!("missing expected table `{table}`"),
                });
            }
        }
        Ok(true)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_in_memory() -> SchemaManager {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let manager = SchemaManager::from_pool(pool);
        manager.initialize_schema().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn initialize_schema_creates_all_tables() {
        let manager = open_in_memory().await;
        assert!(manager.validate().await.unwrap());
    }

    #[tokio::test]
    async fn initialize_schema_is_idempotent() {
        let manager = open_in_memory().await;
        manager.initialize_schema().await.unwrap();
        assert!(manager.validate().await.unwrap());
    }

    #[tokio::test]
    async fn current_version_reflects_the_recorded_migration() {
        let manager = open_in_memory().await;
        let version = manager.current_version().await.unwrap();
        assert!(version.is_some());
        assert!(!manager.needs_migration(version.as_deref().unwrap()).await.unwrap());
        assert!(manager.needs_migration("9999").await.unwrap());
    }

    #[tokio::test]
    async fn migrate_to_the_recorded_version_succeeds() {
        let manager = open_in_memory().await;
        let version = manager.current_version().await.unwrap().unwrap();
        manager.migrate(&version).await.unwrap();
    }

    #[tokio::test]
    async fn migrate_to_an_unknown_target_fails() {
        let manager = open_in_memory().await;
        assert!(manager.migrate("9999").await.is_err());
    }
}
