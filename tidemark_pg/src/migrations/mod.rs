//! Database migration system for tidemark_pg.
//!
//! Migrations are versioned, checksummed and tracked in the
//! `_tidemark_migrations` table. They are forward-only: events are immutable
//! and subscriptions rebuild from their checkpoints, so rollbacks buy nothing
//! but data-loss risk.
//!
//! To add a migration, create `mXXX_description.rs` next to the existing
//! ones, implement [`Migration`], and append it to the `MIGRATIONS` array.

mod m001_create_streams_table;
mod m002_create_events_table;
mod m003_create_subscriptions_table;

use m001_create_streams_table::CreateStreamsTable;
use m002_create_events_table::CreateEventsTable;
use m003_create_subscriptions_table::CreateSubscriptionsTable;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// All migrations in order. Add new migrations to the end.
const MIGRATIONS: &[&dyn Migration] = &[
    &CreateStreamsTable,
    &CreateEventsTable,
    &CreateSubscriptionsTable,
];

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration's checksum doesn't match what was previously applied.
    #[error("migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// The version of the migration with the mismatched checksum.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The checksum recorded in the database.
        expected: String,
        /// The checksum computed from the code.
        found: String,
    },

    /// A migration failed to execute.
    #[error("migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        /// The version of the migration that failed.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The reason for the failure.
        reason: String,
    },
}

/// A single database migration.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, sequential version number.
    fn version(&self) -> i64;

    /// Human-readable name, like `create_events_table`.
    fn name(&self) -> &'static str;

    /// Executes the migration inside the provided transaction. The migrator
    /// manages commit and rollback.
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError>;

    /// Checksum of this migration for tamper detection.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_le_bytes());
        hasher.update(self.name().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Record of a migration that has been applied.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    /// The version number of the migration.
    pub version: i64,
    /// The name of the migration.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// The checksum recorded when the migration was applied.
    pub checksum: String,
}

/// Runs migrations in order, exactly once, each in its own transaction.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a migrator over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _tidemark_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Runs all pending migrations and returns how many were applied.
    ///
    /// If a migration fails its transaction is rolled back; previously
    /// applied migrations stay committed.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        self.ensure_tracking_table().await?;

        let applied = self.applied().await?;
        for applied_migration in &applied {
            if let Some(migration) = MIGRATIONS
                .iter()
                .find(|m| m.version() == applied_migration.version)
            {
                let current_checksum = migration.checksum();
                if current_checksum != applied_migration.checksum {
                    return Err(MigrationError::ChecksumMismatch {
                        version: applied_migration.version,
                        name: applied_migration.name.clone(),
                        expected: applied_migration.checksum.clone(),
                        found: current_checksum,
                    });
                }
            }
        }

        let applied_versions: std::collections::HashSet<i64> =
            applied.iter().map(|m| m.version).collect();

        let mut count = 0;
        for migration in MIGRATIONS {
            if applied_versions.contains(&migration.version()) {
                continue;
            }

            log::info!(
                "running migration {} ({})...",
                migration.version(),
                migration.name()
            );

            let mut tx = self.pool.begin().await?;

            migration.up(&mut tx).await.map_err(|e| match e {
                MigrationError::Database(db_err) => MigrationError::MigrationFailed {
                    version: migration.version(),
                    name: migration.name().to_string(),
                    reason: db_err.to_string(),
                },
                other => other,
            })?;

            sqlx::query(
                r#"
                INSERT INTO _tidemark_migrations (version, name, checksum)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(migration.version())
            .bind(migration.name())
            .bind(migration.checksum())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            log::info!(
                "migration {} ({}) applied",
                migration.version(),
                migration.name()
            );
            count += 1;
        }

        Ok(count)
    }

    /// Returns the current migration version (0 if none applied).
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_tracking_table().await?;

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT version FROM _tidemark_migrations
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(v,)| v).unwrap_or(0))
    }

    /// Returns all migrations that have not been applied yet.
    pub async fn pending(&self) -> Result<Vec<&'static dyn Migration>, MigrationError> {
        self.ensure_tracking_table().await?;

        let applied_versions: std::collections::HashSet<i64> =
            self.applied().await?.iter().map(|m| m.version).collect();

        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied_versions.contains(&m.version()))
            .copied()
            .collect())
    }

    /// Returns all applied migrations, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;

        let rows = sqlx::query(
            r#"
            SELECT version, name, applied_at, checksum
            FROM _tidemark_migrations
            ORDER BY version ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AppliedMigration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: row.get("applied_at"),
                checksum: row.get("checksum"),
            })
            .collect())
    }
}
