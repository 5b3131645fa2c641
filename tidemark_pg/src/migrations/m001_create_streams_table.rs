//! Migration 001: Create the streams registry.
//!
//! One row per logical stream, created by the writer on a stream's first
//! append. The reader uses it to tell an empty stream from a missing one.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the `tidemark_streams` table.
pub struct CreateStreamsTable;

#[async_trait]
impl Migration for CreateStreamsTable {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_streams_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tidemark_streams (
                stream_key VARCHAR(255) PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
