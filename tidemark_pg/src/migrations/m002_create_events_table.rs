//! Migration 002: Create the events table.
//!
//! Events are append-only. `event_number` is a single global sequence and
//! `stream_version` is dense per stream starting at 1; both carry unique
//! constraints so the reader can page on either coordinate.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the `tidemark_events` table and its ordering constraints.
pub struct CreateEventsTable;

#[async_trait]
impl Migration for CreateEventsTable {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "create_events_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tidemark_events (
                event_id UUID PRIMARY KEY,
                event_number BIGINT NOT NULL,
                stream_key VARCHAR(255) NOT NULL,
                stream_version BIGINT NOT NULL,
                event_type VARCHAR(255) NOT NULL,
                correlation_id UUID,
                causation_id UUID,
                payload JSONB,
                metadata JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT unique_event_number UNIQUE (event_number),
                CONSTRAINT unique_stream_position UNIQUE (stream_key, stream_version)
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
