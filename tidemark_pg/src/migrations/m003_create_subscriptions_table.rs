//! Migration 003: Create the subscriptions table.
//!
//! One checkpoint row per `(stream_key, subscription_name)`. The unique
//! constraint is what makes subscription creation idempotent: a losing
//! insert reads the winning row back.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the `tidemark_subscriptions` checkpoint table.
pub struct CreateSubscriptionsTable;

#[async_trait]
impl Migration for CreateSubscriptionsTable {
    fn version(&self) -> i64 {
        3
    }

    fn name(&self) -> &'static str {
        "create_subscriptions_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tidemark_subscriptions (
                id UUID PRIMARY KEY,
                stream_key VARCHAR(255) NOT NULL,
                subscription_name VARCHAR(255) NOT NULL,
                last_seen_event_number BIGINT NOT NULL DEFAULT 0,
                last_seen_stream_version BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT unique_stream_subscription UNIQUE (stream_key, subscription_name)
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
