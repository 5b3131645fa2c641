//! PostgreSQL checkpoint store.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use tidemark_core::{Checkpoint, CheckpointStore};

/// Errors returned by the postgres store.
#[derive(Debug, thiserror::Error)]
pub enum PgStoreError {
    /// A database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Postgres representation of a subscription checkpoint row.
#[derive(Debug, FromRow)]
struct PgCheckpointRow {
    id: Uuid,
    stream_key: String,
    subscription_name: String,
    last_seen_event_number: i64,
    last_seen_stream_version: i64,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<PgCheckpointRow> for Checkpoint {
    fn from(row: PgCheckpointRow) -> Self {
        Checkpoint {
            id: row.id,
            stream_key: row.stream_key,
            subscription_name: row.subscription_name,
            last_seen_event_number: row.last_seen_event_number as u64,
            last_seen_stream_version: row.last_seen_stream_version as u64,
            created_at: row.created_at,
        }
    }
}

const SELECT_CHECKPOINT: &str = r#"
    SELECT id, stream_key, subscription_name,
           last_seen_event_number, last_seen_stream_version, created_at
    FROM tidemark_subscriptions
    WHERE stream_key = $1 AND subscription_name = $2
    "#;

/// A [`CheckpointStore`] over a postgres pool.
#[derive(Clone, Debug)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        log::debug!("creating a new PgCheckpointStore");
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    type Error = PgStoreError;

    async fn subscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
        start_from_event_number: u64,
        start_from_stream_version: u64,
    ) -> Result<Checkpoint, Self::Error> {
        let inserted: Option<PgCheckpointRow> = sqlx::query_as(
            r#"
            INSERT INTO tidemark_subscriptions
                (id, stream_key, subscription_name,
                 last_seen_event_number, last_seen_stream_version)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stream_key, subscription_name) DO NOTHING
            RETURNING id, stream_key, subscription_name,
                      last_seen_event_number, last_seen_stream_version, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(stream_key)
        .bind(subscription_name)
        .bind(start_from_event_number as i64)
        .bind(start_from_stream_version as i64)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok(row.into()),
            None => {
                // Lost the insert race or resubscribed: converge on the row
                // that exists.
                let row: PgCheckpointRow = sqlx::query_as(SELECT_CHECKPOINT)
                    .bind(stream_key)
                    .bind(subscription_name)
                    .fetch_one(&self.pool)
                    .await?;
                Ok(row.into())
            }
        }
    }

    async fn ack(
        &self,
        stream_key: &str,
        subscription_name: &str,
        event_number: u64,
        stream_version: u64,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            UPDATE tidemark_subscriptions
            SET last_seen_event_number = $3, last_seen_stream_version = $4
            WHERE stream_key = $1 AND subscription_name = $2
            "#,
        )
        .bind(stream_key)
        .bind(subscription_name)
        .bind(event_number as i64)
        .bind(stream_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn unsubscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            DELETE FROM tidemark_subscriptions
            WHERE stream_key = $1 AND subscription_name = $2
            "#,
        )
        .bind(stream_key)
        .bind(subscription_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<Option<Checkpoint>, Self::Error> {
        let row: Option<PgCheckpointRow> = sqlx::query_as(SELECT_CHECKPOINT)
            .bind(stream_key)
            .bind(subscription_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }
}
