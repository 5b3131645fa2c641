//! PostgreSQL historical reader.

use async_stream::try_stream;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use tidemark_core::reader::EventBatchStream;
use tidemark_core::{HistoricalReader, ReadError, RecordedEvent, SubscriptionKind};

/// Postgres representation of a recorded event.
#[derive(Debug, FromRow)]
struct PgEventRow {
    event_id: Uuid,
    event_number: i64,
    stream_key: String,
    stream_version: i64,
    event_type: String,
    correlation_id: Option<Uuid>,
    causation_id: Option<Uuid>,
    payload: Option<serde_json::Value>,
    metadata: Option<serde_json::Value>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<PgEventRow> for RecordedEvent {
    fn from(row: PgEventRow) -> Self {
        RecordedEvent {
            event_id: row.event_id,
            event_number: row.event_number as u64,
            stream_key: row.stream_key,
            stream_version: row.stream_version as u64,
            event_type: row.event_type,
            correlation_id: row.correlation_id,
            causation_id: row.causation_id,
            payload: row.payload,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

const SELECT_EVENT_COLUMNS: &str = r#"
    SELECT event_id, event_number, stream_key, stream_version, event_type,
           correlation_id, causation_id, payload, metadata, created_at
    FROM tidemark_events
    "#;

fn storage(error: sqlx::Error) -> ReadError {
    ReadError::Storage(Box::new(error))
}

/// A [`HistoricalReader`] over a postgres pool.
///
/// The stream captures an upper bound at call time, so appends that commit
/// while a catch-up is in flight are left for the next round.
#[derive(Clone, Debug)]
pub struct PgHistoricalReader {
    pool: PgPool,
}

impl PgHistoricalReader {
    /// Creates a reader over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        log::debug!("creating a new PgHistoricalReader");
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl HistoricalReader for PgHistoricalReader {
    async fn unseen_event_stream(
        &self,
        stream_key: &str,
        last_seen: u64,
        batch_size: u32,
    ) -> Result<EventBatchStream, ReadError> {
        let kind = SubscriptionKind::of(stream_key);
        let pool = self.pool.clone();
        let stream_key = stream_key.to_string();

        // Snapshot bound, taken before any batch is read.
        let bound: i64 = match kind {
            SubscriptionKind::SingleStream => {
                let (exists,): (bool,) = sqlx::query_as(
                    "SELECT EXISTS(SELECT 1 FROM tidemark_streams WHERE stream_key = $1)",
                )
                .bind(&stream_key)
                .fetch_one(&pool)
                .await
                .map_err(storage)?;
                if !exists {
                    return Err(ReadError::StreamNotFound(stream_key));
                }
                sqlx::query_as::<_, (i64,)>(
                    "SELECT COALESCE(MAX(stream_version), 0) FROM tidemark_events WHERE stream_key = $1",
                )
                .bind(&stream_key)
                .fetch_one(&pool)
                .await
                .map_err(storage)?
                .0
            }
            SubscriptionKind::AllStreams => {
                sqlx::query_as::<_, (i64,)>(
                    "SELECT COALESCE(MAX(event_number), 0) FROM tidemark_events",
                )
                .fetch_one(&pool)
                .await
                .map_err(storage)?
                .0
            }
        };

        let stream = try_stream! {
            let mut cursor = last_seen as i64;
            while cursor < bound {
                let rows: Vec<PgEventRow> = match kind {
                    SubscriptionKind::SingleStream => {
                        sqlx::query_as(&format!(
                            "{SELECT_EVENT_COLUMNS}
                             WHERE stream_key = $1 AND stream_version > $2 AND stream_version <= $3
                             ORDER BY stream_version ASC
                             LIMIT $4"
                        ))
                        .bind(&stream_key)
                        .bind(cursor)
                        .bind(bound)
                        .bind(batch_size as i64)
                        .fetch_all(&pool)
                        .await
                        .map_err(storage)?
                    }
                    SubscriptionKind::AllStreams => {
                        sqlx::query_as(&format!(
                            "{SELECT_EVENT_COLUMNS}
                             WHERE event_number > $1 AND event_number <= $2
                             ORDER BY event_number ASC
                             LIMIT $3"
                        ))
                        .bind(cursor)
                        .bind(bound)
                        .bind(batch_size as i64)
                        .fetch_all(&pool)
                        .await
                        .map_err(storage)?
                    }
                };
                if rows.is_empty() {
                    break;
                }
                cursor = {
                    let last = &rows[rows.len() - 1];
                    match kind {
                        SubscriptionKind::SingleStream => last.stream_version,
                        SubscriptionKind::AllStreams => last.event_number,
                    }
                };
                let batch: Vec<RecordedEvent> = rows.into_iter().map(Into::into).collect();
                yield batch;
            }
        };

        Ok(Box::pin(stream))
    }
}
