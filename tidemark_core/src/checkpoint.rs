//! Durable checkpoint storage.
//!
//! One checkpoint row exists per `(stream_key, subscription_name)` pair. It is
//! created on first subscribe, advanced on every acknowledgement and removed
//! on explicit unsubscribe; after a restart it is the sole source of truth for
//! where delivery resumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A durable subscription checkpoint row.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Row identifier.
    pub id: Uuid,
    /// Stream key the subscription is attached to (`$all` for all-streams).
    pub stream_key: String,
    /// Name identifying the subscription within the stream.
    pub subscription_name: String,
    /// Global position of the last acknowledged event.
    pub last_seen_event_number: u64,
    /// Per-stream position of the last acknowledged event.
    pub last_seen_stream_version: u64,
    /// When the subscription row was created.
    pub created_at: DateTime<Utc>,
}

/// Backend persisting subscription checkpoints.
///
/// Writes are partitioned by `(stream_key, subscription_name)`; per
/// subscription only one caller exists, so implementations need no
/// cross-partition coordination beyond what the storage itself provides.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// The error when a checkpoint operation fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates the checkpoint row, or returns the existing one.
    ///
    /// Creation is idempotent: a concurrent or repeated subscribe for the same
    /// pair converges on the row that won the insert. The starting cursors
    /// default to `0`, meaning "from origin".
    async fn subscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
        start_from_event_number: u64,
        start_from_stream_version: u64,
    ) -> Result<Checkpoint, Self::Error>;

    /// Advances the checkpoint to the acknowledged event.
    ///
    /// Both positions are stored atomically so a restart restores a coherent
    /// pair of cursors.
    async fn ack(
        &self,
        stream_key: &str,
        subscription_name: &str,
        event_number: u64,
        stream_version: u64,
    ) -> Result<(), Self::Error>;

    /// Deletes the checkpoint row. An absent row is not an error.
    async fn unsubscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<(), Self::Error>;

    /// Fetches the checkpoint row, or `None` if the subscription is unknown.
    async fn query(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<Option<Checkpoint>, Self::Error>;
}
