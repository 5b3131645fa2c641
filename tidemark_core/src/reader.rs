//! Historical event reading.
//!
//! The reader hands out a lazy, finite sequence of event batches strictly
//! after a given cursor. The sequence is a snapshot of what existed at call
//! time; reaching live is the job of the subscription state machine, which
//! reconciles the snapshot with broadcast hints.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::event::RecordedEvent;

/// A lazy, finite sequence of event batches.
pub type EventBatchStream =
    Pin<Box<dyn Stream<Item = Result<Vec<RecordedEvent>, ReadError>> + Send>>;

/// Errors raised while reading historical events.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The requested stream does not exist.
    #[error("stream {0:?} does not exist")]
    StreamNotFound(String),
    /// The underlying storage failed.
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Backend reading recorded events forward from a cursor.
#[async_trait]
pub trait HistoricalReader: Send + Sync + 'static {
    /// Returns batches of events strictly after `last_seen`.
    ///
    /// For the `$all` stream key the cursor is the global `event_number` and
    /// batches are ordered by it; for any other key the cursor is the
    /// per-stream `stream_version`. Each batch holds at most `batch_size`
    /// events. The sequence terminates once the events present at call time
    /// are exhausted.
    ///
    /// # Errors
    ///
    /// [`ReadError::StreamNotFound`] when a single-stream key has no backing
    /// stream; transport failures surface as [`ReadError::Storage`].
    async fn unseen_event_stream(
        &self,
        stream_key: &str,
        last_seen: u64,
        batch_size: u32,
    ) -> Result<EventBatchStream, ReadError>;
}
