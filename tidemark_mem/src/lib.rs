//! # Tidemark in-memory store
//!
//! In-memory implementations of the Tidemark storage traits. Useful for
//! testing and development; nothing here survives a process restart, so it is
//! not recommended for production use.
//!
//! [`MemEventLog`] doubles as the writer: [`MemEventLog::append`] assigns
//! dense per-stream versions and contiguous global event numbers, then
//! publishes the batch on the broadcast bus the way the real writer must.

#![deny(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use tidemark_core::reader::EventBatchStream;
use tidemark_core::{
    ALL_STREAMS, Bus, Checkpoint, CheckpointStore, HistoricalReader, ProposedEvent, ReadError,
    RecordedEvent, SubscriptionKind,
};

/// Errors raised by the in-memory checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum MemCheckpointError {}

/// In-memory implementation of [`CheckpointStore`].
#[derive(Debug, Default)]
pub struct MemCheckpointStore {
    rows: Mutex<HashMap<(String, String), Checkpoint>>,
}

impl MemCheckpointStore {
    /// Creates an empty checkpoint store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemCheckpointStore {
    type Error = MemCheckpointError;

    async fn subscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
        start_from_event_number: u64,
        start_from_stream_version: u64,
    ) -> Result<Checkpoint, Self::Error> {
        let mut rows = self.rows.lock().await;
        let key = (stream_key.to_string(), subscription_name.to_string());
        Ok(rows
            .entry(key)
            .or_insert_with(|| {
                log::debug!(
                    "creating subscription {:?} on {:?} from ({}, {})",
                    subscription_name,
                    stream_key,
                    start_from_event_number,
                    start_from_stream_version
                );
                Checkpoint {
                    id: Uuid::new_v4(),
                    stream_key: stream_key.to_string(),
                    subscription_name: subscription_name.to_string(),
                    last_seen_event_number: start_from_event_number,
                    last_seen_stream_version: start_from_stream_version,
                    created_at: Utc::now(),
                }
            })
            .clone())
    }

    async fn ack(
        &self,
        stream_key: &str,
        subscription_name: &str,
        event_number: u64,
        stream_version: u64,
    ) -> Result<(), Self::Error> {
        let mut rows = self.rows.lock().await;
        let key = (stream_key.to_string(), subscription_name.to_string());
        if let Some(row) = rows.get_mut(&key) {
            row.last_seen_event_number = event_number;
            row.last_seen_stream_version = stream_version;
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<(), Self::Error> {
        let mut rows = self.rows.lock().await;
        rows.remove(&(stream_key.to_string(), subscription_name.to_string()));
        Ok(())
    }

    async fn query(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<Option<Checkpoint>, Self::Error> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(&(stream_key.to_string(), subscription_name.to_string()))
            .cloned())
    }
}

/// Errors raised when appending to the in-memory log.
#[derive(Debug, thiserror::Error)]
pub enum MemAppendError {
    /// `$all` addresses every stream and cannot be appended to.
    #[error("stream key {0:?} is reserved")]
    ReservedStreamKey(String),
}

#[derive(Debug, Default)]
struct EventLogData {
    events: Vec<RecordedEvent>,
    stream_versions: HashMap<String, u64>,
}

/// In-memory event log implementing [`HistoricalReader`], with a writer side.
#[derive(Debug)]
pub struct MemEventLog {
    data: Mutex<EventLogData>,
    bus: Arc<Bus>,
}

impl MemEventLog {
    /// Creates an empty log publishing appends on the given bus.
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            data: Mutex::new(EventLogData::default()),
            bus,
        }
    }

    /// The bus appends are published on.
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Appends a batch to a stream and publishes it.
    ///
    /// Versions are assigned densely per stream starting at 1 and event
    /// numbers contiguously across the log; the recorded batch goes out on
    /// the stream's topic and on `$all` once the append is in place.
    pub async fn append(
        &self,
        stream_key: &str,
        proposed: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>, MemAppendError> {
        if stream_key == ALL_STREAMS {
            return Err(MemAppendError::ReservedStreamKey(stream_key.to_string()));
        }
        let recorded = {
            let mut data = self.data.lock().await;
            let mut version = data.stream_versions.get(stream_key).copied().unwrap_or(0);
            let mut event_number = data.events.len() as u64;
            let mut recorded = Vec::with_capacity(proposed.len());
            for event in proposed {
                version += 1;
                event_number += 1;
                recorded.push(RecordedEvent {
                    event_id: event.event_id,
                    event_number,
                    stream_key: stream_key.to_string(),
                    stream_version: version,
                    event_type: event.event_type,
                    correlation_id: event.correlation_id,
                    causation_id: event.causation_id,
                    payload: event.payload,
                    metadata: event.metadata,
                    created_at: Utc::now(),
                });
            }
            data.stream_versions.insert(stream_key.to_string(), version);
            data.events.extend(recorded.iter().cloned());
            recorded
        };
        self.bus.publish_appended(stream_key, recorded.clone());
        Ok(recorded)
    }

    /// Number of events in the log.
    pub async fn len(&self) -> usize {
        self.data.lock().await.events.len()
    }

    /// Whether the log holds no events.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl HistoricalReader for MemEventLog {
    async fn unseen_event_stream(
        &self,
        stream_key: &str,
        last_seen: u64,
        batch_size: u32,
    ) -> Result<EventBatchStream, ReadError> {
        let kind = SubscriptionKind::of(stream_key);
        let data = self.data.lock().await;
        if kind == SubscriptionKind::SingleStream
            && !data.stream_versions.contains_key(stream_key)
        {
            return Err(ReadError::StreamNotFound(stream_key.to_string()));
        }
        let unseen: Vec<RecordedEvent> = data
            .events
            .iter()
            .filter(|e| match kind {
                SubscriptionKind::AllStreams => e.event_number > last_seen,
                SubscriptionKind::SingleStream => {
                    e.stream_key == stream_key && e.stream_version > last_seen
                }
            })
            .cloned()
            .collect();
        let batches: Vec<Result<Vec<RecordedEvent>, ReadError>> = unseen
            .chunks(batch_size.max(1) as usize)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(batches)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn append_assigns_dense_versions_and_contiguous_numbers() {
        let log = MemEventLog::new(Arc::new(Bus::new()));
        log.append("orders", vec![ProposedEvent::of_type("A")])
            .await
            .unwrap();
        let billing = log
            .append("billing", vec![ProposedEvent::of_type("B"), ProposedEvent::of_type("C")])
            .await
            .unwrap();
        let orders = log
            .append("orders", vec![ProposedEvent::of_type("D")])
            .await
            .unwrap();

        assert_eq!(billing[0].stream_version, 1);
        assert_eq!(billing[1].stream_version, 2);
        assert_eq!(billing[0].event_number, 2);
        assert_eq!(billing[1].event_number, 3);
        assert_eq!(orders[0].stream_version, 2);
        assert_eq!(orders[0].event_number, 4);
    }

    #[tokio::test]
    async fn append_publishes_on_both_topics() {
        let bus = Arc::new(Bus::new());
        let mut stream_rx = bus.register("orders", 8);
        let mut all_rx = bus.register(ALL_STREAMS, 8);
        let log = MemEventLog::new(bus);

        log.append("orders", vec![ProposedEvent::of_type("A")])
            .await
            .unwrap();

        assert_eq!(stream_rx.recv().await.unwrap().len(), 1);
        assert_eq!(all_rx.recv().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_to_the_all_key_is_refused() {
        let log = MemEventLog::new(Arc::new(Bus::new()));
        let err = log
            .append(ALL_STREAMS, vec![ProposedEvent::of_type("A")])
            .await
            .unwrap_err();
        assert!(matches!(err, MemAppendError::ReservedStreamKey(_)));
    }

    #[tokio::test]
    async fn reader_rejects_unknown_streams() {
        let log = MemEventLog::new(Arc::new(Bus::new()));
        let result = log.unseen_event_stream("ghost", 0, 10).await;
        let err = match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, ReadError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn reader_serves_the_all_key_without_a_backing_stream() {
        let log = MemEventLog::new(Arc::new(Bus::new()));
        let mut stream = log.unseen_event_stream(ALL_STREAMS, 0, 10).await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn reader_batches_strictly_after_the_cursor() {
        let log = MemEventLog::new(Arc::new(Bus::new()));
        let proposed: Vec<ProposedEvent> =
            (0..5).map(|_| ProposedEvent::of_type("A")).collect();
        log.append("orders", proposed).await.unwrap();

        let mut stream = log.unseen_event_stream("orders", 2, 2).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(
            first.iter().map(|e| e.stream_version).collect::<Vec<_>>(),
            vec![3, 4]
        );
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second[0].stream_version, 5);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_on_the_durable_row() {
        let store = MemCheckpointStore::new();
        let first = store.subscribe("orders", "reporting", 0, 0).await.unwrap();
        let second = store.subscribe("orders", "reporting", 7, 7).await.unwrap();
        // The second call returns the existing row; its cursors are untouched.
        assert_eq!(first.id, second.id);
        assert_eq!(second.last_seen_stream_version, 0);
    }

    #[tokio::test]
    async fn ack_updates_both_positions() {
        let store = MemCheckpointStore::new();
        store.subscribe("orders", "reporting", 0, 0).await.unwrap();
        store.ack("orders", "reporting", 12, 3).await.unwrap();
        let row = store.query("orders", "reporting").await.unwrap().unwrap();
        assert_eq!(row.last_seen_event_number, 12);
        assert_eq!(row.last_seen_stream_version, 3);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_row_and_tolerates_absence() {
        let store = MemCheckpointStore::new();
        store.subscribe("orders", "reporting", 0, 0).await.unwrap();
        store.unsubscribe("orders", "reporting").await.unwrap();
        assert!(store.query("orders", "reporting").await.unwrap().is_none());
        store.unsubscribe("orders", "reporting").await.unwrap();
    }
}
