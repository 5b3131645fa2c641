//! In-process broadcast bus.
//!
//! The writer publishes each appended batch to the topic named after the
//! stream key and to the `$all` topic after the database commit. Listeners
//! receive batches through bounded mailboxes: publishing never blocks, and a
//! listener that falls behind loses messages. Losses are acceptable: the
//! subscription state machine treats the bus as a hint and reconciles any
//! missed events through the historical reader.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::event::{ALL_STREAMS, RecordedEvent};

/// A batch of events as published on the bus.
///
/// Batches are shared between listeners without deep-cloning the event data.
pub type PublishedBatch = Arc<Vec<RecordedEvent>>;

/// Topic registry fanning out appended events to registered listeners.
///
/// Delivery to each listener is FIFO per publisher. The topic table is
/// concurrent; closed mailboxes are pruned on the next publish to their topic.
#[derive(Debug, Default)]
pub struct Bus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<PublishedBatch>>>>,
}

impl Bus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener on a topic and returns its mailbox.
    ///
    /// `capacity` bounds the mailbox; once full, further publishes to this
    /// listener are dropped until it drains.
    pub fn register(&self, topic: &str, capacity: usize) -> mpsc::Receiver<PublishedBatch> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut topics = self.topics.lock().expect("bus topic table poisoned");
        topics.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Publishes a batch to every listener of a topic without blocking.
    ///
    /// Listeners whose mailboxes are full miss the batch; listeners whose
    /// mailboxes are closed are removed from the topic.
    pub fn publish(&self, topic: &str, events: &PublishedBatch) {
        if events.is_empty() {
            return;
        }
        let mut topics = self.topics.lock().expect("bus topic table poisoned");
        let Some(listeners) = topics.get_mut(topic) else {
            return;
        };
        listeners.retain(|tx| match tx.try_send(Arc::clone(events)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "bus listener on topic {:?} is full, dropping a batch of {} events",
                    topic,
                    events.len()
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if listeners.is_empty() {
            topics.remove(topic);
        }
    }

    /// Publishes an appended batch the way the writer must: once to the
    /// stream's own topic and once to [`ALL_STREAMS`].
    ///
    /// Events in the batch must be in `stream_version` order with contiguous
    /// `event_number`s, as produced by a single append.
    pub fn publish_appended(&self, stream_key: &str, events: Vec<RecordedEvent>) {
        let batch: PublishedBatch = Arc::new(events);
        self.publish(stream_key, &batch);
        if stream_key != ALL_STREAMS {
            self.publish(ALL_STREAMS, &batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(stream_key: &str, stream_version: u64, event_number: u64) -> RecordedEvent {
        RecordedEvent {
            event_id: Uuid::new_v4(),
            event_number,
            stream_key: stream_key.to_string(),
            stream_version,
            event_type: "TestEvent".to_string(),
            correlation_id: None,
            causation_id: None,
            payload: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_to_stream_and_all_topics() {
        let bus = Bus::new();
        let mut stream_rx = bus.register("orders", 8);
        let mut all_rx = bus.register(ALL_STREAMS, 8);

        bus.publish_appended("orders", vec![event("orders", 1, 1)]);

        let batch = stream_rx.recv().await.unwrap();
        assert_eq!(batch[0].stream_version, 1);
        let batch = all_rx.recv().await.unwrap();
        assert_eq!(batch[0].event_number, 1);
    }

    #[tokio::test]
    async fn publish_preserves_fifo_order() {
        let bus = Bus::new();
        let mut rx = bus.register("orders", 8);

        bus.publish_appended("orders", vec![event("orders", 1, 1)]);
        bus.publish_appended("orders", vec![event("orders", 2, 2)]);

        assert_eq!(rx.recv().await.unwrap()[0].stream_version, 1);
        assert_eq!(rx.recv().await.unwrap()[0].stream_version, 2);
    }

    #[tokio::test]
    async fn full_mailbox_loses_batches_without_blocking() {
        let bus = Bus::new();
        let mut rx = bus.register("orders", 1);

        bus.publish_appended("orders", vec![event("orders", 1, 1)]);
        bus.publish_appended("orders", vec![event("orders", 2, 2)]);

        // The second batch was dropped; only the first is delivered.
        assert_eq!(rx.recv().await.unwrap()[0].stream_version, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_listeners_are_pruned() {
        let bus = Bus::new();
        let rx = bus.register("orders", 8);
        drop(rx);

        bus.publish_appended("orders", vec![event("orders", 1, 1)]);
        assert!(!bus.topics.lock().unwrap().contains_key("orders"));
    }

    #[tokio::test]
    async fn empty_batches_are_not_published() {
        let bus = Bus::new();
        let mut rx = bus.register("orders", 8);
        bus.publish_appended("orders", Vec::new());
        assert!(rx.try_recv().is_err());
    }
}
