//! Event records and cursor handling.
//!
//! A [`RecordedEvent`] is the immutable unit produced by the writer once an
//! append has committed. Within a stream the `stream_version` is dense and
//! starts at 1; across the whole store the `event_number` is strictly
//! increasing with append order. Which of the two a subscription uses as its
//! acknowledgement cursor depends on its [`SubscriptionKind`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved stream key addressing every stream in the store.
///
/// Subscribing with this key yields an *all-streams* subscription whose ack
/// cursor is the global `event_number`.
pub const ALL_STREAMS: &str = "$all";

/// An immutable event as recorded by the writer.
///
/// Records are never mutated or deleted once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique identifier of the event.
    pub event_id: Uuid,
    /// Global position, assigned at append time, strictly increasing.
    pub event_number: u64,
    /// Opaque key of the logical stream the event belongs to.
    pub stream_key: String,
    /// Per-stream position, dense and starting at 1.
    pub stream_version: u64,
    /// The type of this event in PascalCase, like `OrderPlaced`.
    pub event_type: String,
    /// Correlation chain identifier, shared by related events.
    pub correlation_id: Option<Uuid>,
    /// Identifier of the event that caused this one.
    pub causation_id: Option<Uuid>,
    /// Event payload.
    pub payload: Option<serde_json::Value>,
    /// Free-form event metadata.
    pub metadata: Option<serde_json::Value>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// An event proposed for append, before the writer has assigned positions.
///
/// The writer turns this into a [`RecordedEvent`] by assigning
/// `event_number`, `stream_version` and `created_at`.
#[derive(Debug, Clone)]
pub struct ProposedEvent {
    /// Unique identifier of the event.
    pub event_id: Uuid,
    /// The type of this event in PascalCase.
    pub event_type: String,
    /// Correlation chain identifier.
    pub correlation_id: Option<Uuid>,
    /// Identifier of the event that caused this one.
    pub causation_id: Option<Uuid>,
    /// Event payload.
    pub payload: Option<serde_json::Value>,
    /// Free-form event metadata.
    pub metadata: Option<serde_json::Value>,
}

impl ProposedEvent {
    /// Creates a proposed event of the given type with a fresh id and no
    /// payload, metadata or causation data.
    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            correlation_id: None,
            causation_id: None,
            payload: None,
            metadata: None,
        }
    }
}

/// The two flavours of subscription, determined by the stream key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Subscription over every stream; the cursor is `event_number`.
    AllStreams,
    /// Subscription over one stream; the cursor is `stream_version`.
    SingleStream,
}

impl SubscriptionKind {
    /// Determines the subscription kind for a stream key.
    pub fn of(stream_key: &str) -> Self {
        if stream_key == ALL_STREAMS {
            SubscriptionKind::AllStreams
        } else {
            SubscriptionKind::SingleStream
        }
    }

    /// Extracts the relevant ack cursor from an event.
    pub fn cursor(&self, event: &RecordedEvent) -> u64 {
        match self {
            SubscriptionKind::AllStreams => event.event_number,
            SubscriptionKind::SingleStream => event.stream_version,
        }
    }
}

/// An acknowledgement as supplied by a subscriber.
///
/// A bare integer is interpreted as the cursor relevant to the subscription
/// kind. The pair form carries both positions; the state machine extracts the
/// relevant component and persists both atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTarget {
    /// A bare cursor in the subscription's own coordinate.
    Cursor(u64),
    /// Both positions of the acknowledged event.
    Pair {
        /// Global position of the acknowledged event.
        event_number: u64,
        /// Per-stream position of the acknowledged event.
        stream_version: u64,
    },
}

impl AckTarget {
    /// The cursor relevant to the given subscription kind.
    pub fn cursor(&self, kind: SubscriptionKind) -> u64 {
        match (self, kind) {
            (AckTarget::Cursor(c), _) => *c,
            (AckTarget::Pair { event_number, .. }, SubscriptionKind::AllStreams) => *event_number,
            (AckTarget::Pair { stream_version, .. }, SubscriptionKind::SingleStream) => {
                *stream_version
            }
        }
    }
}

impl From<u64> for AckTarget {
    fn from(cursor: u64) -> Self {
        AckTarget::Cursor(cursor)
    }
}

impl From<&RecordedEvent> for AckTarget {
    fn from(event: &RecordedEvent) -> Self {
        AckTarget::Pair {
            event_number: event.event_number,
            stream_version: event.stream_version,
        }
    }
}

/// Splits events into contiguous runs sharing the same
/// `(stream_key, correlation_id)` pair.
///
/// The writer groups correlated events into one append; delivering each run
/// as one batch preserves that grouping without ever reordering events.
pub fn chunk_by_correlation(events: Vec<RecordedEvent>) -> Vec<Vec<RecordedEvent>> {
    let mut chunks: Vec<Vec<RecordedEvent>> = Vec::new();
    for event in events {
        let starts_new_run = chunks.last().and_then(|chunk| chunk.last()).is_none_or(|prev| {
            prev.stream_key != event.stream_key || prev.correlation_id != event.correlation_id
        });
        if starts_new_run {
            chunks.push(vec![event]);
        } else if let Some(chunk) = chunks.last_mut() {
            chunk.push(event);
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn kind_of_all_streams_key() {
        assert_eq!(SubscriptionKind::of(ALL_STREAMS), SubscriptionKind::AllStreams);
        assert_eq!(SubscriptionKind::of("orders"), SubscriptionKind::SingleStream);
    }

    #[test]
    fn cursor_extraction_follows_kind() {
        let e = event("orders", 3, 42);
        assert_eq!(SubscriptionKind::AllStreams.cursor(&e), 42);
        assert_eq!(SubscriptionKind::SingleStream.cursor(&e), 3);
    }

    #[test]
    fn ack_target_pair_extracts_relevant_component() {
        let target = AckTarget::Pair {
            event_number: 42,
            stream_version: 3,
        };
        assert_eq!(target.cursor(SubscriptionKind::AllStreams), 42);
        assert_eq!(target.cursor(SubscriptionKind::SingleStream), 3);
        assert_eq!(AckTarget::Cursor(7).cursor(SubscriptionKind::AllStreams), 7);
    }

    #[test]
    fn ack_target_from_event_carries_both_positions() {
        let e = event("orders", 3, 42);
        let target = AckTarget::from(&e);
        assert_eq!(
            target,
            AckTarget::Pair {
                event_number: 42,
                stream_version: 3
            }
        );
    }

    #[test]
    fn chunking_splits_on_correlation_change() {
        let corr_a = Uuid::new_v4();
        let corr_b = Uuid::new_v4();
        let mut e1 = event("orders", 1, 1);
        let mut e2 = event("orders", 2, 2);
        let mut e3 = event("orders", 3, 3);
        e1.correlation_id = Some(corr_a);
        e2.correlation_id = Some(corr_a);
        e3.correlation_id = Some(corr_b);

        let chunks = chunk_by_correlation(vec![e1, e2, e3]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].len(), 1);
    }

    #[test]
    fn chunking_splits_on_stream_change() {
        let e1 = event("orders", 1, 1);
        let e2 = event("billing", 1, 2);
        let e3 = event("billing", 2, 3);

        let chunks = chunk_by_correlation(vec![e1, e2, e3]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0][0].stream_key, "orders");
        assert_eq!(chunks[1].len(), 2);
    }

    #[test]
    fn chunking_never_reorders() {
        let events: Vec<RecordedEvent> = (1..=5).map(|i| event("orders", i, i + 10)).collect();
        let chunks = chunk_by_correlation(events);
        assert_eq!(chunks.len(), 1);
        let versions: Vec<u64> = chunks[0].iter().map(|e| e.stream_version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn chunking_empty_input() {
        assert!(chunk_by_correlation(Vec::new()).is_empty());
    }
}
