//! The per-subscription state machine.
//!
//! Six states reconcile historical catch-up with live push:
//!
//! ```text
//! initial → request_catch_up → catching_up → subscribed ⇄ max_capacity
//!     ↘ failed                      ↑______________|
//!            (any) → unsubscribed
//! ```
//!
//! The machine itself is pure: [`SubscriptionFsm::transition`] mutates only
//! in-memory state and returns the [`Effect`]s the owning actor must apply
//! (spawn a catch-up worker, deliver batches, persist or forward an ack,
//! delete the checkpoint). Acknowledgement-protocol violations surface as
//! [`ProtocolError`] and are fatal to the actor.

use std::collections::VecDeque;

use crate::checkpoint::Checkpoint;
use crate::event::{AckTarget, RecordedEvent, SubscriptionKind, chunk_by_correlation};

/// The states a subscription moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created but not yet attached to a checkpoint.
    Initial,
    /// Needs to reconcile with storage before going live.
    RequestCatchUp,
    /// A catch-up worker is streaming historical events to the subscriber.
    CatchingUp,
    /// Live: events pushed on the bus flow straight to the subscriber.
    Subscribed,
    /// Parked: the pending buffer hit its cap; waiting for acks to drain it.
    MaxCapacity,
    /// Terminal: the subscription was explicitly removed.
    Unsubscribed,
    /// Terminal: opening the checkpoint failed.
    Failed,
}

/// Inputs accepted by the state machine.
#[derive(Debug)]
pub enum SubscriptionEvent {
    /// The checkpoint row was created or loaded.
    Subscribe {
        /// The durable row delivery resumes from.
        checkpoint: Checkpoint,
    },
    /// Opening the checkpoint failed.
    SubscribeFailed,
    /// Start (or restart) catch-up from the current position.
    CatchUp,
    /// The catch-up worker exhausted its snapshot.
    CaughtUp {
        /// Cursor of the final event the worker emitted, or its starting
        /// cursor if the snapshot was empty.
        last_seen: u64,
    },
    /// A batch pushed on the broadcast bus.
    NotifyEvents {
        /// The published events, non-empty and in order.
        events: Vec<RecordedEvent>,
    },
    /// The subscriber acknowledged an event.
    Ack {
        /// The acknowledged position.
        target: AckTarget,
    },
    /// Tear the subscription down and forget its checkpoint.
    Unsubscribe,
}

/// Side effects the owning actor applies after a transition.
#[derive(Debug, PartialEq)]
pub enum Effect {
    /// Spawn a catch-up worker streaming events strictly after `from`.
    SpawnCatchUp {
        /// Cursor the worker starts from.
        from: u64,
    },
    /// Send batches to the subscriber, in order, one send per chunk.
    Deliver {
        /// Contiguous `(stream_key, correlation_id)` runs.
        chunks: Vec<Vec<RecordedEvent>>,
    },
    /// Advance the durable checkpoint; both positions are written atomically.
    PersistAck {
        /// Global position of the acknowledged event.
        event_number: u64,
        /// Per-stream position of the acknowledged event.
        stream_version: u64,
    },
    /// Relay an acknowledged cursor to the catch-up worker.
    ForwardAck {
        /// The acknowledged cursor.
        cursor: u64,
    },
    /// Remove the durable checkpoint row.
    DeleteCheckpoint,
}

/// Acknowledgement-protocol violations. Fatal to the subscription actor, so
/// its supervisor can restart it from the durable checkpoint.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The cursor moves behind what the subscriber already acknowledged.
    #[error("ack cursor {cursor} moves behind the last acknowledged cursor {last_ack}")]
    AckBackwards {
        /// The offending cursor.
        cursor: u64,
        /// The cursor acknowledged so far.
        last_ack: u64,
    },
    /// The cursor jumps past anything delivered to the subscription.
    #[error("ack cursor {cursor} is past the last seen cursor {last_seen}")]
    AckPastSeen {
        /// The offending cursor.
        cursor: u64,
        /// The highest cursor observed from any source.
        last_seen: u64,
    },
}

/// An event delivered to the subscriber but not yet acknowledged.
///
/// Kept so a bare-integer ack can be resolved back to the full
/// `(event_number, stream_version)` pair before it is persisted.
#[derive(Debug)]
struct DeliveredEvent {
    cursor: u64,
    event_number: u64,
    stream_version: u64,
}

/// State machine for one subscription.
#[derive(Debug)]
pub struct SubscriptionFsm {
    state: SubscriptionState,
    kind: SubscriptionKind,
    stream_key: String,
    subscription_name: String,
    max_size: usize,
    /// Cursor of the last event observed from any source.
    last_seen: u64,
    /// Cursor of the last event the subscriber acknowledged.
    last_ack: u64,
    /// Global position persisted with the last ack.
    last_ack_event_number: u64,
    /// Per-stream position persisted with the last ack.
    last_ack_stream_version: u64,
    /// Cursor of the last event seen on the broadcast bus.
    last_received: Option<u64>,
    /// Events awaiting subscriber readiness, oldest first.
    pending: VecDeque<RecordedEvent>,
    /// Delivered-but-unacked ledger, oldest first.
    delivered: VecDeque<DeliveredEvent>,
}

impl SubscriptionFsm {
    /// Creates a machine in the `initial` state.
    pub fn new(
        stream_key: impl Into<String>,
        subscription_name: impl Into<String>,
        max_size: usize,
    ) -> Self {
        let stream_key = stream_key.into();
        let kind = SubscriptionKind::of(&stream_key);
        Self {
            state: SubscriptionState::Initial,
            kind,
            stream_key,
            subscription_name: subscription_name.into(),
            max_size,
            last_seen: 0,
            last_ack: 0,
            last_ack_event_number: 0,
            last_ack_stream_version: 0,
            last_received: None,
            pending: VecDeque::new(),
            delivered: VecDeque::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// The subscription's kind, derived from its stream key.
    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// The stream key this subscription is attached to.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// The subscription's name.
    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    /// Cursor of the last event observed from any source.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Cursor of the last event the subscriber acknowledged.
    pub fn last_ack(&self) -> u64 {
        self.last_ack
    }

    /// Cursor of the last event seen on the broadcast bus, if any.
    pub fn last_received(&self) -> Option<u64> {
        self.last_received
    }

    /// Number of buffered events awaiting subscriber readiness.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a catch-up may start now.
    ///
    /// Buffered events must drain to the subscriber before a worker starts,
    /// or the worker's chunks would overtake them.
    pub fn ready_to_catch_up(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies an input, returning the effects the actor must run.
    pub fn transition(
        &mut self,
        event: SubscriptionEvent,
    ) -> Result<Vec<Effect>, ProtocolError> {
        use SubscriptionState as S;

        match (self.state, event) {
            (S::Initial, SubscriptionEvent::Subscribe { checkpoint }) => {
                self.last_ack_event_number = checkpoint.last_seen_event_number;
                self.last_ack_stream_version = checkpoint.last_seen_stream_version;
                let cursor = match self.kind {
                    SubscriptionKind::AllStreams => checkpoint.last_seen_event_number,
                    SubscriptionKind::SingleStream => checkpoint.last_seen_stream_version,
                };
                self.last_ack = cursor;
                self.last_seen = cursor;
                self.state = S::RequestCatchUp;
                Ok(Vec::new())
            }
            (S::Initial, SubscriptionEvent::SubscribeFailed) => {
                self.state = S::Failed;
                Ok(Vec::new())
            }

            (S::RequestCatchUp, SubscriptionEvent::CatchUp) => {
                if self.pending.is_empty() {
                    self.state = S::CatchingUp;
                    Ok(vec![Effect::SpawnCatchUp {
                        from: self.last_seen,
                    }])
                } else {
                    // Buffered events must reach the subscriber first; the
                    // drain triggered by their acks re-requests catch-up.
                    Ok(Vec::new())
                }
            }
            (S::CatchingUp, SubscriptionEvent::CatchUp) => Ok(Vec::new()),
            (S::Subscribed, SubscriptionEvent::CatchUp) => {
                self.state = S::RequestCatchUp;
                Ok(Vec::new())
            }
            (_, SubscriptionEvent::CatchUp) => Ok(Vec::new()),

            (S::CatchingUp, SubscriptionEvent::CaughtUp { last_seen }) => {
                self.last_seen = last_seen;
                match self.last_received {
                    None => self.state = S::Subscribed,
                    Some(received) if received == last_seen => self.state = S::Subscribed,
                    Some(_) => {
                        // The bus saw events the snapshot did not cover (or
                        // the hint trail is stale). Reconcile through the
                        // reader with a fresh bus view.
                        self.last_received = None;
                        self.state = S::RequestCatchUp;
                    }
                }
                Ok(Vec::new())
            }

            (_, SubscriptionEvent::NotifyEvents { events }) if events.is_empty() => {
                Ok(Vec::new())
            }
            (S::Subscribed, SubscriptionEvent::NotifyEvents { events }) => {
                Ok(self.live_notify(events))
            }
            (
                S::RequestCatchUp | S::CatchingUp | S::MaxCapacity | S::Unsubscribed | S::Failed,
                SubscriptionEvent::NotifyEvents { events },
            ) => {
                // Discard the events; the reader will refetch anything that
                // matters. Only the hint trail is kept.
                self.track_last_received(&events);
                Ok(Vec::new())
            }
            (S::Initial, SubscriptionEvent::NotifyEvents { .. }) => Ok(Vec::new()),

            (
                S::RequestCatchUp | S::CatchingUp | S::Subscribed | S::MaxCapacity,
                SubscriptionEvent::Ack { target },
            ) => self.handle_ack(target),
            (S::Initial | S::Unsubscribed | S::Failed, SubscriptionEvent::Ack { .. }) => {
                Ok(Vec::new())
            }

            (
                S::RequestCatchUp | S::CatchingUp | S::Subscribed | S::MaxCapacity,
                SubscriptionEvent::Unsubscribe,
            ) => {
                self.state = S::Unsubscribed;
                Ok(vec![Effect::DeleteCheckpoint])
            }
            (S::Initial | S::Unsubscribed | S::Failed, SubscriptionEvent::Unsubscribe) => {
                Ok(Vec::new())
            }

            // Stale worker notifications after the state moved on.
            (_, SubscriptionEvent::CaughtUp { .. }) => Ok(Vec::new()),
            // Subscribe results are only meaningful in `initial`.
            (_, SubscriptionEvent::Subscribe { .. } | SubscriptionEvent::SubscribeFailed) => {
                Ok(Vec::new())
            }
        }
    }

    /// Live delivery policy for the `subscribed` state.
    fn live_notify(&mut self, events: Vec<RecordedEvent>) -> Vec<Effect> {
        let first = self.kind.cursor(&events[0]);
        let last = self.kind.cursor(&events[events.len() - 1]);

        if self.last_ack == self.last_seen && first == self.last_ack + 1 {
            // Nothing in flight and the subscriber is fully acknowledged:
            // deliver eagerly, as published, without regrouping.
            self.record_delivered(&events);
            self.last_seen = last;
            self.last_received = Some(last);
            vec![Effect::Deliver {
                chunks: vec![events],
            }]
        } else if first == self.last_seen + 1 {
            // In order on the wire but the subscriber is still working
            // through earlier deliveries: buffer.
            self.last_seen = last;
            self.last_received = Some(last);
            self.pending.extend(events);
            if self.pending.len() >= self.max_size {
                self.state = SubscriptionState::MaxCapacity;
            }
            Vec::new()
        } else {
            // Gap relative to the expected cursor: drop the batch and let the
            // reader reconcile.
            self.last_received = Some(last);
            self.state = SubscriptionState::RequestCatchUp;
            Vec::new()
        }
    }

    fn handle_ack(&mut self, target: AckTarget) -> Result<Vec<Effect>, ProtocolError> {
        let cursor = target.cursor(self.kind);
        if cursor == self.last_ack {
            // Re-acknowledging the checkpoint is a no-op.
            return Ok(Vec::new());
        }
        if cursor < self.last_ack {
            return Err(ProtocolError::AckBackwards {
                cursor,
                last_ack: self.last_ack,
            });
        }
        if cursor > self.last_seen {
            if self.state == SubscriptionState::CatchingUp {
                // Catch-up chunks reach the subscriber without passing
                // through the actor; their acks are the actor's only sight
                // of that progress.
                self.last_seen = cursor;
            } else {
                return Err(ProtocolError::AckPastSeen {
                    cursor,
                    last_seen: self.last_seen,
                });
            }
        }

        let mut pair = match target {
            AckTarget::Pair {
                event_number,
                stream_version,
            } => Some((event_number, stream_version)),
            AckTarget::Cursor(_) => None,
        };
        while self.delivered.front().is_some_and(|e| e.cursor <= cursor) {
            if let Some(entry) = self.delivered.pop_front() {
                if entry.cursor == cursor && pair.is_none() {
                    pair = Some((entry.event_number, entry.stream_version));
                }
            }
        }
        // A bare ack with no ledger entry (catch-up deliveries bypass the
        // actor) carries the previous value of the irrelevant position
        // forward; the relevant cursor is what restarts resume from.
        let (event_number, stream_version) = pair.unwrap_or(match self.kind {
            SubscriptionKind::AllStreams => (cursor, self.last_ack_stream_version),
            SubscriptionKind::SingleStream => (self.last_ack_event_number, cursor),
        });

        self.last_ack = cursor;
        self.last_ack_event_number = event_number;
        self.last_ack_stream_version = stream_version;

        let mut effects = vec![Effect::PersistAck {
            event_number,
            stream_version,
        }];
        if self.state == SubscriptionState::CatchingUp {
            effects.push(Effect::ForwardAck { cursor });
        }
        if let Some(deliver) = self.drain_pending() {
            effects.push(deliver);
        }
        if self.state == SubscriptionState::MaxCapacity && self.pending.is_empty() {
            self.state = SubscriptionState::RequestCatchUp;
        }
        Ok(effects)
    }

    /// Emits all buffered events if the subscriber is ready for the first.
    fn drain_pending(&mut self) -> Option<Effect> {
        let front_cursor = self.pending.front().map(|e| self.kind.cursor(e))?;
        if front_cursor != self.last_ack + 1 {
            // Partially acknowledged; wait for the rest.
            return None;
        }
        let events: Vec<RecordedEvent> = self.pending.drain(..).collect();
        self.record_delivered(&events);
        Some(Effect::Deliver {
            chunks: chunk_by_correlation(events),
        })
    }

    fn record_delivered(&mut self, events: &[RecordedEvent]) {
        for event in events {
            self.delivered.push_back(DeliveredEvent {
                cursor: self.kind.cursor(event),
                event_number: event.event_number,
                stream_version: event.stream_version,
            });
        }
    }

    fn track_last_received(&mut self, events: &[RecordedEvent]) {
        if let Some(last) = events.last() {
            self.last_received = Some(self.kind.cursor(last));
        }
    }
}
