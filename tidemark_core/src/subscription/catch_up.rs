//! Catch-up worker.
//!
//! A short-lived task spawned while the subscription enters `catching_up`. It
//! owns a finite snapshot from the [`HistoricalReader`] and a read-only copy
//! of the subscriber handle, sends one correlation chunk at a time and blocks
//! until the actor relays the matching acknowledgement. It talks back to the
//! actor only through the terminal `caught_up` (or failure) notification.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::config::Mapper;
use crate::event::{SubscriptionKind, chunk_by_correlation};
use crate::reader::{HistoricalReader, ReadError};

use super::{Command, Delivery, to_delivery};

/// Why a catch-up run stopped before exhausting its snapshot.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CatchUpError {
    /// The historical reader failed.
    #[error("historical read failed: {0}")]
    Read(#[from] ReadError),
    /// The subscriber hung up; the actor notices this on its own.
    #[error("subscriber channel closed")]
    SubscriberGone,
    /// The relayed ack does not belong to the chunk in flight.
    #[error("ack cursor {got} overshoots the chunk in flight (expected {expected})")]
    UnexpectedAck {
        /// The cursor that was relayed.
        got: u64,
        /// The cursor of the last event in the chunk in flight.
        expected: u64,
    },
    /// The owning actor went away mid catch-up.
    #[error("subscription actor went away")]
    ActorGone,
}

/// One catch-up run over a storage snapshot.
pub(crate) struct CatchUpWorker<R> {
    pub(crate) stream_key: String,
    pub(crate) subscription_name: String,
    pub(crate) kind: SubscriptionKind,
    /// Cursor the snapshot starts strictly after.
    pub(crate) from: u64,
    pub(crate) batch_size: u32,
    pub(crate) reader: Arc<R>,
    pub(crate) subscriber: mpsc::Sender<Delivery>,
    pub(crate) mapper: Option<Mapper>,
    /// Acknowledged cursors relayed by the actor.
    pub(crate) acks: mpsc::UnboundedReceiver<u64>,
    pub(crate) actor: mpsc::UnboundedSender<Command>,
}

impl<R: HistoricalReader> CatchUpWorker<R> {
    pub(crate) async fn run(mut self) {
        match self.stream_to_subscriber().await {
            Ok(last_seen) => {
                let _ = self.actor.send(Command::CaughtUp { last_seen });
            }
            Err(CatchUpError::ActorGone) => {}
            Err(CatchUpError::SubscriberGone) => {
                log::debug!(
                    "catch-up for {:?} on {:?} stopped: subscriber went away",
                    self.subscription_name,
                    self.stream_key
                );
            }
            Err(error) => {
                let _ = self.actor.send(Command::CatchUpFailed {
                    reason: error.to_string(),
                });
            }
        }
    }

    /// Streams the snapshot chunk by chunk, ack-gated, and returns the cursor
    /// of the final event emitted (or the starting cursor if there was none).
    async fn stream_to_subscriber(&mut self) -> Result<u64, CatchUpError> {
        let mut last_seen = self.from;
        let mut batches = match self
            .reader
            .unseen_event_stream(&self.stream_key, self.from, self.batch_size)
            .await
        {
            Ok(batches) => batches,
            Err(ReadError::StreamNotFound(stream_key)) => {
                // An uncreated stream catches up as an empty sequence.
                log::debug!(
                    "catch-up for {:?}: stream {:?} does not exist yet",
                    self.subscription_name,
                    stream_key
                );
                return Ok(last_seen);
            }
            Err(error) => return Err(error.into()),
        };

        while let Some(batch) = batches.next().await {
            let batch = batch?;
            for chunk in chunk_by_correlation(batch) {
                let Some(chunk_last) = chunk.last().map(|e| self.kind.cursor(e)) else {
                    continue;
                };
                let delivery = to_delivery(self.mapper.as_ref(), chunk);
                self.subscriber
                    .send(delivery)
                    .await
                    .map_err(|_| CatchUpError::SubscriberGone)?;
                self.await_ack(chunk_last).await?;
                last_seen = chunk_last;
            }
        }
        log::debug!(
            "catch-up for {:?} on {:?} exhausted its snapshot at cursor {}",
            self.subscription_name,
            self.stream_key,
            last_seen
        );
        Ok(last_seen)
    }

    /// Blocks until the chunk in flight is acknowledged.
    ///
    /// Acks with a strictly lesser cursor are stragglers from earlier chunks
    /// and are ignored; anything greater is a protocol violation.
    async fn await_ack(&mut self, expected: u64) -> Result<(), CatchUpError> {
        loop {
            match self.acks.recv().await {
                None => return Err(CatchUpError::ActorGone),
                Some(cursor) if cursor == expected => return Ok(()),
                Some(cursor) if cursor < expected => continue,
                Some(cursor) => {
                    return Err(CatchUpError::UnexpectedAck {
                        got: cursor,
                        expected,
                    });
                }
            }
        }
    }
}
