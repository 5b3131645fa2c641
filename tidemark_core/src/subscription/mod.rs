//! The subscription actor.
//!
//! One actor owns one [`SubscriptionFsm`] and serializes every input against
//! it: commands from the public handle, pushes from the broadcast bus and the
//! catch-up worker's terminal notification. The actor applies the effects the
//! machine returns (spawning workers, delivering batches, persisting acks,
//! deleting the checkpoint) and enforces the linked lifetimes: a dead
//! subscriber tears the actor down, a dead actor closes the subscriber's
//! channel and aborts its worker.

pub(crate) mod catch_up;
pub mod fsm;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::bus::PublishedBatch;
use crate::checkpoint::CheckpointStore;
use crate::config::{Mapper, SubscriptionOptions};
use crate::event::{AckTarget, RecordedEvent};
use crate::reader::HistoricalReader;
use crate::subscriptions::SubscribeError;

use catch_up::CatchUpWorker;
use fsm::{Effect, ProtocolError, SubscriptionEvent, SubscriptionFsm, SubscriptionState};

/// What a subscriber receives on its channel.
///
/// Batches are either the recorded events themselves or, when a mapper was
/// supplied, the mapped values in the same order. The subscriber must respond
/// by acknowledging a cursor no later than the last event of the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A batch of recorded events, in order.
    Events(Vec<RecordedEvent>),
    /// A batch of mapper outputs, in event order.
    Mapped(Vec<serde_json::Value>),
}

impl Delivery {
    /// Number of events (or mapped values) in the batch.
    pub fn len(&self) -> usize {
        match self {
            Delivery::Events(events) => events.len(),
            Delivery::Mapped(values) => values.len(),
        }
    }

    /// Whether the batch is empty. Deliveries are never sent empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies the optional mapper to a chunk about to be delivered.
pub(crate) fn to_delivery(mapper: Option<&Mapper>, events: Vec<RecordedEvent>) -> Delivery {
    match mapper {
        Some(mapper) => Delivery::Mapped(events.iter().map(|e| mapper(e)).collect()),
        None => Delivery::Events(events),
    }
}

/// Messages accepted by the actor's mailbox.
#[derive(Debug)]
pub(crate) enum Command {
    /// Self-posted whenever the machine lands in `request_catch_up`.
    CatchUp,
    /// Terminal notification from the catch-up worker.
    CaughtUp {
        /// Cursor of the final event the worker emitted.
        last_seen: u64,
    },
    /// The catch-up worker hit a protocol violation or a read failure.
    CatchUpFailed {
        /// Human-readable failure description.
        reason: String,
    },
    /// Acknowledgement relayed from the subscriber.
    Ack {
        /// The acknowledged position.
        target: AckTarget,
    },
    /// Synchronous unsubscribe; replies once the checkpoint is gone.
    Unsubscribe {
        /// Acknowledged when teardown completed.
        reply: oneshot::Sender<()>,
    },
    /// Synchronous state probe.
    IsSubscribed {
        /// Receives `true` iff the machine is in `subscribed`.
        reply: oneshot::Sender<bool>,
    },
}

/// Why an actor stopped abnormally.
///
/// Faults are terminal: the actor logs them and exits, leaving the durable
/// checkpoint behind so a restarted subscription resumes where the last
/// acknowledgement left it.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SubscriptionFault {
    /// The subscriber violated the acknowledgement protocol.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    /// The catch-up worker failed.
    #[error("catch-up failed: {0}")]
    CatchUp(String),
    /// The checkpoint store failed mid-flight.
    #[error("checkpoint storage failure: {0}")]
    Storage(String),
    /// The subscriber's channel closed.
    #[error("subscriber channel closed")]
    SubscriberGone,
}

struct WorkerHandle {
    acks: mpsc::UnboundedSender<u64>,
    join: tokio::task::JoinHandle<()>,
}

/// Owner of one subscription's state machine and its links.
pub(crate) struct SubscriptionActor<C, R> {
    fsm: SubscriptionFsm,
    options: SubscriptionOptions,
    checkpoints: Arc<C>,
    reader: Arc<R>,
    subscriber: mpsc::Sender<Delivery>,
    commands: mpsc::UnboundedReceiver<Command>,
    self_tx: mpsc::UnboundedSender<Command>,
    bus_rx: mpsc::Receiver<PublishedBatch>,
    bus_closed: bool,
    init: Option<oneshot::Sender<Result<(), SubscribeError>>>,
    worker: Option<WorkerHandle>,
}

impl<C, R> SubscriptionActor<C, R>
where
    C: CheckpointStore,
    R: HistoricalReader,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream_key: &str,
        subscription_name: &str,
        options: SubscriptionOptions,
        checkpoints: Arc<C>,
        reader: Arc<R>,
        subscriber: mpsc::Sender<Delivery>,
        commands: mpsc::UnboundedReceiver<Command>,
        self_tx: mpsc::UnboundedSender<Command>,
        bus_rx: mpsc::Receiver<PublishedBatch>,
        init: oneshot::Sender<Result<(), SubscribeError>>,
    ) -> Self {
        let fsm = SubscriptionFsm::new(stream_key, subscription_name, options.max_size);
        Self {
            fsm,
            options,
            checkpoints,
            reader,
            subscriber,
            commands,
            self_tx,
            bus_rx,
            bus_closed: false,
            init: Some(init),
            worker: None,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.serve().await {
            Ok(()) => log::debug!(
                "subscription {:?} on {:?} stopped",
                self.fsm.subscription_name(),
                self.fsm.stream_key()
            ),
            Err(fault) => log::error!(
                "subscription {:?} on {:?} terminated: {}",
                self.fsm.subscription_name(),
                self.fsm.stream_key(),
                fault
            ),
        }
        if let Some(worker) = self.worker.take() {
            worker.join.abort();
        }
    }

    async fn serve(&mut self) -> Result<(), SubscriptionFault> {
        self.open_checkpoint().await?;
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    let Some(command) = command else { return Ok(()) };
                    if self.handle_command(command).await? {
                        return Ok(());
                    }
                }
                batch = self.bus_rx.recv(), if !self.bus_closed => {
                    match batch {
                        Some(batch) => {
                            self.apply(SubscriptionEvent::NotifyEvents {
                                events: batch.as_ref().clone(),
                            })
                            .await?;
                        }
                        // Losing the bus only loses hints; catch-up still works.
                        None => self.bus_closed = true,
                    }
                }
                _ = self.subscriber.closed() => {
                    return Err(SubscriptionFault::SubscriberGone);
                }
            }
        }
    }

    /// Creates or loads the checkpoint row and reports the outcome to the
    /// caller blocked in `subscribe_to_stream`.
    async fn open_checkpoint(&mut self) -> Result<(), SubscriptionFault> {
        let result = self
            .checkpoints
            .subscribe(
                self.fsm.stream_key(),
                self.fsm.subscription_name(),
                self.options.start_from_event_number,
                self.options.start_from_stream_version,
            )
            .await;
        match result {
            Ok(checkpoint) => {
                self.apply(SubscriptionEvent::Subscribe { checkpoint }).await?;
                if let Some(init) = self.init.take() {
                    let _ = init.send(Ok(()));
                }
                Ok(())
            }
            Err(error) => {
                let _ = self.fsm.transition(SubscriptionEvent::SubscribeFailed);
                let message = error.to_string();
                if let Some(init) = self.init.take() {
                    let _ = init.send(Err(SubscribeError::Storage(Box::new(error))));
                }
                Err(SubscriptionFault::Storage(message))
            }
        }
    }

    /// Returns `true` when the actor should stop cleanly.
    async fn handle_command(&mut self, command: Command) -> Result<bool, SubscriptionFault> {
        match command {
            Command::CatchUp => {
                self.apply(SubscriptionEvent::CatchUp).await?;
                Ok(false)
            }
            Command::CaughtUp { last_seen } => {
                self.worker = None;
                self.apply(SubscriptionEvent::CaughtUp { last_seen }).await?;
                Ok(false)
            }
            Command::CatchUpFailed { reason } => Err(SubscriptionFault::CatchUp(reason)),
            Command::Ack { target } => {
                self.apply(SubscriptionEvent::Ack { target }).await?;
                Ok(false)
            }
            Command::Unsubscribe { reply } => {
                self.apply(SubscriptionEvent::Unsubscribe).await?;
                let _ = reply.send(());
                Ok(true)
            }
            Command::IsSubscribed { reply } => {
                let _ = reply.send(self.fsm.state() == SubscriptionState::Subscribed);
                Ok(false)
            }
        }
    }

    /// Runs one transition and applies its effects, then re-examines the
    /// state the machine landed in.
    async fn apply(&mut self, event: SubscriptionEvent) -> Result<(), SubscriptionFault> {
        let was_catch_up = matches!(event, SubscriptionEvent::CatchUp);
        let before = self.fsm.state();
        let effects = self.fsm.transition(event)?;
        for effect in effects {
            self.run_effect(effect).await?;
        }
        let after = self.fsm.state();
        if after == SubscriptionState::MaxCapacity && before != SubscriptionState::MaxCapacity {
            log::warn!(
                "subscription {:?} on {:?} parked at max capacity ({} events pending)",
                self.fsm.subscription_name(),
                self.fsm.stream_key(),
                self.fsm.pending_len()
            );
        }
        if after == SubscriptionState::RequestCatchUp
            && self.fsm.ready_to_catch_up()
            && !was_catch_up
        {
            let _ = self.self_tx.send(Command::CatchUp);
        }
        Ok(())
    }

    async fn run_effect(&mut self, effect: Effect) -> Result<(), SubscriptionFault> {
        match effect {
            Effect::SpawnCatchUp { from } => {
                self.spawn_catch_up(from);
                Ok(())
            }
            Effect::Deliver { chunks } => {
                for chunk in chunks {
                    let delivery = to_delivery(self.options.mapper.as_ref(), chunk);
                    self.subscriber
                        .send(delivery)
                        .await
                        .map_err(|_| SubscriptionFault::SubscriberGone)?;
                }
                Ok(())
            }
            Effect::PersistAck {
                event_number,
                stream_version,
            } => self
                .checkpoints
                .ack(
                    self.fsm.stream_key(),
                    self.fsm.subscription_name(),
                    event_number,
                    stream_version,
                )
                .await
                .map_err(|e| SubscriptionFault::Storage(e.to_string())),
            Effect::ForwardAck { cursor } => {
                if let Some(worker) = &self.worker {
                    let _ = worker.acks.send(cursor);
                }
                Ok(())
            }
            Effect::DeleteCheckpoint => {
                if let Err(error) = self
                    .checkpoints
                    .unsubscribe(self.fsm.stream_key(), self.fsm.subscription_name())
                    .await
                {
                    log::error!(
                        "failed to delete checkpoint for {:?} on {:?}: {}",
                        self.fsm.subscription_name(),
                        self.fsm.stream_key(),
                        error
                    );
                }
                Ok(())
            }
        }
    }

    fn spawn_catch_up(&mut self, from: u64) {
        if let Some(stale) = self.worker.take() {
            stale.join.abort();
        }
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let worker = CatchUpWorker {
            stream_key: self.fsm.stream_key().to_string(),
            subscription_name: self.fsm.subscription_name().to_string(),
            kind: self.fsm.kind(),
            from,
            batch_size: self.options.catch_up_batch_size,
            reader: Arc::clone(&self.reader),
            subscriber: self.subscriber.clone(),
            mapper: self.options.mapper.clone(),
            acks: ack_rx,
            actor: self.self_tx.clone(),
        };
        log::debug!(
            "subscription {:?} on {:?} catching up from cursor {}",
            self.fsm.subscription_name(),
            self.fsm.stream_key(),
            from
        );
        let join = tokio::spawn(worker.run());
        self.worker = Some(WorkerHandle { acks: ack_tx, join });
    }
}
