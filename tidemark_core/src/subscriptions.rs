//! Subscription registry and public API.
//!
//! [`Subscriptions`] owns the broadcast bus, the checkpoint store, the
//! historical reader and the map of live subscription actors. Each
//! `(stream_key, subscription_name)` pair may have at most one live
//! subscriber at a time; the durable row underneath is idempotent, so a name
//! becomes available again as soon as its actor stops.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};

use crate::bus::Bus;
use crate::checkpoint::CheckpointStore;
use crate::config::SubscriptionOptions;
use crate::event::{ALL_STREAMS, AckTarget, RecordedEvent};
use crate::reader::HistoricalReader;
use crate::subscription::{Command, Delivery, SubscriptionActor};

/// Mailbox depth for bus pushes per subscription. Overflow drops batches,
/// which the state machine recovers from by catching up.
const BUS_MAILBOX_CAPACITY: usize = 1024;

/// Errors returned by [`Subscriptions::subscribe_to_stream`].
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The pair already has a live subscriber attached.
    #[error("subscription {subscription_name:?} on stream {stream_key:?} already has a live subscriber")]
    AlreadySubscribed {
        /// The stream key of the refused subscription.
        stream_key: String,
        /// The name of the refused subscription.
        subscription_name: String,
    },
    /// The checkpoint store failed while creating or loading the row.
    #[error("checkpoint storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The subscription actor died before reporting its startup outcome.
    #[error("subscription actor exited during startup")]
    Startup,
}

/// The subscription's actor is no longer running.
#[derive(Debug, thiserror::Error)]
#[error("subscription is no longer running")]
pub struct SubscriptionGone;

/// Handle to a live subscription.
///
/// Cloning is cheap; all clones address the same actor.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    stream_key: String,
    subscription_name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl SubscriptionHandle {
    /// The stream key this subscription is attached to.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// The subscription's name.
    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    /// Acknowledges a cursor or an event. Fire-and-forget.
    pub fn ack(&self, target: impl Into<AckTarget>) -> Result<(), SubscriptionGone> {
        self.commands
            .send(Command::Ack {
                target: target.into(),
            })
            .map_err(|_| SubscriptionGone)
    }

    /// Acknowledges a batch by its last event. An empty batch is a no-op.
    pub fn ack_events(&self, events: &[RecordedEvent]) -> Result<(), SubscriptionGone> {
        match events.last() {
            Some(last) => self.ack(last),
            None => Ok(()),
        }
    }

    /// Whether the subscription is currently live (state `subscribed`).
    ///
    /// Returns `false` while catching up and once the actor has stopped.
    pub async fn is_subscribed(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::IsSubscribed { reply: tx })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Tears the subscription down and deletes its checkpoint.
    ///
    /// Returns once the actor has processed the removal.
    pub async fn unsubscribe(&self) -> Result<(), SubscriptionGone> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Unsubscribe { reply: tx })
            .map_err(|_| SubscriptionGone)?;
        rx.await.map_err(|_| SubscriptionGone)
    }
}

/// The subscription façade: one instance per store.
pub struct Subscriptions<C, R> {
    bus: Arc<Bus>,
    checkpoints: Arc<C>,
    reader: Arc<R>,
    active: Mutex<HashMap<(String, String), mpsc::UnboundedSender<Command>>>,
}

impl<C, R> Subscriptions<C, R>
where
    C: CheckpointStore,
    R: HistoricalReader,
{
    /// Creates the façade over a checkpoint store, a reader and a bus.
    ///
    /// The writer must publish every committed append on the same bus.
    pub fn new(checkpoints: Arc<C>, reader: Arc<R>, bus: Arc<Bus>) -> Self {
        Self {
            bus,
            checkpoints,
            reader,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The broadcast bus this façade listens on.
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Opens (or resumes) a subscription on one stream.
    ///
    /// Creates the checkpoint row if needed, registers with the broadcast bus
    /// and spawns the subscription actor, which immediately starts catching
    /// up. Events are delivered to `subscriber` as [`Delivery`] batches.
    pub async fn subscribe_to_stream(
        &self,
        stream_key: &str,
        subscription_name: &str,
        subscriber: mpsc::Sender<Delivery>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        let key = (stream_key.to_string(), subscription_name.to_string());
        let mut active = self.active.lock().await;
        if let Some(commands) = active.get(&key) {
            if !commands.is_closed() {
                return Err(SubscribeError::AlreadySubscribed {
                    stream_key: stream_key.to_string(),
                    subscription_name: subscription_name.to_string(),
                });
            }
            // The previous actor died; its name is free again.
            active.remove(&key);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel();
        let bus_rx = self.bus.register(stream_key, BUS_MAILBOX_CAPACITY);
        let actor = SubscriptionActor::new(
            stream_key,
            subscription_name,
            options,
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.reader),
            subscriber,
            command_rx,
            command_tx.clone(),
            bus_rx,
            init_tx,
        );
        tokio::spawn(actor.run());

        match init_rx.await {
            Ok(Ok(())) => {
                active.insert(key, command_tx.clone());
                Ok(SubscriptionHandle {
                    stream_key: stream_key.to_string(),
                    subscription_name: subscription_name.to_string(),
                    commands: command_tx,
                })
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(SubscribeError::Startup),
        }
    }

    /// Opens (or resumes) a subscription over every stream in the store.
    ///
    /// Equivalent to subscribing to [`ALL_STREAMS`]; the ack cursor is the
    /// global `event_number`.
    pub async fn subscribe_to_all_streams(
        &self,
        subscription_name: &str,
        subscriber: mpsc::Sender<Delivery>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        self.subscribe_to_stream(ALL_STREAMS, subscription_name, subscriber, options)
            .await
    }

    /// Removes a subscription and its durable checkpoint.
    ///
    /// Stops the live actor when one exists; otherwise deletes the row
    /// directly. An unknown subscription is not an error.
    pub async fn unsubscribe_from_stream(
        &self,
        stream_key: &str,
        subscription_name: &str,
    ) -> Result<(), SubscribeError> {
        let key = (stream_key.to_string(), subscription_name.to_string());
        let commands = { self.active.lock().await.remove(&key) };
        if let Some(commands) = commands {
            if !commands.is_closed() {
                let (tx, rx) = oneshot::channel();
                if commands.send(Command::Unsubscribe { reply: tx }).is_ok() {
                    let _ = rx.await;
                    return Ok(());
                }
            }
        }
        self.checkpoints
            .unsubscribe(stream_key, subscription_name)
            .await
            .map_err(|e| SubscribeError::Storage(Box::new(e)))
    }

    /// Removes an all-streams subscription and its durable checkpoint.
    pub async fn unsubscribe_from_all_streams(
        &self,
        subscription_name: &str,
    ) -> Result<(), SubscribeError> {
        self.unsubscribe_from_stream(ALL_STREAMS, subscription_name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::reader::{EventBatchStream, ReadError};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, thiserror::Error)]
    enum StubError {}

    /// Checkpoint store over a plain map, mirroring the SQL semantics.
    #[derive(Default)]
    struct StubCheckpoints {
        rows: Mutex<HashMap<(String, String), Checkpoint>>,
    }

    #[async_trait]
    impl CheckpointStore for StubCheckpoints {
        type Error = StubError;

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
                .or_insert_with(|| Checkpoint {
                    id: Uuid::new_v4(),
                    stream_key: stream_key.to_string(),
                    subscription_name: subscription_name.to_string(),
                    last_seen_event_number: start_from_event_number,
                    last_seen_stream_version: start_from_stream_version,
                    created_at: Utc::now(),
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

    /// Reader over a store with no history.
    struct EmptyReader;

    #[async_trait]
    impl HistoricalReader for EmptyReader {
        async fn unseen_event_stream(
            &self,
            _stream_key: &str,
            _last_seen: u64,
            _batch_size: u32,
        ) -> Result<EventBatchStream, ReadError> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
    }

    fn fixture() -> (Arc<StubCheckpoints>, Subscriptions<StubCheckpoints, EmptyReader>) {
        let checkpoints = Arc::new(StubCheckpoints::default());
        let subscriptions = Subscriptions::new(
            Arc::clone(&checkpoints),
            Arc::new(EmptyReader),
            Arc::new(Bus::new()),
        );
        (checkpoints, subscriptions)
    }

    fn event(stream_version: u64, event_number: u64) -> RecordedEvent {
        RecordedEvent {
            event_id: Uuid::new_v4(),
            event_number,
            stream_key: "orders".to_string(),
            stream_version,
            event_type: "TestEvent".to_string(),
            correlation_id: None,
            causation_id: None,
            payload: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    async fn wait_until_subscribed(handle: &SubscriptionHandle) {
        for _ in 0..200 {
            if handle.is_subscribed().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscription never went live");
    }

    #[tokio::test]
    async fn subscription_goes_live_over_an_empty_store() {
        let (_, subscriptions) = fixture();
        let (tx, _rx) = mpsc::channel(16);
        let handle = subscriptions
            .subscribe_to_stream("orders", "reporting", tx, SubscriptionOptions::default())
            .await
            .unwrap();
        wait_until_subscribed(&handle).await;
    }

    #[tokio::test]
    async fn duplicate_live_subscription_is_refused() {
        let (_, subscriptions) = fixture();
        let (tx, _rx) = mpsc::channel(16);
        let _handle = subscriptions
            .subscribe_to_stream("orders", "reporting", tx, SubscriptionOptions::default())
            .await
            .unwrap();

        let (tx2, _rx2) = mpsc::channel(16);
        let err = subscriptions
            .subscribe_to_stream("orders", "reporting", tx2, SubscriptionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::AlreadySubscribed { .. }));
    }

    #[tokio::test]
    async fn live_events_are_delivered_and_acks_persist() {
        let (checkpoints, subscriptions) = fixture();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = subscriptions
            .subscribe_to_stream("orders", "reporting", tx, SubscriptionOptions::default())
            .await
            .unwrap();
        wait_until_subscribed(&handle).await;

        subscriptions
            .bus()
            .publish_appended("orders", vec![event(1, 11), event(2, 12)]);

        let delivery = rx.recv().await.unwrap();
        let events = match delivery {
            Delivery::Events(events) => events,
            other => panic!("expected events, got {:?}", other),
        };
        assert_eq!(events.len(), 2);
        handle.ack_events(&events).unwrap();

        // The durable row catches up with the ack.
        for _ in 0..200 {
            let row = checkpoints.query("orders", "reporting").await.unwrap();
            if row.as_ref().is_some_and(|r| r.last_seen_stream_version == 2) {
                assert_eq!(row.unwrap().last_seen_event_number, 12);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("ack never reached the checkpoint store");
    }

    #[tokio::test]
    async fn wrong_ack_terminates_the_actor_and_frees_the_name() {
        let (checkpoints, subscriptions) = fixture();
        let (tx, _rx) = mpsc::channel(16);
        let handle = subscriptions
            .subscribe_to_stream("orders", "reporting", tx, SubscriptionOptions::default())
            .await
            .unwrap();
        wait_until_subscribed(&handle).await;

        // Nothing was delivered; acking past last_seen is a protocol error.
        handle.ack(99u64).unwrap();
        for _ in 0..200 {
            if !handle.is_subscribed().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!handle.is_subscribed().await);

        // The checkpoint survives the crash and the name can be retaken.
        assert!(checkpoints.query("orders", "reporting").await.unwrap().is_some());
        let (tx2, _rx2) = mpsc::channel(16);
        let handle2 = subscriptions
            .subscribe_to_stream("orders", "reporting", tx2, SubscriptionOptions::default())
            .await
            .unwrap();
        wait_until_subscribed(&handle2).await;
    }

    #[tokio::test]
    async fn unsubscribe_deletes_the_checkpoint_and_frees_the_name() {
        let (checkpoints, subscriptions) = fixture();
        let (tx, _rx) = mpsc::channel(16);
        let handle = subscriptions
            .subscribe_to_stream("orders", "reporting", tx, SubscriptionOptions::default())
            .await
            .unwrap();
        wait_until_subscribed(&handle).await;

        subscriptions
            .unsubscribe_from_stream("orders", "reporting")
            .await
            .unwrap();
        assert!(checkpoints.query("orders", "reporting").await.unwrap().is_none());

        let (tx2, _rx2) = mpsc::channel(16);
        subscriptions
            .subscribe_to_stream("orders", "reporting", tx2, SubscriptionOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_without_a_live_actor_deletes_the_row() {
        let (checkpoints, subscriptions) = fixture();
        checkpoints.subscribe("orders", "reporting", 0, 0).await.unwrap();

        subscriptions
            .unsubscribe_from_stream("orders", "reporting")
            .await
            .unwrap();
        assert!(checkpoints.query("orders", "reporting").await.unwrap().is_none());

        // Absent rows are not an error either.
        subscriptions
            .unsubscribe_from_stream("orders", "reporting")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_the_subscriber_tears_the_actor_down() {
        let (_, subscriptions) = fixture();
        let (tx, rx) = mpsc::channel(16);
        let handle = subscriptions
            .subscribe_to_stream("orders", "reporting", tx, SubscriptionOptions::default())
            .await
            .unwrap();
        wait_until_subscribed(&handle).await;

        drop(rx);
        for _ in 0..200 {
            if !handle.is_subscribed().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("actor survived its subscriber");
    }
}
