//! # Tidemark core
//!
//! The subscription core of the Tidemark event store: per-subscription
//! lifecycle and delivery. A subscription loads (or creates) a durable
//! checkpoint, catches up on history in acknowledgement-gated chunks, hands
//! over to live push from the in-process broadcast bus without gaps or
//! duplicates past the checkpoint, buffers with backpressure while the
//! subscriber works, and persists every acknowledgement so a restart resumes
//! exactly where the subscriber left off.
//!
//! Storage backends implement [`CheckpointStore`] and [`HistoricalReader`];
//! see `tidemark_pg` for PostgreSQL and `tidemark_mem` for the in-memory
//! backend used in tests and development.

#![deny(missing_docs)]

pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod event;
pub mod reader;
pub mod subscription;
pub mod subscriptions;

pub use bus::{Bus, PublishedBatch};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{Mapper, SubscriptionOptions};
pub use event::{
    ALL_STREAMS, AckTarget, ProposedEvent, RecordedEvent, SubscriptionKind, chunk_by_correlation,
};
pub use reader::{EventBatchStream, HistoricalReader, ReadError};
pub use subscription::Delivery;
pub use subscription::fsm::{ProtocolError, SubscriptionState};
pub use subscriptions::{SubscribeError, SubscriptionGone, SubscriptionHandle, Subscriptions};

pub mod prelude {
    //! The prelude module for the `tidemark_core` crate.
    pub use super::{
        ALL_STREAMS, AckTarget, Bus, Checkpoint, CheckpointStore, Delivery, HistoricalReader,
        Mapper, ProposedEvent, ReadError, RecordedEvent, SubscribeError, SubscriptionHandle,
        SubscriptionKind, SubscriptionOptions, SubscriptionState, Subscriptions,
    };
}
