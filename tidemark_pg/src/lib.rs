//! # Tidemark postgres store
//!
//! PostgreSQL implementations of the Tidemark storage traits: a
//! [`PgCheckpointStore`] persisting subscription checkpoints and a
//! [`PgHistoricalReader`] serving batched catch-up reads, plus the embedded
//! [`migrations`] that manage the backing schema.

#![deny(missing_docs)]

/// Durable subscription checkpoints backed by `tidemark_subscriptions`.
pub mod checkpoint_store;

/// Embedded, checksummed schema migrations.
pub mod migrations;

/// Batched historical reads over `tidemark_events`.
pub mod reader;

pub use checkpoint_store::{PgCheckpointStore, PgStoreError};
pub use migrations::{Migration, MigrationError, Migrator};
pub use reader::PgHistoricalReader;
