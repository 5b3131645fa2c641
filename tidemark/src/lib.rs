//! # Tidemark
//!
//! Facade crate for the Tidemark event store subscription stack. Re-exports
//! the core and, behind feature flags, the storage backends:
//!
//! - `store_mem` (default): in-memory backend for tests and development
//! - `store_pg`: PostgreSQL backend

#![deny(missing_docs)]

pub use tidemark_core;

#[cfg(feature = "store_mem")]
pub use tidemark_mem;

#[cfg(feature = "store_pg")]
pub use tidemark_pg;

pub mod prelude {
    //! The prelude module for the `tidemark` crate.
    pub use tidemark_core::prelude::*;

    #[cfg(feature = "store_mem")]
    pub use tidemark_mem::{MemCheckpointStore, MemEventLog};

    #[cfg(feature = "store_pg")]
    pub use tidemark_pg::{Migrator, PgCheckpointStore, PgHistoricalReader};
}
