//! Event database boundary.
//!
//! The daemon never talks to a concrete database; it consumes the
//! [`EventDatabase`] trait for reading events, tracking shard progress,
//! committing projection batches and recording dead letters.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventDatabase;
pub use r#trait::{
    EventDatabase, EventFilter, ProgressUpdate, ProjectionBatch, StorageOperation, StoreError,
};
