//! `skein-core`: identity and concurrency primitives shared by every skein crate.
//!
//! This crate contains **pure** building blocks (no IO, no async).

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{EventId, StreamId, TenantId};
pub use version::ExpectedVersion;
