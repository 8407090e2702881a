//! Event records and pending stream appends.
//!
//! Everything here is immutable data shared between the write side (which
//! builds [`StreamAction`]s) and the projection daemon (which reads sequenced
//! [`Event`]s back out of the store).

pub mod event;
pub mod stream;
pub mod tenant;

pub use event::{Event, EventPayload};
pub use stream::{PendingEvent, StreamAction, StreamActionType, StreamIdentity};
pub use tenant::TenantScoped;
