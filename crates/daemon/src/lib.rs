//! Projection daemon: continuously materializes read models from a sequenced event log.
//!
//! An [`AsyncDaemon`] owns one [`SubscriptionAgent`] per running shard. Agents
//! read pages bounded by the high-water mark, slice them per identity and feed
//! them through a two-stage [`pipeline`] that commits operations and progress
//! together.

pub mod agent;
pub mod daemon;
pub mod dead_letter;
pub mod error;
pub mod high_water;
pub mod loader;
pub mod pipeline;
pub mod projection;
pub mod retry;
pub mod settings;
pub mod shard;
pub mod slicing;
pub mod store;
pub mod tracker;


pub use agent::{AgentSnapshot, AgentStartRequest, AgentStatus, StartFloor, SubscriptionAgent};
pub use daemon::{AsyncDaemon, RebuildOutcome, RewindTarget};
pub use dead_letter::{DeadLetterEvent, DeadLetterSink};
pub use error::{ApplyError, DaemonError, GroupingError, RebuildFailure};
pub use high_water::{HighWaterAgent, HighWaterStatistics, HighWaterStatus};
pub use loader::{EventLoader, EventRange};
pub use pipeline::{ExecutionContext, ExecutionListener, GroupedExecution, ShardExecution};
pub use projection::{GroupedProjection, Projection, ProjectionSource, SliceWriter};
pub use retry::{BackoffStrategy, RetryBlock, RetryPolicy};
pub use settings::{DaemonSettings, ErrorHandlingOptions};
pub use shard::{AsyncShard, ShardAction, ShardExecutionMode, ShardName, ShardState};
pub use store::{EventDatabase, EventFilter, InMemoryEventDatabase, ProjectionBatch, StorageOperation, StoreError};
pub use tracker::{ObserverSubscription, ShardObserver, ShardStateTracker};
