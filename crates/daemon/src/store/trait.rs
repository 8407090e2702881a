use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use skein_core::TenantId;
use skein_events::Event;

use crate::dead_letter::DeadLetterEvent;
use crate::shard::ShardName;

/// Event database operation error.
///
/// These are **infrastructure errors** raised by the storage collaborator.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed (stream version or progress floor mismatch).
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Which events a shard consumes. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Vec<String>,
    pub stream_types: Vec<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stream_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stream_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        let type_ok = self.event_types.is_empty() || self.event_types.iter().any(|t| *t == event.event_type);
        let stream_ok = self.stream_types.is_empty()
            || event
                .stream_type
                .as_ref()
                .is_some_and(|st| self.stream_types.iter().any(|t| t == st));
        type_ok && stream_ok
    }
}

/// One write against projected documents, produced by projection business logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StorageOperation {
    /// Replace the whole document.
    Upsert {
        doc_type: String,
        tenant_id: TenantId,
        id: String,
        body: JsonValue,
    },
    /// Merge top-level fields into the document, creating it when missing.
    Patch {
        doc_type: String,
        tenant_id: TenantId,
        id: String,
        fields: JsonMap<String, JsonValue>,
    },
    /// Add `by` to a numeric field, creating document and field when missing.
    Increment {
        doc_type: String,
        tenant_id: TenantId,
        id: String,
        field: String,
        by: i64,
    },
    Delete {
        doc_type: String,
        tenant_id: TenantId,
        id: String,
    },
}

impl StorageOperation {
    pub fn doc_type(&self) -> &str {
        match self {
            StorageOperation::Upsert { doc_type, .. }
            | StorageOperation::Patch { doc_type, .. }
            | StorageOperation::Increment { doc_type, .. }
            | StorageOperation::Delete { doc_type, .. } => doc_type,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            StorageOperation::Upsert { id, .. }
            | StorageOperation::Patch { id, .. }
            | StorageOperation::Increment { id, .. }
            | StorageOperation::Delete { id, .. } => id,
        }
    }
}

/// Move a shard's recorded progress from `from` to `to`.
///
/// `from` is the floor the batch was built against; stores reject the update
/// when the persisted value differs so a stale writer cannot clobber progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub from: u64,
    pub to: u64,
}

/// Everything one event range produced, committed atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionBatch {
    pub projection: String,
    pub shard: ShardName,
    pub operations: Vec<StorageOperation>,
    pub progress: ProgressUpdate,
    /// Sequences of the events that went into this batch.
    pub sequences: BTreeSet<u64>,
}

impl ProjectionBatch {
    pub fn new(shard: &ShardName, floor: u64, ceiling: u64) -> Self {
        Self {
            projection: shard.projection_name().to_string(),
            shard: shard.clone(),
            operations: Vec::new(),
            progress: ProgressUpdate {
                from: floor,
                to: ceiling,
            },
            sequences: BTreeSet::new(),
        }
    }

    pub fn push(&mut self, operation: StorageOperation) {
        self.operations.push(operation);
    }

    pub fn record_sequence(&mut self, sequence: u64) {
        self.sequences.insert(sequence);
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Abstract event store / database the daemon consumes.
///
/// Ranges are half-open: `(floor, ceiling]`. Progress rows are keyed by shard
/// identity; dead-letter rows by shard identity plus original event sequence.
#[async_trait::async_trait]
pub trait EventDatabase: Send + Sync {
    /// Name used in logs.
    fn identifier(&self) -> &str;

    /// Highest sequence with no uncommitted gap at or below it.
    async fn fetch_highest_contiguous_sequence(&self) -> Result<u64, StoreError>;

    /// Highest committed sequence, gaps or not.
    async fn fetch_highest_sequence(&self) -> Result<u64, StoreError>;

    /// Up to `limit` events in `(floor, ceiling]` matching `filter`, in sequence order.
    async fn load_event_page(
        &self,
        floor: u64,
        ceiling: u64,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    async fn read_progress(&self, shard: &ShardName) -> Result<Option<u64>, StoreError>;

    /// Overwrite a shard's progress unconditionally.
    async fn rewind_progress(&self, shard: &ShardName, floor: u64) -> Result<(), StoreError>;

    /// Delete the progress rows of every shard of `projection`.
    async fn teardown_progress(&self, projection: &str) -> Result<(), StoreError>;

    /// Delete every document written by `projection`.
    async fn teardown_projection_data(&self, projection: &str) -> Result<(), StoreError>;

    /// Apply a batch's operations and progress update atomically.
    async fn persist_batch(&self, batch: ProjectionBatch) -> Result<(), StoreError>;

    async fn store_dead_letter_event(&self, event: DeadLetterEvent) -> Result<(), StoreError>;

    async fn load_dead_letter_events(&self, shard: &ShardName) -> Result<Vec<DeadLetterEvent>, StoreError>;

    /// Highest sequence committed strictly before `timestamp` (0 when none).
    async fn find_floor_sequence_at_timestamp(&self, timestamp: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait::async_trait]
impl<S> EventDatabase for Arc<S>
where
    S: EventDatabase + ?Sized,
{
    fn identifier(&self) -> &str {
        (**self).identifier()
    }

    async fn fetch_highest_contiguous_sequence(&self) -> Result<u64, StoreError> {
        (**self).fetch_highest_contiguous_sequence().await
    }

    async fn fetch_highest_sequence(&self) -> Result<u64, StoreError> {
        (**self).fetch_highest_sequence().await
    }

    async fn load_event_page(
        &self,
        floor: u64,
        ceiling: u64,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        (**self).load_event_page(floor, ceiling, filter, limit).await
    }

    async fn read_progress(&self, shard: &ShardName) -> Result<Option<u64>, StoreError> {
        (**self).read_progress(shard).await
    }

    async fn rewind_progress(&self, shard: &ShardName, floor: u64) -> Result<(), StoreError> {
        (**self).rewind_progress(shard, floor).await
    }

    async fn teardown_progress(&self, projection: &str) -> Result<(), StoreError> {
        (**self).teardown_progress(projection).await
    }

    async fn teardown_projection_data(&self, projection: &str) -> Result<(), StoreError> {
        (**self).teardown_projection_data(projection).await
    }

    async fn persist_batch(&self, batch: ProjectionBatch) -> Result<(), StoreError> {
        (**self).persist_batch(batch).await
    }

    async fn store_dead_letter_event(&self, event: DeadLetterEvent) -> Result<(), StoreError> {
        (**self).store_dead_letter_event(event).await
    }

    async fn load_dead_letter_events(&self, shard: &ShardName) -> Result<Vec<DeadLetterEvent>, StoreError> {
        (**self).load_dead_letter_events(shard).await
    }

    async fn find_floor_sequence_at_timestamp(&self, timestamp: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).find_floor_sequence_at_timestamp(timestamp).await
    }
}
