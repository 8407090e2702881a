//! Projection definitions: how slices turn into storage operations.
//!
//! A [`Projection`] is assembled at startup from an [`EventSlicer`] and an
//! explicit table of per-event-type handlers registered with
//! [`Projection::on`]. Events without a handler are carried through the
//! slice but produce no writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};

use skein_core::{DomainError, TenantId};
use skein_events::Event;

use crate::error::{ApplyError, GroupingError};
use crate::loader::EventRange;
use crate::pipeline::{ExecutionContext, GroupedExecution, ShardExecution};
use crate::shard::{AsyncShard, ShardName};
use crate::slicing::{EventSlicer, SliceGroup, SliceIdentity};
use crate::store::{EventFilter, ProjectionBatch, StorageOperation};

/// The two halves of grouped execution for one projection.
#[async_trait]
pub trait GroupedProjection<Id: SliceIdentity>: Send + Sync + 'static {
    /// Stage 1: partition a range into slice groups.
    async fn group(&self, range: &EventRange) -> Result<Vec<SliceGroup<Id>>, GroupingError>;

    /// Stage 2: turn slice groups into storage operations.
    ///
    /// Stops at the first failing event so the caller can decide whether to
    /// skip it or fail the batch.
    fn build_batch(&self, groups: &[SliceGroup<Id>], batch: &mut ProjectionBatch) -> Result<(), ApplyError>;
}

/// Anything the daemon can run as a set of shards.
pub trait ProjectionSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Fails when the projection's name cannot form a shard identity.
    fn shards(&self) -> Result<Vec<AsyncShard>, DomainError>;

    /// Start the two-stage pipeline for one of this projection's shards.
    fn build_execution(self: Arc<Self>, shard: &AsyncShard, context: ExecutionContext) -> Arc<dyn ShardExecution>;
}

/// Collects the writes for one slice document.
pub struct SliceWriter<'a> {
    doc_type: &'a str,
    tenant_id: &'a TenantId,
    id: String,
    references: &'a BTreeMap<String, JsonValue>,
    operations: Vec<StorageOperation>,
}

impl<'a> SliceWriter<'a> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &TenantId {
        self.tenant_id
    }

    /// A document attached to the slice by an enricher.
    pub fn reference(&self, name: &str) -> Option<&JsonValue> {
        self.references.get(name)
    }

    pub fn upsert(&mut self, body: JsonValue) {
        self.operations.push(StorageOperation::Upsert {
            doc_type: self.doc_type.to_string(),
            tenant_id: self.tenant_id.clone(),
            id: self.id.clone(),
            body,
        });
    }

    pub fn patch(&mut self, fields: JsonMap<String, JsonValue>) {
        self.operations.push(StorageOperation::Patch {
            doc_type: self.doc_type.to_string(),
            tenant_id: self.tenant_id.clone(),
            id: self.id.clone(),
            fields,
        });
    }

    pub fn set(&mut self, field: impl Into<String>, value: JsonValue) {
        let mut fields = JsonMap::new();
        fields.insert(field.into(), value);
        self.patch(fields);
    }

    pub fn increment(&mut self, field: impl Into<String>, by: i64) {
        self.operations.push(StorageOperation::Increment {
            doc_type: self.doc_type.to_string(),
            tenant_id: self.tenant_id.clone(),
            id: self.id.clone(),
            field: field.into(),
            by,
        });
    }

    pub fn delete(&mut self) {
        self.operations.push(StorageOperation::Delete {
            doc_type: self.doc_type.to_string(),
            tenant_id: self.tenant_id.clone(),
            id: self.id.clone(),
        });
    }
}

type Handler = Arc<dyn Fn(&Event, &mut SliceWriter<'_>) -> anyhow::Result<()> + Send + Sync>;

/// A projection writing one document per slice.
pub struct Projection<Id> {
    name: String,
    version: u32,
    doc_type: String,
    slicer: EventSlicer<Id>,
    handlers: HashMap<String, Handler>,
    stream_types: Vec<String>,
    batch_size: Option<usize>,
}

impl<Id: SliceIdentity> Projection<Id> {
    pub fn new(name: impl Into<String>, doc_type: impl Into<String>, slicer: EventSlicer<Id>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            doc_type: doc_type.into(),
            slicer,
            handlers: HashMap::new(),
            stream_types: Vec::new(),
            batch_size: None,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version.max(1);
        self
    }

    /// Register the handler for one event type, replacing any earlier one.
    pub fn on<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Event, &mut SliceWriter<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    pub fn stream_types<I, S>(mut self, stream_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stream_types = stream_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn shard_name(&self) -> Result<ShardName, DomainError> {
        ShardName::versioned(self.name.clone(), self.version, ShardName::ALL)
    }

    /// Store-side filter: handled types plus fan-out sources that produce them.
    ///
    /// Fan-out sources are always included because their children never
    /// exist in the store.
    pub fn filter(&self) -> EventFilter {
        let fan_outs = self.slicer.fan_outs();
        if self.handlers.is_empty() && fan_outs.is_empty() {
            return EventFilter::all().with_stream_types(self.stream_types.clone());
        }

        let mut types: Vec<String> = self
            .handlers
            .keys()
            .cloned()
            .chain(fan_outs.source_event_types().map(String::from))
            .collect();
        types.sort();
        types.dedup();

        EventFilter::all()
            .with_event_types(types)
            .with_stream_types(self.stream_types.clone())
    }
}

#[async_trait]
impl<Id: SliceIdentity> GroupedProjection<Id> for Projection<Id> {
    async fn group(&self, range: &EventRange) -> Result<Vec<SliceGroup<Id>>, GroupingError> {
        self.slicer.slice(&range.events).await
    }

    fn build_batch(&self, groups: &[SliceGroup<Id>], batch: &mut ProjectionBatch) -> Result<(), ApplyError> {
        for group in groups {
            for slice in group.slices() {
                let mut writer = SliceWriter {
                    doc_type: &self.doc_type,
                    tenant_id: &slice.tenant_id,
                    id: slice.id.to_string(),
                    references: &slice.references,
                    operations: Vec::new(),
                };

                for event in &slice.events {
                    batch.record_sequence(event.sequence);
                    if let Some(handler) = self.handlers.get(&event.event_type) {
                        handler(event, &mut writer).map_err(|err| ApplyError::new(event, format!("{err:#}")))?;
                    }
                }

                batch.operations.extend(writer.operations);
            }
        }
        Ok(())
    }
}

impl<Id: SliceIdentity> ProjectionSource for Projection<Id> {
    fn name(&self) -> &str {
        &self.name
    }

    fn shards(&self) -> Result<Vec<AsyncShard>, DomainError> {
        let shard = AsyncShard::new(self.shard_name()?, self.filter());
        Ok(vec![match self.batch_size {
            Some(size) => shard.with_batch_size(size),
            None => shard,
        }])
    }

    fn build_execution(self: Arc<Self>, shard: &AsyncShard, context: ExecutionContext) -> Arc<dyn ShardExecution> {
        GroupedExecution::<Id>::start(self, shard.name.clone(), context)
    }
}
