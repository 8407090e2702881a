use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};

use skein_core::TenantId;
use skein_events::{Event, StreamAction, StreamIdentity};

use super::r#trait::{EventDatabase, EventFilter, ProjectionBatch, StorageOperation, StoreError};
use crate::dead_letter::DeadLetterEvent;
use crate::shard::ShardName;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DocumentKey {
    doc_type: String,
    tenant_id: TenantId,
    id: String,
}

#[derive(Debug, Default)]
struct Inner {
    events: BTreeMap<u64, Event>,
    /// Last sequence handed out, committed or reserved.
    last_assigned: u64,
    /// Sequences handed out to writers that have not committed yet.
    reserved: BTreeSet<u64>,
    stream_versions: HashMap<(TenantId, StreamIdentity), u64>,

    /// shard identity -> (projection, sequence)
    progress: HashMap<String, (String, u64)>,
    dead_letters: BTreeMap<(String, u64), DeadLetterEvent>,
    documents: BTreeMap<DocumentKey, JsonValue>,
    /// doc_type -> owning projection
    document_owners: HashMap<String, String>,

    batches: Vec<ProjectionBatch>,
    failures: Option<(usize, String)>,
}

/// In-memory event database.
///
/// Intended for tests/dev. Besides the [`EventDatabase`] contract it can hold
/// back sequence numbers to simulate in-flight writers and inject batch
/// failures.
#[derive(Debug)]
pub struct InMemoryEventDatabase {
    name: String,
    inner: RwLock<Inner>,
}

impl Default for InMemoryEventDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventDatabase {
    pub fn new() -> Self {
        Self::named("in-memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn inspect(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commit a stream action, assigning global sequences and stream versions.
    pub fn append(&self, action: StreamAction) -> Result<Vec<Event>, StoreError> {
        if action.events.is_empty() {
            return Ok(vec![]);
        }

        let mut inner = self.write()?;
        let key = (action.tenant_id.clone(), action.stream.clone());
        let current = inner.stream_versions.get(&key).copied().unwrap_or(0);

        if !action.expected_version.matches(current) {
            return Err(StoreError::Concurrency(format!(
                "stream '{}' expected {:?}, found {current}",
                action.stream, action.expected_version
            )));
        }

        let mut committed = Vec::with_capacity(action.events.len());
        let mut version = current;
        for pending in action.events {
            inner.last_assigned += 1;
            version += 1;

            let event = Event {
                id: pending.id,
                sequence: inner.last_assigned,
                version,
                stream: action.stream.clone(),
                stream_type: action.stream_type.clone(),
                tenant_id: action.tenant_id.clone(),
                timestamp: pending.timestamp.unwrap_or_else(Utc::now),
                event_type: pending.event_type,
                causation_id: pending.causation_id,
                correlation_id: pending.correlation_id,
                data: pending.data,
            };
            inner.events.insert(event.sequence, event.clone());
            committed.push(event);
        }
        inner.stream_versions.insert(key, version);

        Ok(committed)
    }

    /// Hand out a sequence number without committing an event for it.
    ///
    /// The contiguous high-water mark stays below it until it is released.
    pub fn reserve_sequence(&self) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        inner.last_assigned += 1;
        let sequence = inner.last_assigned;
        inner.reserved.insert(sequence);
        Ok(sequence)
    }

    /// Give up a reserved sequence; it becomes a permanent, settled gap.
    pub fn release_sequence(&self, sequence: u64) -> Result<(), StoreError> {
        self.write()?.reserved.remove(&sequence);
        Ok(())
    }

    /// Make the next `count` calls to `persist_batch` fail with `message`.
    pub fn fail_next_batches(&self, count: usize, message: impl Into<String>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.failures = (count > 0).then(|| (count, message.into()));
    }

    pub fn document(&self, doc_type: &str, tenant_id: &TenantId, id: &str) -> Option<JsonValue> {
        let key = DocumentKey {
            doc_type: doc_type.to_string(),
            tenant_id: tenant_id.clone(),
            id: id.to_string(),
        };
        self.inspect().documents.get(&key).cloned()
    }

    pub fn document_count(&self, doc_type: &str) -> usize {
        self.inspect()
            .documents
            .keys()
            .filter(|k| k.doc_type == doc_type)
            .count()
    }

    pub fn progress_for(&self, shard: &ShardName) -> Option<u64> {
        self.inspect().progress.get(shard.identity()).map(|(_, seq)| *seq)
    }

    /// Every progress row as `identity -> sequence`.
    pub fn progress_rows(&self) -> BTreeMap<String, u64> {
        self.inspect()
            .progress
            .iter()
            .map(|(identity, (_, seq))| (identity.clone(), *seq))
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEvent> {
        self.inspect().dead_letters.values().cloned().collect()
    }

    /// Batches committed so far, oldest first.
    pub fn executed_batches(&self) -> Vec<ProjectionBatch> {
        self.inspect().batches.clone()
    }

    pub fn event_count(&self) -> usize {
        self.inspect().events.len()
    }
}

fn apply_operation(
    documents: &mut BTreeMap<DocumentKey, JsonValue>,
    operation: StorageOperation,
) -> Result<(), StoreError> {
    match operation {
        StorageOperation::Upsert {
            doc_type,
            tenant_id,
            id,
            body,
        } => {
            documents.insert(DocumentKey { doc_type, tenant_id, id }, body);
        }
        StorageOperation::Patch {
            doc_type,
            tenant_id,
            id,
            fields,
        } => {
            let doc = documents
                .entry(DocumentKey { doc_type, tenant_id, id })
                .or_insert_with(|| JsonValue::Object(JsonMap::new()));
            let object = doc
                .as_object_mut()
                .ok_or_else(|| StoreError::Storage("cannot patch a non-object document".to_string()))?;
            object.extend(fields);
        }
        StorageOperation::Increment {
            doc_type,
            tenant_id,
            id,
            field,
            by,
        } => {
            let doc = documents
                .entry(DocumentKey { doc_type, tenant_id, id })
                .or_insert_with(|| JsonValue::Object(JsonMap::new()));
            let object = doc
                .as_object_mut()
                .ok_or_else(|| StoreError::Storage("cannot increment a non-object document".to_string()))?;
            let current = object.get(&field).and_then(JsonValue::as_i64).unwrap_or(0);
            object.insert(field, JsonValue::from(current + by));
        }
        StorageOperation::Delete {
            doc_type,
            tenant_id,
            id,
        } => {
            documents.remove(&DocumentKey { doc_type, tenant_id, id });
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl EventDatabase for InMemoryEventDatabase {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn fetch_highest_contiguous_sequence(&self) -> Result<u64, StoreError> {
        let inner = self.read()?;
        let highest = inner.events.keys().next_back().copied().unwrap_or(0);
        Ok(match inner.reserved.iter().next() {
            Some(first_gap) => highest.min(first_gap - 1),
            None => highest,
        })
    }

    async fn fetch_highest_sequence(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.events.keys().next_back().copied().unwrap_or(0))
    }

    async fn load_event_page(
        &self,
        floor: u64,
        ceiling: u64,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        if floor >= ceiling || limit == 0 {
            return Ok(vec![]);
        }

        let inner = self.read()?;
        Ok(inner
            .events
            .range(floor + 1..=ceiling)
            .map(|(_, e)| e)
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn read_progress(&self, shard: &ShardName) -> Result<Option<u64>, StoreError> {
        Ok(self.read()?.progress.get(shard.identity()).map(|(_, seq)| *seq))
    }

    async fn rewind_progress(&self, shard: &ShardName, floor: u64) -> Result<(), StoreError> {
        self.write()?.progress.insert(
            shard.identity().to_string(),
            (shard.projection_name().to_string(), floor),
        );
        Ok(())
    }

    async fn teardown_progress(&self, projection: &str) -> Result<(), StoreError> {
        self.write()?.progress.retain(|_, (owner, _)| owner != projection);
        Ok(())
    }

    async fn teardown_projection_data(&self, projection: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let owned: BTreeSet<String> = inner
            .document_owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == projection)
            .map(|(doc_type, _)| doc_type.clone())
            .collect();
        inner.documents.retain(|k, _| !owned.contains(&k.doc_type));
        Ok(())
    }

    async fn persist_batch(&self, batch: ProjectionBatch) -> Result<(), StoreError> {
        let mut inner = self.write()?;

        if let Some((remaining, message)) = inner.failures.take() {
            if remaining > 1 {
                inner.failures = Some((remaining - 1, message.clone()));
            }
            return Err(StoreError::Unavailable(message));
        }

        let identity = batch.shard.identity().to_string();
        let current = inner.progress.get(&identity).map(|(_, seq)| *seq).unwrap_or(0);
        if current != batch.progress.from {
            return Err(StoreError::Concurrency(format!(
                "progress for '{identity}' is {current}, batch expected {}",
                batch.progress.from
            )));
        }

        // Work on a copy so a failing operation leaves nothing behind.
        let mut documents = inner.documents.clone();
        for operation in batch.operations.iter().cloned() {
            apply_operation(&mut documents, operation)?;
        }

        inner.documents = documents;
        for operation in &batch.operations {
            inner
                .document_owners
                .entry(operation.doc_type().to_string())
                .or_insert_with(|| batch.projection.clone());
        }
        inner
            .progress
            .insert(identity, (batch.projection.clone(), batch.progress.to));
        inner.batches.push(batch);
        Ok(())
    }

    async fn store_dead_letter_event(&self, event: DeadLetterEvent) -> Result<(), StoreError> {
        let key = (event.shard.identity().to_string(), event.event_sequence);
        self.write()?.dead_letters.insert(key, event);
        Ok(())
    }

    async fn load_dead_letter_events(&self, shard: &ShardName) -> Result<Vec<DeadLetterEvent>, StoreError> {
        Ok(self
            .read()?
            .dead_letters
            .iter()
            .filter(|((identity, _), _)| identity == shard.identity())
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn find_floor_sequence_at_timestamp(&self, timestamp: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self
            .read()?
            .events
            .values()
            .filter(|e| e.timestamp < timestamp)
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_events::PendingEvent;

    fn placed(stream: &str) -> StreamAction {
        StreamAction::start(
            TenantId::default_tenant(),
            StreamIdentity::key(stream),
            vec![
                PendingEvent::new("order.placed", json!({})),
                PendingEvent::new("order.line_added", json!({ "qty": 1 })),
            ],
        )
    }

    #[tokio::test]
    async fn append_assigns_sequences_and_versions() {
        let db = InMemoryEventDatabase::new();
        db.append(placed("a")).unwrap();
        let second = db.append(placed("b")).unwrap();

        assert_eq!(second[0].sequence, 3);
        assert_eq!(second[0].version, 1);
        assert_eq!(second[1].version, 2);
        assert_eq!(db.fetch_highest_sequence().await.unwrap(), 4);
    }

    #[test]
    fn starting_an_existing_stream_is_a_concurrency_error() {
        let db = InMemoryEventDatabase::new();
        db.append(placed("a")).unwrap();
        assert!(matches!(db.append(placed("a")), Err(StoreError::Concurrency(_))));
    }

    #[tokio::test]
    async fn reserved_sequences_hold_back_the_contiguous_mark() {
        let db = InMemoryEventDatabase::new();
        db.append(placed("a")).unwrap();
        let gap = db.reserve_sequence().unwrap();
        db.append(placed("b")).unwrap();

        assert_eq!(db.fetch_highest_contiguous_sequence().await.unwrap(), 2);
        assert_eq!(db.fetch_highest_sequence().await.unwrap(), 5);

        db.release_sequence(gap).unwrap();
        assert_eq!(db.fetch_highest_contiguous_sequence().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn pages_respect_floor_ceiling_filter_and_limit() {
        let db = InMemoryEventDatabase::new();
        db.append(placed("a")).unwrap();
        db.append(placed("b")).unwrap();

        let all = EventFilter::all();
        let page = db.load_event_page(1, 4, &all, 10).await.unwrap();
        assert_eq!(page.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3, 4]);

        let placed_only = EventFilter::all().with_event_types(["order.placed"]);
        let page = db.load_event_page(0, 4, &placed_only, 10).await.unwrap();
        assert_eq!(page.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 3]);

        assert_eq!(db.load_event_page(0, 4, &all, 2).await.unwrap().len(), 2);
        assert!(db.load_event_page(4, 4, &all, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batches_apply_operations_and_guard_progress() {
        let db = InMemoryEventDatabase::new();
        let shard = ShardName::new("Orders").unwrap();
        let tenant = TenantId::default_tenant();

        let mut batch = ProjectionBatch::new(&shard, 0, 10);
        batch.push(StorageOperation::Upsert {
            doc_type: "order".into(),
            tenant_id: tenant.clone(),
            id: "a".into(),
            body: json!({ "status": "placed" }),
        });
        batch.push(StorageOperation::Increment {
            doc_type: "order".into(),
            tenant_id: tenant.clone(),
            id: "a".into(),
            field: "lines".into(),
            by: 2,
        });
        db.persist_batch(batch).await.unwrap();

        assert_eq!(
            db.document("order", &tenant, "a"),
            Some(json!({ "status": "placed", "lines": 2 }))
        );
        assert_eq!(db.progress_for(&shard), Some(10));

        let stale = ProjectionBatch::new(&shard, 0, 12);
        assert!(matches!(db.persist_batch(stale).await, Err(StoreError::Concurrency(_))));
        assert_eq!(db.progress_for(&shard), Some(10));
    }

    #[tokio::test]
    async fn failed_operations_leave_no_partial_writes() {
        let db = InMemoryEventDatabase::new();
        let shard = ShardName::new("Orders").unwrap();
        let tenant = TenantId::default_tenant();

        let mut batch = ProjectionBatch::new(&shard, 0, 3);
        batch.push(StorageOperation::Upsert {
            doc_type: "order".into(),
            tenant_id: tenant.clone(),
            id: "a".into(),
            body: json!("not an object"),
        });
        batch.push(StorageOperation::Increment {
            doc_type: "order".into(),
            tenant_id: tenant.clone(),
            id: "a".into(),
            field: "lines".into(),
            by: 1,
        });

        assert!(db.persist_batch(batch).await.is_err());
        assert_eq!(db.document("order", &tenant, "a"), None);
        assert_eq!(db.progress_for(&shard), None);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let db = InMemoryEventDatabase::new();
        let shard = ShardName::new("Orders").unwrap();
        db.fail_next_batches(1, "disk full");

        let err = db.persist_batch(ProjectionBatch::new(&shard, 0, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        db.persist_batch(ProjectionBatch::new(&shard, 0, 1)).await.unwrap();
        assert_eq!(db.executed_batches().len(), 1);
    }

    #[tokio::test]
    async fn teardown_removes_only_the_projection() {
        let db = InMemoryEventDatabase::new();
        let tenant = TenantId::default_tenant();

        for (projection, doc_type) in [("Orders", "order"), ("Invoices", "invoice")] {
            let shard = ShardName::new(projection).unwrap();
            let mut batch = ProjectionBatch::new(&shard, 0, 1);
            batch.push(StorageOperation::Upsert {
                doc_type: doc_type.into(),
                tenant_id: tenant.clone(),
                id: "x".into(),
                body: json!({}),
            });
            db.persist_batch(batch).await.unwrap();
        }

        db.teardown_progress("Orders").await.unwrap();
        db.teardown_projection_data("Orders").await.unwrap();

        assert_eq!(db.document_count("order"), 0);
        assert_eq!(db.document_count("invoice"), 1);
        assert_eq!(db.progress_rows().keys().collect::<Vec<_>>(), vec!["Invoices"]);
    }

    #[tokio::test]
    async fn timestamp_floor_is_the_last_event_before_the_instant() {
        let db = InMemoryEventDatabase::new();
        let early = Utc::now() - chrono::Duration::hours(2);
        let late = Utc::now() - chrono::Duration::hours(1);

        db.append(StreamAction::start(
            TenantId::default_tenant(),
            StreamIdentity::key("a"),
            vec![
                PendingEvent::new("order.placed", json!({})).at(early),
                PendingEvent::new("order.line_added", json!({})).at(late),
            ],
        ))
        .unwrap();

        let between = early + chrono::Duration::minutes(30);
        assert_eq!(db.find_floor_sequence_at_timestamp(between).await.unwrap(), 1);
        assert_eq!(db.find_floor_sequence_at_timestamp(early).await.unwrap(), 0);
    }
}
