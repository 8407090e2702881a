//! Event pages and the loader that fetches them.

use core::fmt;
use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use skein_events::Event;

use crate::shard::ShardName;
use crate::store::{EventDatabase, EventFilter, StoreError};

/// One unit of pipeline work: the events of one shard in `(floor, ceiling]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRange {
    pub shard: ShardName,
    pub floor: u64,
    pub ceiling: u64,
    pub events: Vec<Event>,
    /// Sequences removed after a failed apply.
    pub skipped: BTreeSet<u64>,
}

impl EventRange {
    pub fn new(shard: ShardName, floor: u64, ceiling: u64, events: Vec<Event>) -> Self {
        Self {
            shard,
            floor,
            ceiling,
            events,
            skipped: BTreeSet::new(),
        }
    }

    /// Drop every event at `sequence` (a parent and its fan-out children share one).
    pub fn skip_event_sequence(&mut self, sequence: u64) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.sequence != sequence);
        self.skipped.insert(sequence);
        before - self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

impl fmt::Display for EventRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {}]", self.shard, self.floor, self.ceiling)
    }
}

/// Fetches bounded, filtered pages for one shard.
#[derive(Clone)]
pub struct EventLoader {
    db: Arc<dyn EventDatabase>,
    filter: EventFilter,
    batch_size: usize,
}

impl EventLoader {
    pub fn new(db: Arc<dyn EventDatabase>, filter: EventFilter, batch_size: usize) -> Self {
        Self {
            db,
            filter,
            batch_size: batch_size.max(1),
        }
    }

    /// Load the next page above `floor`, bounded by `ceiling`.
    ///
    /// A full page ends at its last event so the next page starts right after
    /// it; a partial page has drained everything up to `ceiling` and ends there.
    pub async fn load(&self, shard: &ShardName, floor: u64, ceiling: u64) -> Result<EventRange, StoreError> {
        let events = self
            .db
            .load_event_page(floor, ceiling, &self.filter, self.batch_size)
            .await?;

        let ceiling = match events.last() {
            Some(last) if events.len() >= self.batch_size => last.sequence,
            _ => ceiling,
        };

        debug!(%shard, floor, ceiling, events = events.len(), "page loaded");
        Ok(EventRange::new(shard.clone(), floor, ceiling, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventDatabase;
    use serde_json::json;
    use skein_core::TenantId;
    use skein_events::{PendingEvent, StreamAction, StreamIdentity};

    fn seeded(count: usize) -> Arc<InMemoryEventDatabase> {
        let db = Arc::new(InMemoryEventDatabase::new());
        let events = (0..count)
            .map(|i| {
                let kind = if i % 2 == 0 { "order.placed" } else { "order.noise" };
                PendingEvent::new(kind, json!({ "i": i }))
            })
            .collect();
        db.append(StreamAction::append(TenantId::default_tenant(), StreamIdentity::key("s1"), events))
            .unwrap();
        db
    }

    #[tokio::test]
    async fn full_pages_end_at_their_last_event() {
        let loader = EventLoader::new(seeded(10), EventFilter::all(), 4);
        let shard = ShardName::new("Orders").unwrap();

        let first = loader.load(&shard, 0, 10).await.unwrap();
        assert_eq!((first.floor, first.ceiling, first.len()), (0, 4, 4));

        let last = loader.load(&shard, 8, 10).await.unwrap();
        assert_eq!((last.floor, last.ceiling, last.len()), (8, 10, 2));
    }

    #[tokio::test]
    async fn filtered_out_events_still_advance_the_ceiling() {
        let filter = EventFilter::all().with_event_types(["order.placed"]);
        let loader = EventLoader::new(seeded(6), filter, 10);

        let range = loader.load(&ShardName::new("Orders").unwrap(), 0, 6).await.unwrap();
        assert_eq!(range.ceiling, 6);
        assert_eq!(range.events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn skipping_removes_every_event_at_the_sequence() {
        let db = seeded(3);
        let events = futures::executor::block_on(db.load_event_page(0, 3, &EventFilter::all(), 10)).unwrap();
        let child = events[1].child("order.line", json!({}), 0);
        let mut all = events.clone();
        all.insert(2, child);

        let mut range = EventRange::new(ShardName::new("Orders").unwrap(), 0, 3, all);
        assert_eq!(range.skip_event_sequence(2), 2);
        assert_eq!(range.len(), 2);
        assert!(range.skipped.contains(&2));
        assert_eq!(range.to_string(), "Orders (0, 3]");
    }
}
