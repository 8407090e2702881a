//! Dead-letter records and the queue that persists them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use skein_events::Event;

use crate::error::ApplyError;
use crate::retry::{RetryBlock, RetryPolicy};
use crate::shard::ShardName;
use crate::store::EventDatabase;

/// An event that failed to apply and was skipped.
///
/// Skipping drops a whole sequence, so when the failing event is a fan-out
/// child the record holds the stored source event and names the child in
/// the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub shard: ShardName,
    pub projection: String,
    pub event_sequence: u64,
    pub event: Event,
    pub error_message: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    pub fn new(shard: &ShardName, error: &ApplyError) -> Self {
        Self {
            shard: shard.clone(),
            projection: shard.projection_name().to_string(),
            event_sequence: error.sequence(),
            event: (*error.event).clone(),
            error_message: error.message.clone(),
            recorded_at: Utc::now(),
        }
    }

    /// Record `source` as the skipped event when the failure came from one of its children.
    pub fn with_source(mut self, source: &Event) -> Self {
        if source.id != self.event.id {
            self.error_message = format!(
                "{} (fan-out child '{}' of event {})",
                self.error_message, self.event.event_type, source.id
            );
            self.event = source.clone();
        }
        self
    }
}

/// Bounded queue writing dead letters to the event database with retries.
///
/// `record` waits while the queue is full, so a struggling store slows the
/// pipeline instead of losing records.
pub struct DeadLetterSink {
    block: RetryBlock<DeadLetterEvent>,
}

impl DeadLetterSink {
    /// Spawn the writer. Must be called inside a tokio runtime.
    pub fn spawn<D>(db: Arc<D>, capacity: usize, policy: RetryPolicy) -> Self
    where
        D: EventDatabase + ?Sized + 'static,
    {
        let block = RetryBlock::spawn("dead-letters", capacity, policy, move |event: DeadLetterEvent| {
            let db = db.clone();
            async move { db.store_dead_letter_event(event).await }
        });
        Self { block }
    }

    pub async fn record(&self, event: DeadLetterEvent) {
        let shard = event.shard.clone();
        let sequence = event.event_sequence;
        match self.block.post(event).await {
            Ok(()) => info!(%shard, sequence, "event dead-lettered"),
            Err(err) => warn!(%shard, sequence, error = %err, "dead-letter queue closed, record dropped"),
        }
    }

    /// Flush queued records, waiting at most `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.block.complete(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventDatabase;
    use serde_json::json;
    use skein_core::TenantId;
    use skein_events::{PendingEvent, StreamAction, StreamIdentity};

    #[tokio::test]
    async fn recorded_events_reach_the_store_after_drain() {
        let db = Arc::new(InMemoryEventDatabase::new());
        let event = db
            .append(StreamAction::start(
                TenantId::default_tenant(),
                StreamIdentity::key("a"),
                vec![PendingEvent::new("order.placed", json!({}))],
            ))
            .unwrap()
            .remove(0);

        let shard = ShardName::new("Orders").unwrap();
        let sink = DeadLetterSink::spawn(db.clone(), 4, RetryPolicy::no_retry());
        sink.record(DeadLetterEvent::new(&shard, &ApplyError::new(&event, "boom")))
            .await;
        assert!(sink.drain(Duration::from_secs(1)).await);

        let stored = db.load_dead_letter_events(&shard).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_sequence, 1);
        assert_eq!(stored[0].error_message, "boom");
        assert_eq!(stored[0].projection, "Orders");
    }

    #[test]
    fn child_failures_record_the_source_event() {
        let source = Event {
            id: skein_core::EventId::new(),
            sequence: 7,
            version: 1,
            stream: StreamIdentity::key("a"),
            stream_type: None,
            tenant_id: TenantId::default_tenant(),
            timestamp: Utc::now(),
            event_type: "order.bulk".into(),
            causation_id: None,
            correlation_id: None,
            data: json!({}),
        };
        let child = source.child("order.line", json!({}), 0);
        let shard = ShardName::new("Orders").unwrap();

        let record = DeadLetterEvent::new(&shard, &ApplyError::new(&child, "boom")).with_source(&source);
        assert_eq!(record.event, source);
        assert_eq!(record.event_sequence, 7);
        assert!(record.error_message.starts_with("boom (fan-out child 'order.line'"));

        let plain = DeadLetterEvent::new(&shard, &ApplyError::new(&source, "boom")).with_source(&source);
        assert_eq!(plain.error_message, "boom");
    }
}
