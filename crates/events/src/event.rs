use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use skein_core::{EventId, TenantId};

use crate::StreamIdentity;

/// A typed event payload that can be appended to a stream.
///
/// Payloads are facts: immutable, append-only and identified by a stable type
/// name (e.g. "order.placed").
pub trait EventPayload: Serialize + Send + Sync + 'static {
    /// Stable event name/type identifier.
    fn event_type(&self) -> &'static str;
}

/// A committed event read back from the store.
///
/// `sequence` is assigned by the store at commit time and is the only globally
/// ordered field. `version` is the 1-based position inside the owning stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    /// Global, store-assigned position.
    pub sequence: u64,

    /// Position within the stream, starting at 1.
    pub version: u64,

    pub stream: StreamIdentity,
    pub stream_type: Option<String>,
    pub tenant_id: TenantId,
    pub timestamp: DateTime<Utc>,

    pub event_type: String,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,

    pub data: JsonValue,
}

impl Event {
    /// Deserialize the payload into a typed value.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Build a synthetic child event derived from this one.
    ///
    /// The child keeps the parent's stream, tenant, sequence and version so it
    /// sorts next to its parent; its id is derived deterministically from the
    /// parent id, the child type and `ordinal`.
    pub fn child(&self, event_type: impl Into<String>, data: JsonValue, ordinal: usize) -> Event {
        self.child_of_rule(0, event_type, data, ordinal)
    }

    /// A child whose id also depends on which expansion `rule` produced it.
    pub fn child_of_rule(&self, rule: usize, event_type: impl Into<String>, data: JsonValue, ordinal: usize) -> Event {
        let event_type = event_type.into();
        Event {
            id: EventId::derived(self.id, &format!("{rule}/{event_type}"), ordinal),
            sequence: self.sequence,
            version: self.version,
            stream: self.stream.clone(),
            stream_type: self.stream_type.clone(),
            tenant_id: self.tenant_id.clone(),
            timestamp: self.timestamp,
            event_type,
            causation_id: Some(self.id.to_string()),
            correlation_id: self.correlation_id.clone(),
            data,
        }
    }

    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_core::StreamId;

    fn sample() -> Event {
        Event {
            id: EventId::new(),
            sequence: 7,
            version: 2,
            stream: StreamIdentity::Id(StreamId::new()),
            stream_type: Some("order".into()),
            tenant_id: TenantId::from("t1"),
            timestamp: Utc::now(),
            event_type: "order.placed".into(),
            causation_id: None,
            correlation_id: Some("corr-1".into()),
            data: json!({ "lines": 2 }),
        }
    }

    #[test]
    fn child_events_inherit_position_and_identity() {
        let parent = sample();
        let child = parent.child("order.line", json!({ "n": 1 }), 0);

        assert_eq!(child.sequence, parent.sequence);
        assert_eq!(child.stream, parent.stream);
        assert_eq!(child.tenant_id, parent.tenant_id);
        assert_eq!(child.causation_id.as_deref(), Some(parent.id.to_string().as_str()));
        assert_eq!(child, parent.child("order.line", json!({ "n": 1 }), 0));
        assert_ne!(child.id, parent.child_of_rule(1, "order.line", json!({ "n": 1 }), 0).id);
    }

    #[test]
    fn data_as_reads_typed_payloads() {
        #[derive(Deserialize)]
        struct Placed {
            lines: u32,
        }

        let placed: Placed = sample().data_as().unwrap();
        assert_eq!(placed.lines, 2);
    }
}
