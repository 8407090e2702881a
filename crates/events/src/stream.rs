use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use skein_core::{EventId, ExpectedVersion, StreamId, TenantId};

use crate::EventPayload;

/// Identity of a stream: either a UUID or a string key, never both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamIdentity {
    Id(StreamId),
    Key(String),
}

impl StreamIdentity {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn as_id(&self) -> Option<StreamId> {
        match self {
            StreamIdentity::Id(id) => Some(*id),
            StreamIdentity::Key(_) => None,
        }
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            StreamIdentity::Id(_) => None,
            StreamIdentity::Key(k) => Some(k),
        }
    }
}

impl core::fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StreamIdentity::Id(id) => core::fmt::Display::fmt(id, f),
            StreamIdentity::Key(k) => f.write_str(k),
        }
    }
}

impl From<StreamId> for StreamIdentity {
    fn from(value: StreamId) -> Self {
        Self::Id(value)
    }
}

/// Whether a stream action creates a new stream or extends an existing one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamActionType {
    Start,
    Append,
}

/// An event ready to be appended (not yet assigned a sequence or version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub id: EventId,
    pub event_type: String,
    pub data: JsonValue,
    pub timestamp: Option<DateTime<Utc>>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl PendingEvent {
    pub fn new(event_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            data,
            timestamp: None,
            causation_id: None,
            correlation_id: None,
        }
    }

    /// Serialize a typed payload into a pending event.
    pub fn from_typed<E: EventPayload>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event.event_type(), serde_json::to_value(event)?))
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// A pending append of N events to one stream.
///
/// This is the unit the store commits atomically. `expected_version` carries
/// the writer's view of the server-side stream version for optimistic
/// concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamAction {
    pub stream: StreamIdentity,
    pub stream_type: Option<String>,
    pub tenant_id: TenantId,
    pub action_type: StreamActionType,
    pub expected_version: ExpectedVersion,
    pub events: Vec<PendingEvent>,
}

impl StreamAction {
    /// Start a brand new stream; fails on commit if the stream already exists.
    pub fn start(
        tenant_id: TenantId,
        stream: impl Into<StreamIdentity>,
        events: Vec<PendingEvent>,
    ) -> Self {
        Self {
            stream: stream.into(),
            stream_type: None,
            tenant_id,
            action_type: StreamActionType::Start,
            expected_version: ExpectedVersion::NoStream,
            events,
        }
    }

    /// Append to a stream regardless of its current version.
    pub fn append(
        tenant_id: TenantId,
        stream: impl Into<StreamIdentity>,
        events: Vec<PendingEvent>,
    ) -> Self {
        Self {
            stream: stream.into(),
            stream_type: None,
            tenant_id,
            action_type: StreamActionType::Append,
            expected_version: ExpectedVersion::Any,
            events,
        }
    }

    pub fn with_stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = Some(stream_type.into());
        self
    }

    /// Require the stream to be at `version` before this action commits.
    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = ExpectedVersion::Exact(version);
        self
    }
}
