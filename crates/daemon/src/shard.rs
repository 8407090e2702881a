//! Shard identity, shard progress states and shard definitions.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skein_core::DomainError;

use crate::store::EventFilter;

/// Identity of one independently-progressing unit of a projection.
///
/// The textual identity doubles as the registry key and the persisted progress
/// row key:
///
/// - `Name` for version 1 with the default key
/// - `Name:Key` for version 1 with any other key
/// - `Name:V{n}:Key` for version `n > 1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardName {
    projection: String,
    key: String,
    version: u32,
    identity: String,
}

impl ShardName {
    /// Default shard key.
    pub const ALL: &'static str = "All";

    /// Reserved name under which the high-water mark is published.
    pub const HIGH_WATER_MARK: &'static str = "HighWaterMark";

    pub fn new(projection: impl Into<String>) -> Result<Self, DomainError> {
        Self::versioned(projection, 1, Self::ALL)
    }

    pub fn with_key(projection: impl Into<String>, key: impl Into<String>) -> Result<Self, DomainError> {
        Self::versioned(projection, 1, key)
    }

    /// Neither part may be blank or contain `:`, so every identity maps back
    /// to exactly one shard.
    pub fn versioned(
        projection: impl Into<String>,
        version: u32,
        key: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let projection = projection.into();
        let key = key.into();
        for (part, value) in [("projection", &projection), ("key", &key)] {
            if value.trim().is_empty() || value.contains(':') {
                return Err(DomainError::invalid_id(format!(
                    "ShardName: {part} '{value}' must be non-empty and must not contain ':'"
                )));
            }
        }
        Ok(Self::from_parts(projection, version, key))
    }

    fn from_parts(projection: String, version: u32, key: String) -> Self {
        let version = version.max(1);
        let identity = if version > 1 {
            format!("{projection}:V{version}:{key}")
        } else if key == Self::ALL {
            projection.clone()
        } else {
            format!("{projection}:{key}")
        };

        Self {
            projection,
            key,
            version,
            identity,
        }
    }

    pub fn high_water_mark() -> Self {
        Self::from_parts(Self::HIGH_WATER_MARK.to_string(), 1, Self::ALL.to_string())
    }

    pub fn is_high_water_mark(&self) -> bool {
        self.projection == Self::HIGH_WATER_MARK
    }

    pub fn projection_name(&self) -> &str {
        &self.projection
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

impl FromStr for ShardName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(DomainError::invalid_id(format!("ShardName: '{s}'")));
        }

        match parts.as_slice() {
            [name] => Self::new(*name),
            [name, key] => Self::with_key(*name, *key),
            [name, version, key] => {
                let version = version
                    .strip_prefix('V')
                    .and_then(|v| v.parse::<u32>().ok())
                    .filter(|v| *v > 1)
                    .ok_or_else(|| DomainError::invalid_id(format!("ShardName: bad version in '{s}'")))?;
                Self::versioned(*name, version, *key)
            }
            _ => Err(DomainError::invalid_id(format!("ShardName: '{s}'"))),
        }
    }
}

impl TryFrom<String> for ShardName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ShardName> for String {
    fn from(value: ShardName) -> Self {
        value.identity
    }
}

/// What happened to a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardAction {
    Started,
    Updated,
    Paused,
    Stopped,
}

/// A broadcast progress notification. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub shard: ShardName,
    pub sequence: u64,
    pub action: ShardAction,
    pub timestamp: DateTime<Utc>,
}

impl ShardState {
    pub fn new(shard: ShardName, sequence: u64, action: ShardAction) -> Self {
        Self {
            shard,
            sequence,
            action,
            timestamp: Utc::now(),
        }
    }

    pub fn updated(shard: ShardName, sequence: u64) -> Self {
        Self::new(shard, sequence, ShardAction::Updated)
    }

    pub fn high_water(sequence: u64) -> Self {
        Self::new(ShardName::high_water_mark(), sequence, ShardAction::Updated)
    }

    pub fn is_high_water(&self) -> bool {
        self.shard.is_high_water_mark()
    }
}

/// Whether a shard follows the live log or replays to a fixed ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardExecutionMode {
    Continuous,
    Rebuild,
}

/// Definition of one shard of a projection.
#[derive(Debug, Clone)]
pub struct AsyncShard {
    pub name: ShardName,
    pub filter: EventFilter,
    /// Overrides the daemon-wide page size when set.
    pub batch_size: Option<usize>,
}

impl AsyncShard {
    pub fn new(name: ShardName, filter: EventFilter) -> Self {
        Self {
            name,
            filter,
            batch_size: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }
}
