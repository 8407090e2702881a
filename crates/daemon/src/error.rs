//! Daemon error model.
//!
//! Failures are classified by blast radius: an [`ApplyError`] concerns one
//! event, a [`GroupingError`] or a failed batch concerns one shard, and a
//! [`RebuildFailure`] aggregates every shard that failed during a parallel
//! rebuild.

use std::time::Duration;

use thiserror::Error;

use skein_core::DomainError;
use skein_events::Event;

use crate::store::StoreError;

/// A slicer, identity lookup or enrichment hook failed.
///
/// Grouping failures indicate a programming or configuration defect, so the
/// pipeline never retries them.
#[derive(Debug, Clone, Error)]
pub enum GroupingError {
    #[error("identity lookup failed: {0}")]
    Lookup(String),

    #[error("slice enrichment failed: {0}")]
    Enrichment(String),

    #[error("grouping failed: {0}")]
    Other(String),
}

/// Applying a single event to its slice failed.
#[derive(Debug, Clone, Error)]
#[error("failed to apply {} at sequence {}: {message}", .event.event_type, .event.sequence)]
pub struct ApplyError {
    pub event: Box<Event>,
    pub message: String,
}

impl ApplyError {
    pub fn new(event: &Event, message: impl Into<String>) -> Self {
        Self {
            event: Box::new(event.clone()),
            message: message.into(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.event.sequence
    }
}

/// Every shard that failed during a rebuild, reported together.
#[derive(Debug, Clone, Error)]
#[error("rebuild of '{projection}' failed for {} shard(s): {}", .failures.len(), describe(.failures))]
pub struct RebuildFailure {
    pub projection: String,
    /// `(shard identity, reason)` pairs.
    pub failures: Vec<(String, String)>,
}

fn describe(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(shard, reason)| format!("{shard}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level daemon error.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("grouping failed for shard '{shard}': {source}")]
    Grouping {
        shard: String,
        #[source]
        source: GroupingError,
    },

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("unknown shard: {0}")]
    UnknownShard(String),

    #[error("unknown projection: {0}")]
    UnknownProjection(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("shard '{shard}' failed: {reason}")]
    ShardFailed { shard: String, reason: String },

    #[error(transparent)]
    Rebuild(#[from] RebuildFailure),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl DaemonError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_failure_lists_every_shard() {
        let failure = RebuildFailure {
            projection: "Orders".into(),
            failures: vec![
                ("Orders:A".into(), "boom".into()),
                ("Orders:B".into(), "bang".into()),
            ],
        };
        let text = failure.to_string();
        assert!(text.contains("2 shard(s)"));
        assert!(text.contains("Orders:A: boom"));
        assert!(text.contains("Orders:B: bang"));
    }
}
