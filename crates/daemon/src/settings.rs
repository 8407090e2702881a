//! Daemon configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use skein_core::DomainError;

use crate::retry::RetryPolicy;

/// How the build stage reacts to a per-event apply failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandlingOptions {
    /// Dead-letter the failing event and keep going instead of failing the shard.
    pub skip_apply_errors: bool,
}

impl ErrorHandlingOptions {
    pub fn strict() -> Self {
        Self {
            skip_apply_errors: false,
        }
    }

    pub fn skip_apply_errors() -> Self {
        Self {
            skip_apply_errors: true,
        }
    }
}

/// Tunables for the async daemon and everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// How often the high-water agent polls the store.
    #[serde(with = "duration_ms")]
    pub high_water_polling: Duration,
    /// How long a sequence gap may hold the high-water mark back before it is skipped.
    #[serde(with = "duration_ms")]
    pub stale_sequence_threshold: Duration,
    /// Events per page fetched by the loader.
    pub batch_size: usize,
    /// Items in flight between pipeline stages.
    pub pipeline_capacity: usize,
    /// Grace period for `stop_and_drain`.
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,
    /// Bound on a single agent start.
    #[serde(with = "duration_ms")]
    pub agent_start_timeout: Duration,
    /// Capacity of the dead-letter queue.
    pub dead_letter_capacity: usize,
    pub dead_letter_retry: RetryPolicy,
    /// Retries for page loads before the shard is reported as failed.
    pub load_retry: RetryPolicy,
    pub continuous_errors: ErrorHandlingOptions,
    pub rebuild_errors: ErrorHandlingOptions,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            high_water_polling: Duration::from_secs(1),
            stale_sequence_threshold: Duration::from_secs(3),
            batch_size: 500,
            pipeline_capacity: 1,
            drain_timeout: Duration::from_secs(5),
            agent_start_timeout: Duration::from_secs(10),
            dead_letter_capacity: 100,
            dead_letter_retry: RetryPolicy::default(),
            load_retry: RetryPolicy::default(),
            continuous_errors: ErrorHandlingOptions::skip_apply_errors(),
            rebuild_errors: ErrorHandlingOptions::strict(),
        }
    }
}

impl DaemonSettings {
    /// Defaults overridden by `SKEIN_*` environment variables.
    pub fn from_env() -> Result<Self, DomainError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `SKEIN_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DomainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(ms) = parse::<u64, _>(&lookup, "SKEIN_HIGH_WATER_POLLING_MS")? {
            settings.high_water_polling = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SKEIN_STALE_SEQUENCE_THRESHOLD_MS")? {
            settings.stale_sequence_threshold = Duration::from_millis(ms);
        }
        if let Some(size) = parse::<usize, _>(&lookup, "SKEIN_BATCH_SIZE")? {
            if size == 0 {
                return Err(DomainError::validation("SKEIN_BATCH_SIZE must be positive"));
            }
            settings.batch_size = size;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SKEIN_DRAIN_TIMEOUT_MS")? {
            settings.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SKEIN_AGENT_START_TIMEOUT_MS")? {
            settings.agent_start_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse::<usize, _>(&lookup, "SKEIN_DEAD_LETTER_CAPACITY")? {
            settings.dead_letter_capacity = capacity.max(1);
        }
        if let Some(skip) = parse::<bool, _>(&lookup, "SKEIN_SKIP_APPLY_ERRORS")? {
            settings.continuous_errors.skip_apply_errors = skip;
        }

        Ok(settings)
    }

    pub fn with_high_water_polling(mut self, interval: Duration) -> Self {
        self.high_water_polling = interval;
        self
    }

    pub fn with_stale_sequence_threshold(mut self, threshold: Duration) -> Self {
        self.stale_sequence_threshold = threshold;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_continuous_errors(mut self, options: ErrorHandlingOptions) -> Self {
        self.continuous_errors = options;
        self
    }

    pub fn with_rebuild_errors(mut self, options: ErrorHandlingOptions) -> Self {
        self.rebuild_errors = options;
        self
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, DomainError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| DomainError::validation(format!("{key}={raw}: {e}"))),
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
