//! Tracing and logging setup shared by daemon hosts and tests.

/// Initialize process-wide logging with the format named by `SKEIN_LOG_FORMAT`
/// (JSON when unset or unrecognised).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let format = std::env::var("SKEIN_LOG_FORMAT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    tracing::init_with(format);
}

pub use self::tracing::{LogFormat, ParseLogFormatError, init_for_tests, init_with};

/// Tracing configuration (filters, layers).
pub mod tracing;
