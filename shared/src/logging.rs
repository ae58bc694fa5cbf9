//! Shared logging utilities for consistent tracing across the interpreter

use chrono::{DateTime, Utc};
use tracing::info;

/// Log levels accepted by [`init_tracing`]
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Parse a user-supplied log level, ignoring case
pub fn parse_log_level(level: &str) -> Option<&'static str> {
    let lowered = level.trim().to_lowercase();
    LOG_LEVELS.iter().copied().find(|candidate| *candidate == lowered)
}

/// Filter directive covering the interpreter crates at the given level
pub fn filter_directive(level: &str) -> String {
    format!("interpreter={level},shared={level}")
}

/// Initialize a stdout tracing subscriber at the given level
///
/// Safe to call repeatedly; only the first call installs a subscriber.
pub fn init_tracing(log_level: Option<&str>) {
    use tracing_subscriber::{fmt, EnvFilter};

    let base_level = log_level.and_then(parse_log_level).unwrap_or("info");

    let installed = fmt()
        .with_env_filter(EnvFilter::new(filter_directive(base_level)))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .is_ok();

    if installed {
        info!("📊 Log level: {}", base_level);
    }
}

/// Get formatted timestamp for consistent logging
pub fn format_timestamp() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.format("%H:%M:%S%.3f").to_string()
}
