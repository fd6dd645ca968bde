//! Run timestamp shared by every test module of one run.
//!
//! The runner exports `TEST_TIMESTAMP` before spawning the test harness so
//! that all modules write their reports under the same directory.

use std::sync::OnceLock;

use chrono::Local;

/// Environment variable carrying the run timestamp.
pub const TIMESTAMP_ENV: &str = "TEST_TIMESTAMP";

/// Format of the run timestamp, e.g. `2024-05-01-14_03_59`.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H_%M_%S";

static RUN_TIMESTAMP: OnceLock<String> = OnceLock::new();

/// Returns the process-wide run timestamp.
///
/// Taken from `TEST_TIMESTAMP` when set, otherwise generated on first call.
/// Every later call returns the same value.
pub fn run_timestamp() -> &'static str {
    RUN_TIMESTAMP.get_or_init(|| {
        std::env::var(TIMESTAMP_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(new_run_timestamp)
    })
}

/// Formats the current local time as a run timestamp.
pub fn new_run_timestamp() -> String {
    Local::now().format(RUN_TIMESTAMP_FORMAT).to_string()
}

/// `TEST_TIMESTAMP` as set by the runner, if any.
pub fn env_timestamp() -> Option<String> {
    std::env::var(TIMESTAMP_ENV).ok().filter(|v| !v.is_empty())
}

/// Compact timestamp used in temporary file names (`20240501_140359`).
pub fn export_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}
