//! Time utilities
//!
//! All peer timers are whole seconds since the Unix epoch, matching the
//! resolution the inactivity rules and detection windows are expressed in.

use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Get current Unix timestamp (seconds since epoch)
///
/// Returns 0 if system time is before epoch (should never happen).
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| {
            warn!("System time is before UNIX epoch, using 0 as timestamp");
            std::time::Duration::from_secs(0)
        })
        .as_secs()
}

/// Seconds elapsed between `then` and `now`, saturating at zero when the
/// clock stepped backwards.
pub fn seconds_since(then: u64, now: u64) -> u64 {
    now.saturating_sub(then)
}
