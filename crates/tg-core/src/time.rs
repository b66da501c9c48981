//! Wall-clock helpers shared by the gateway crates

use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
///
/// # Examples
/// ```
/// use tg_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whole seconds between two millisecond timestamps; 0 if `then` is later
pub fn secs_between(then: u64, now: u64) -> u64 {
    now.saturating_sub(then) / 1000
}
