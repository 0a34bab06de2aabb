//! Wall-clock helpers shared by expirations, log timestamps, and caches.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub fn millis_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("incorrect system time")
        .as_millis() as u64
}

/// Seconds since the unix epoch.
pub fn seconds_since_epoch() -> u64 {
    millis_since_epoch() / 1000
}
