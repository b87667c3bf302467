//! Time functions that respect the paused tokio clock in tests.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Returns an `Instant` into the moment of function call.
pub fn clock_now() -> Instant {
    Instant::now()
}

/// Returns a `Duration` of time elapsed since the given moment.
pub fn clock_elapsed(since: Instant) -> Duration {
    clock_now() - since
}

/// Wall clock in ms since the unix epoch, used for contact timestamps.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
