//! Adjusted-time source consumed by the index store.

use std::time::{SystemTime, UNIX_EPOCH};

/// Network-adjusted current time, in seconds since the epoch. The
/// adjustment itself (peer offset sampling) lives outside this crate.
pub trait TimeSource {
    fn adjusted_time(&self) -> i64;
}

/// Wall clock without any peer adjustment.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn adjusted_time(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Fixed time source for tests and replay tooling.
#[derive(Clone, Copy, Debug)]
pub struct FixedTimeSource(pub i64);

impl TimeSource for FixedTimeSource {
    fn adjusted_time(&self) -> i64 {
        self.0
    }
}
