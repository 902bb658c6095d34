//! Time source injected into stores and the scheduler

use chrono::{DateTime, Utc};

/// Source of "now". Tests swap in [`crate::testing::ManualClock`] to drive
/// TTL expiry and sweep scheduling deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
