//! Injectable time source for lease and heartbeat arithmetic.
//!
//! Every component that evaluates lease expiry or heartbeat staleness reads
//! the current time through the [`Clock`] trait instead of calling
//! [`Utc::now`] directly. Production code uses [`SystemClock`]; tests use
//! [`ManualClock`] and advance it explicitly, which makes timeout state
//! machines fully deterministic to test.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::{StoreError, StoreResult};

/// A source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// System UTC clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// The clock only moves when [`advance`](ManualClock::advance) or
/// [`set`](ManualClock::set) is called.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock pinned at the given instant.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock pinned at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        if let Ok(signed) = chrono::Duration::from_std(delta) {
            if let Some(next) = now.checked_add_signed(signed) {
                *now = next;
            }
        }
    }

    /// Pin the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().expect("clock mutex poisoned") = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

/// Add a standard-library duration to a timestamp, rejecting values that do
/// not fit the timestamp range.
pub(crate) fn add_duration(
    instant: DateTime<Utc>,
    delta: Duration,
    what: &str,
) -> StoreResult<DateTime<Utc>> {
    let signed = chrono::Duration::from_std(delta)
        .map_err(|_| StoreError::InvalidArgument(format!("{what} out of range")))?;
    instant
        .checked_add_signed(signed)
        .ok_or_else(|| StoreError::InvalidArgument(format!("{what} overflows timestamp")))
}
