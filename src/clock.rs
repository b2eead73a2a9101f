//! Time source for all counters.
//!
//! Every component reads "now" through a [`Clock`] so tests can drive window
//! boundaries deterministically with a [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MINUTE_MS: u64 = 60_000;
pub const DAY_MS: u64 = 86_400_000;

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

fn to_datetime(now_ms: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(now_ms as i64).unwrap_or_default()
}

/// Calendar day (UTC) containing `now_ms`, formatted `YYYY-MM-DD`.
pub fn utc_day(now_ms: u64) -> String {
    to_datetime(now_ms).format("%Y-%m-%d").to_string()
}

/// Epoch milliseconds of the first UTC midnight strictly after `now_ms`.
pub fn next_utc_midnight_ms(now_ms: u64) -> u64 {
    let next_day = to_datetime(now_ms).date_naive() + ChronoDuration::days(1);
    next_day
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc().timestamp_millis() as u64)
        .unwrap_or(now_ms + DAY_MS - now_ms % DAY_MS)
}

pub fn ms_until_next_utc_midnight(now_ms: u64) -> u64 {
    next_utc_midnight_ms(now_ms) - now_ms
}

/// Rounds a millisecond instant up to whole epoch seconds.
pub fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}
