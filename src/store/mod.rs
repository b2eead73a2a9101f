//! Counter backends.
//!
//! Enforcers talk to a [`CounterStore`] and never to Redis or a map
//! directly. Two implementations exist:
//!
//! - [`RedisStore`]: every operation is a single server-side Lua script, so
//!   the compare and the mutation happen in one round trip and are atomic
//!   across service instances.
//! - [`LocalStore`]: in-process maps. Each operation runs its whole
//!   check-and-mutate sequence inside one lock scope with no `.await` in
//!   between.
//!
//! [`FailoverStore`] composes the two so an instance keeps enforcing
//! per-instance limits while Redis is unreachable.

mod failover;
mod janitor;
mod memory;
mod redis;
mod scripts;

pub use self::failover::FailoverStore;
pub use self::janitor::{Janitor, SweepStats};
pub use self::memory::LocalStore;
pub use self::redis::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Outcome of [`CounterStore::check_and_increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterDecision {
    pub allowed: bool,
    /// Counter value after the operation. Unchanged when not allowed.
    pub count: u64,
}

/// One trailing window to evaluate in [`CounterStore::admit_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCheck {
    pub key: String,
    pub window_ms: u64,
    pub limit: u64,
}

impl WindowCheck {
    pub fn new(key: impl Into<String>, window: Duration, limit: u64) -> Self {
        Self {
            key: key.into(),
            window_ms: window.as_millis() as u64,
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowAdmission {
    /// The event was recorded into every window. `counts[i]` is the size of
    /// window `i` after recording.
    Admitted { counts: Vec<u64> },
    /// Window `window` was full. Nothing was recorded anywhere.
    Rejected {
        window: usize,
        count: u64,
        oldest_ms: u64,
    },
}

/// Uniform atomic counter operations.
///
/// Sliding-window timestamps are kept iff `ts > now_ms - window_ms`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts background work owned by the store.
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Stops background work and releases connections.
    async fn close(&self) {}

    /// If the counter at `key` is below `limit`, increments it and reports
    /// `allowed`; otherwise reports not-allowed without mutating. A freshly
    /// created counter expires after `ttl`.
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterDecision>;

    /// Appends `now_ms` to the window at `key`, prunes entries outside
    /// `window`, and returns the resulting count.
    async fn record_event(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64>;

    /// Evaluates `windows` in order. The first window whose pruned length is
    /// at or above its limit rejects the event; otherwise `now_ms` is
    /// recorded into all of them.
    async fn admit_event(&self, windows: &[WindowCheck], now_ms: u64) -> Result<WindowAdmission>;

    /// Number of entries at `key` inside the trailing `window`. Never mutates.
    async fn count_events(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64>;

    /// Current fixed-window counter value, or 0. Never mutates.
    async fn peek(&self, key: &str) -> Result<u64>;

    /// Removes fully expired entries. Backends with native expiry return 0.
    async fn evict_expired(&self) -> Result<usize> {
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// True while requests are being served by a fallback.
    fn is_degraded(&self) -> bool {
        false
    }
}
