use super::janitor::{self, Janitor};
use super::{CounterDecision, CounterStore, WindowAdmission, WindowCheck};
use crate::clock::Clock;
use crate::error::{QuotaError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Mutex;

/// Fixed-window counter. `count` only grows until `expires_at_ms`.
#[derive(Debug, Clone)]
pub(super) struct Counter {
    pub count: u64,
    pub limit: u64,
    pub expires_at_ms: u64,
}

/// Admitted-event instants for one trailing window, oldest first.
#[derive(Debug, Clone, Default)]
pub(super) struct RateWindow {
    pub timestamps: VecDeque<u64>,
    pub window_ms: u64,
}

impl RateWindow {
    pub fn prune(&mut self, now_ms: u64) {
        // Within one window of the epoch nothing is stale yet.
        let Some(cutoff) = now_ms.checked_sub(self.window_ms) else {
            return;
        };
        while self.timestamps.front().is_some_and(|&ts| ts <= cutoff) {
            self.timestamps.pop_front();
        }
    }
}

/// Maps shared by all request contexts in one process and by the janitor.
pub(super) struct LocalState {
    pub clock: Arc<dyn Clock>,
    pub counters: RwLock<HashMap<String, Counter>>,
    pub windows: RwLock<HashMap<String, RateWindow>>,
}

impl LocalState {
    pub fn counters_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Counter>>> {
        self.counters.write().map_err(|_| {
            QuotaError::Internal("Failed to acquire write lock on counters".to_string())
        })
    }

    pub fn windows_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, RateWindow>>> {
        self.windows.write().map_err(|_| {
            QuotaError::Internal("Failed to acquire write lock on windows".to_string())
        })
    }
}

/// In-process counter store.
///
/// Owns a [`Janitor`] between [`open`](CounterStore::open) and
/// [`close`](CounterStore::close). Limits enforced here are per-instance.
pub struct LocalStore {
    state: Arc<LocalState>,
    janitor_interval: Duration,
    janitor: Mutex<Option<Janitor>>,
}

impl LocalStore {
    pub fn new(clock: Arc<dyn Clock>, janitor_interval: Duration) -> Self {
        Self {
            state: Arc::new(LocalState {
                clock,
                counters: RwLock::new(HashMap::new()),
                windows: RwLock::new(HashMap::new()),
            }),
            janitor_interval,
            janitor: Mutex::new(None),
        }
    }

    /// Number of live fixed-window counters and sliding windows.
    pub fn len(&self) -> Result<(usize, usize)> {
        let counters = self.state.counters_mut()?.len();
        let windows = self.state.windows_mut()?.len();
        Ok((counters, windows))
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|(c, w)| c == 0 && w == 0)
    }

    pub async fn janitor_running(&self) -> bool {
        self.janitor.lock().await.is_some()
    }
}

#[async_trait]
impl CounterStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn open(&self) -> Result<()> {
        let mut slot = self.janitor.lock().await;
        if slot.is_none() {
            *slot = Some(Janitor::spawn(Arc::clone(&self.state), self.janitor_interval));
        }
        Ok(())
    }

    async fn close(&self) {
        let janitor = self.janitor.lock().await.take();
        if let Some(janitor) = janitor {
            janitor.stop().await;
        }
    }

    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterDecision> {
        let now = self.state.clock.now_ms();
        let mut counters = self.state.counters_mut()?;

        let counter = counters.entry(key.to_string()).or_insert_with(|| Counter {
            count: 0,
            limit,
            expires_at_ms: now + ttl.as_millis() as u64,
        });

        // Lazy rollover: the first access after expiry starts a new window.
        if now >= counter.expires_at_ms {
            counter.count = 0;
            counter.expires_at_ms = now + ttl.as_millis() as u64;
        }
        counter.limit = limit;

        if counter.count >= counter.limit {
            return Ok(CounterDecision {
                allowed: false,
                count: counter.count,
            });
        }

        counter.count += 1;
        Ok(CounterDecision {
            allowed: true,
            count: counter.count,
        })
    }

    async fn record_event(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64> {
        let mut windows = self.state.windows_mut()?;
        let entry = windows.entry(key.to_string()).or_default();
        entry.window_ms = window.as_millis() as u64;
        entry.timestamps.push_back(now_ms);
        entry.prune(now_ms);
        Ok(entry.timestamps.len() as u64)
    }

    async fn admit_event(&self, checks: &[WindowCheck], now_ms: u64) -> Result<WindowAdmission> {
        let mut windows = self.state.windows_mut()?;

        for (index, check) in checks.iter().enumerate() {
            let Some(window) = windows.get_mut(&check.key) else {
                if check.limit == 0 {
                    return Ok(WindowAdmission::Rejected {
                        window: index,
                        count: 0,
                        oldest_ms: now_ms,
                    });
                }
                continue;
            };
            window.window_ms = check.window_ms;
            window.prune(now_ms);

            let count = window.timestamps.len() as u64;
            if count >= check.limit {
                return Ok(WindowAdmission::Rejected {
                    window: index,
                    count,
                    oldest_ms: window.timestamps.front().copied().unwrap_or(now_ms),
                });
            }
        }

        let mut counts = Vec::with_capacity(checks.len());
        for check in checks {
            let window = windows.entry(check.key.clone()).or_insert_with(|| RateWindow {
                timestamps: VecDeque::new(),
                window_ms: check.window_ms,
            });
            window.timestamps.push_back(now_ms);
            counts.push(window.timestamps.len() as u64);
        }

        Ok(WindowAdmission::Admitted { counts })
    }

    async fn count_events(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64> {
        let windows = self.state.windows.read().map_err(|_| {
            QuotaError::Internal("Failed to acquire read lock on windows".to_string())
        })?;

        let Some(entry) = windows.get(key) else {
            return Ok(0);
        };
        let cutoff = now_ms.checked_sub(window.as_millis() as u64);
        Ok(entry
            .timestamps
            .iter()
            .filter(|&&ts| cutoff.map_or(true, |cutoff| ts > cutoff))
            .count() as u64)
    }

    async fn peek(&self, key: &str) -> Result<u64> {
        let now = self.state.clock.now_ms();
        let counters = self.state.counters.read().map_err(|_| {
            QuotaError::Internal("Failed to acquire read lock on counters".to_string())
        })?;

        Ok(match counters.get(key) {
            Some(counter) if now < counter.expires_at_ms => counter.count,
            _ => 0,
        })
    }

    async fn evict_expired(&self) -> Result<usize> {
        janitor::sweep(&self.state).map(|stats| stats.total())
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.get_mut().take() {
            janitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(start_ms: u64) -> (LocalStore, ManualClock) {
        let clock = ManualClock::new(start_ms);
        let store = LocalStore::new(Arc::new(clock.clone()), Duration::from_secs(60));
        (store, clock)
    }

    #[tokio::test]
    async fn test_counts_up_to_limit_then_rejects() {
        let (store, _) = store_at(0);
        let ttl = Duration::from_secs(60);

        for expected in 1..=3 {
            let decision = store.check_and_increment("k", 3, ttl).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.count, expected);
        }

        let decision = store.check_and_increment("k", 3, ttl).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.count, 3);
        assert_eq!(store.peek("k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_counter_resets_lazily_after_expiry() {
        let (store, clock) = store_at(0);
        let ttl = Duration::from_millis(1_000);

        store.check_and_increment("k", 1, ttl).await.unwrap();
        assert!(!store.check_and_increment("k", 1, ttl).await.unwrap().allowed);

        clock.set(1_000);
        assert_eq!(store.peek("k").await.unwrap(), 0);
        let decision = store.check_and_increment("k", 1, ttl).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.count, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_create_or_mutate() {
        let (store, _) = store_at(0);
        assert_eq!(store.peek("missing").await.unwrap(), 0);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_record_event_prunes_old_entries() {
        let (store, _) = store_at(0);
        let window = Duration::from_millis(10_000);

        for t in 0..5 {
            assert_eq!(store.record_event("w", t * 1_000, window).await.unwrap(), t + 1);
        }
        // Entries at 0 and 1000 fall out of (1000, 11000].
        assert_eq!(store.record_event("w", 11_000, window).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_entry_at_epoch_is_kept_within_first_window() {
        let (store, _) = store_at(0);
        let window = Duration::from_millis(10_000);

        assert_eq!(store.record_event("w", 0, window).await.unwrap(), 1);
        assert_eq!(store.record_event("w", 5_000, window).await.unwrap(), 2);
        assert_eq!(store.count_events("w", 9_999, window).await.unwrap(), 2);
        // (0, 10000] no longer holds the entry at 0.
        assert_eq!(store.count_events("w", 10_000, window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_events_is_read_only() {
        let (store, _) = store_at(0);
        let window = Duration::from_secs(10);

        assert_eq!(store.count_events("w", 1_000, window).await.unwrap(), 0);
        assert!(store.is_empty().unwrap());

        store.record_event("w", 1_000, window).await.unwrap();
        store.record_event("w", 2_000, window).await.unwrap();
        assert_eq!(store.count_events("w", 11_500, window).await.unwrap(), 1);
        assert_eq!(store.count_events("w", 3_000, window).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_admit_event_rejection_has_no_side_effects() {
        let (store, _) = store_at(0);
        let checks = vec![
            WindowCheck::new("minute", Duration::from_secs(60), 2),
            WindowCheck::new("day", Duration::from_secs(86_400), 10),
        ];

        assert_eq!(
            store.admit_event(&checks, 0).await.unwrap(),
            WindowAdmission::Admitted { counts: vec![1, 1] }
        );
        assert_eq!(
            store.admit_event(&checks, 10).await.unwrap(),
            WindowAdmission::Admitted { counts: vec![2, 2] }
        );
        assert_eq!(
            store.admit_event(&checks, 20).await.unwrap(),
            WindowAdmission::Rejected { window: 0, count: 2, oldest_ms: 0 }
        );

        // The day window was not charged for the rejected event.
        let after_minute = 60_010;
        assert_eq!(
            store.admit_event(&checks, after_minute).await.unwrap(),
            WindowAdmission::Admitted { counts: vec![1, 3] }
        );
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_exceed_limit() {
        let (store, _) = store_at(0);
        let store = Arc::new(store);
        let mut handles = Vec::new();

        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .check_and_increment("shared", 20, Duration::from_secs(60))
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
        assert_eq!(store.peek("shared").await.unwrap(), 20);
    }
}
