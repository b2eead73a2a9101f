use super::{CounterDecision, CounterStore, LocalStore, WindowAdmission, WindowCheck};
use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Routes every operation to a distributed store and falls back to a
/// local one while the distributed store reports `BackendUnavailable`.
///
/// During an outage each instance enforces its own limits; local counts are
/// not merged back once the distributed store recovers.
pub struct FailoverStore {
    primary: Arc<dyn CounterStore>,
    fallback: Arc<LocalStore>,
    degraded: AtomicBool,
}

impl FailoverStore {
    pub fn new(primary: Arc<dyn CounterStore>, fallback: Arc<LocalStore>) -> Self {
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
        }
    }

    async fn route<T>(
        &self,
        op: &'static str,
        primary: impl Future<Output = Result<T>> + Send,
        fallback: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match primary.await {
            Ok(value) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!(
                        store = self.primary.name(),
                        "distributed counter store recovered"
                    );
                }
                Ok(value)
            }
            Err(e) if e.is_backend_unavailable() => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!(
                        store = self.primary.name(),
                        op,
                        error = %e,
                        "distributed counter store unavailable, enforcing per-instance limits"
                    );
                }
                fallback.await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CounterStore for FailoverStore {
    fn name(&self) -> &'static str {
        "failover"
    }

    async fn open(&self) -> Result<()> {
        self.fallback.open().await?;
        if let Err(e) = self.primary.open().await {
            if !e.is_backend_unavailable() {
                return Err(e);
            }
            self.degraded.store(true, Ordering::SeqCst);
            warn!(error = %e, "starting in degraded mode: distributed counter store unreachable");
        }
        Ok(())
    }

    async fn close(&self) {
        self.primary.close().await;
        self.fallback.close().await;
    }

    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterDecision> {
        self.route(
            "check_and_increment",
            self.primary.check_and_increment(key, limit, ttl),
            self.fallback.check_and_increment(key, limit, ttl),
        )
        .await
    }

    async fn record_event(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64> {
        self.route(
            "record_event",
            self.primary.record_event(key, now_ms, window),
            self.fallback.record_event(key, now_ms, window),
        )
        .await
    }

    async fn admit_event(&self, checks: &[WindowCheck], now_ms: u64) -> Result<WindowAdmission> {
        self.route(
            "admit_event",
            self.primary.admit_event(checks, now_ms),
            self.fallback.admit_event(checks, now_ms),
        )
        .await
    }

    async fn count_events(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64> {
        self.route(
            "count_events",
            self.primary.count_events(key, now_ms, window),
            self.fallback.count_events(key, now_ms, window),
        )
        .await
    }

    async fn peek(&self, key: &str) -> Result<u64> {
        self.route("peek", self.primary.peek(key), self.fallback.peek(key))
            .await
    }

    async fn evict_expired(&self) -> Result<usize> {
        self.fallback.evict_expired().await
    }

    async fn ping(&self) -> Result<()> {
        self.primary.ping().await
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}
