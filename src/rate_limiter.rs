use crate::clock::{ceil_secs, Clock, DAY_MS, MINUTE_MS};
use crate::decision::{BackendFailurePolicy, RateDecision, RateWindowKind, RejectReason};
use crate::error::Result;
use crate::policy::LimitPolicy;
use crate::scope::{KeySpace, ScopeKey};
use crate::store::{CounterStore, WindowAdmission, WindowCheck};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-minute and per-day trailing-window throttle for API-key callers.
///
/// The minute window is evaluated first. A request rejected by either
/// window leaves both untouched; an admitted request is recorded in both.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    on_backend_error: BackendFailurePolicy,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        on_backend_error: BackendFailurePolicy,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            on_backend_error,
        }
    }

    pub fn on_backend_error(&self) -> BackendFailurePolicy {
        self.on_backend_error
    }

    pub async fn check(&self, scope: &ScopeKey, policy: &LimitPolicy) -> Result<RateDecision> {
        let now = self.clock.now_ms();
        let windows = [
            (RateWindowKind::Minute, MINUTE_MS, policy.per_minute),
            (RateWindowKind::Day, DAY_MS, policy.per_day),
        ];
        let checks = [
            WindowCheck {
                key: self.keys.rate_minute(scope),
                window_ms: MINUTE_MS,
                limit: policy.per_minute,
            },
            WindowCheck {
                key: self.keys.rate_day(scope),
                window_ms: DAY_MS,
                limit: policy.per_day,
            },
        ];

        match self.store.admit_event(&checks, now).await {
            Ok(WindowAdmission::Admitted { counts }) => {
                let minute_count = counts.first().copied().unwrap_or(1);
                Ok(RateDecision {
                    allowed: true,
                    limit: policy.per_minute,
                    remaining: policy.per_minute.saturating_sub(minute_count),
                    reset_at: ceil_secs(now + MINUTE_MS),
                    retry_after: None,
                    window: None,
                    reason: None,
                    degraded: false,
                })
            }
            Ok(WindowAdmission::Rejected {
                window,
                count,
                oldest_ms,
            }) => {
                let (kind, window_ms, limit) =
                    windows.get(window).copied().unwrap_or(windows[0]);
                let reset_at_ms = oldest_ms + window_ms;
                debug!(scope = %scope, window = ?kind, count, limit, "rate limit exceeded");

                Ok(RateDecision {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_at: ceil_secs(reset_at_ms),
                    retry_after: Some(ceil_secs(reset_at_ms.saturating_sub(now)).max(1)),
                    window: Some(kind),
                    reason: Some(RejectReason::RateLimited),
                    degraded: false,
                })
            }
            Err(e) if e.is_backend_unavailable() => {
                warn!(
                    scope = %scope,
                    policy = self.on_backend_error.as_str(),
                    error = %e,
                    "rate limit backend unavailable, applying failure policy"
                );
                let allowed = self.on_backend_error == BackendFailurePolicy::Open;
                Ok(RateDecision {
                    allowed,
                    limit: policy.per_minute,
                    remaining: if allowed { policy.per_minute } else { 0 },
                    reset_at: ceil_secs(now + MINUTE_MS),
                    retry_after: (!allowed).then_some(MINUTE_MS / 1000),
                    window: None,
                    reason: (!allowed).then_some(RejectReason::BackendUnavailable),
                    degraded: true,
                })
            }
            Err(e) => Err(e),
        }
    }
}
