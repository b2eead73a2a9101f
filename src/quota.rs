//! Daily message quotas.
//!
//! One counter per scope and UTC calendar day. The counter key carries the
//! date, so rollover at midnight starts a fresh counter and the previous
//! day's key expires on its own.

use crate::clock::{ms_until_next_utc_midnight, next_utc_midnight_ms, Clock};
use crate::decision::{BackendFailurePolicy, QuotaDecision, RejectReason, UsageSnapshot};
use crate::error::Result;
use crate::policy::LimitPolicy;
use crate::scope::{KeySpace, ScopeKey};
use crate::store::CounterStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct FixedWindowQuota {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    on_backend_error: BackendFailurePolicy,
}

impl FixedWindowQuota {
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

    /// Consumes one unit of the scope's daily quota if any is left.
    ///
    /// Exempt callers short-circuit without touching a counter.
    pub async fn check(
        &self,
        scope: &ScopeKey,
        policy: &LimitPolicy,
        exempt: bool,
    ) -> Result<QuotaDecision> {
        let now = self.clock.now_ms();
        let reset_at = next_utc_midnight_ms(now);

        if exempt || policy.exempt {
            return Ok(QuotaDecision::unlimited(reset_at));
        }

        let limit = policy.daily_message_limit;
        let key = self.keys.quota(scope, now);
        let ttl = Duration::from_millis(ms_until_next_utc_midnight(now));

        match self.store.check_and_increment(&key, limit, ttl).await {
            Ok(counter) => {
                if !counter.allowed {
                    debug!(scope = %scope, limit, "daily quota exhausted");
                }
                Ok(QuotaDecision {
                    allowed: counter.allowed,
                    remaining: Some(limit.saturating_sub(counter.count)),
                    limit: Some(limit),
                    reset_at,
                    reason: (!counter.allowed).then_some(RejectReason::QuotaExceeded),
                    degraded: false,
                })
            }
            Err(e) if e.is_backend_unavailable() => {
                warn!(
                    scope = %scope,
                    policy = self.on_backend_error.as_str(),
                    error = %e,
                    "quota backend unavailable, applying failure policy"
                );
                let allowed = self.on_backend_error == BackendFailurePolicy::Open;
                Ok(QuotaDecision {
                    allowed,
                    remaining: Some(if allowed { limit } else { 0 }),
                    limit: Some(limit),
                    reset_at,
                    reason: (!allowed).then_some(RejectReason::BackendUnavailable),
                    degraded: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Current usage for display. Never increments; reports zero usage when
    /// the backend cannot be read.
    pub async fn peek_usage(
        &self,
        scope: &ScopeKey,
        policy: &LimitPolicy,
    ) -> Result<UsageSnapshot> {
        let now = self.clock.now_ms();
        let reset_at = next_utc_midnight_ms(now);

        if policy.exempt {
            return Ok(UsageSnapshot {
                used: 0,
                limit: None,
                remaining: None,
                reset_at,
            });
        }

        let limit = policy.daily_message_limit;
        let used = match self.store.peek(&self.keys.quota(scope, now)).await {
            Ok(used) => used,
            Err(e) if e.is_backend_unavailable() => {
                warn!(scope = %scope, error = %e, "usage unavailable, reporting zero");
                0
            }
            Err(e) => return Err(e),
        };

        Ok(UsageSnapshot {
            used,
            limit: Some(limit),
            remaining: Some(limit.saturating_sub(used)),
            reset_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, DAY_MS};
    use crate::store::LocalStore;

    const OCT_19: u64 = 1_792_368_000_000;

    fn quota_with_limit(limit: u64) -> (FixedWindowQuota, ManualClock, LimitPolicy) {
        let clock = ManualClock::new(OCT_19 + 3_600_000);
        let store = Arc::new(LocalStore::new(Arc::new(clock.clone()), Duration::from_secs(60)));
        let quota = FixedWindowQuota::new(
            store,
            Arc::new(clock.clone()),
            KeySpace::default(),
            BackendFailurePolicy::Open,
        );
        let policy = LimitPolicy {
            daily_message_limit: limit,
            ..LimitPolicy::free()
        };
        (quota, clock, policy)
    }

    #[tokio::test]
    async fn test_limit_plus_one_is_rejected() {
        let (quota, _, policy) = quota_with_limit(3);
        let scope = ScopeKey::agent("a1");

        for expected_remaining in [2, 1, 0] {
            let decision = quota.check(&scope, &policy, false).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, Some(expected_remaining));
        }

        let decision = quota.check(&scope, &policy, false).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, Some(0));
        assert_eq!(decision.reason, Some(RejectReason::QuotaExceeded));
        assert_eq!(decision.reset_at, OCT_19 + DAY_MS);
    }

    #[tokio::test]
    async fn test_rollover_at_midnight_starts_fresh() {
        let (quota, clock, policy) = quota_with_limit(2);
        let scope = ScopeKey::agent("a1");

        quota.check(&scope, &policy, false).await.unwrap();
        quota.check(&scope, &policy, false).await.unwrap();
        assert!(!quota.check(&scope, &policy, false).await.unwrap().allowed);

        clock.set(OCT_19 + DAY_MS);
        let decision = quota.check(&scope, &policy, false).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(1));
        assert_eq!(quota.peek_usage(&scope, &policy).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_exempt_never_touches_counter() {
        let (quota, _, policy) = quota_with_limit(1);
        let scope = ScopeKey::agent("a1");

        for _ in 0..5 {
            let decision = quota.check(&scope, &policy, true).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, None);
        }
        assert_eq!(quota.peek_usage(&scope, &policy).await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_peek_usage_is_read_only() {
        let (quota, _, policy) = quota_with_limit(10);
        let scope = ScopeKey::user("u1");

        quota.check(&scope, &policy, false).await.unwrap();
        for _ in 0..3 {
            let usage = quota.peek_usage(&scope, &policy).await.unwrap();
            assert_eq!(usage.used, 1);
            assert_eq!(usage.remaining, Some(9));
        }
    }
}
