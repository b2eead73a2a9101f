use crate::abuse::AbuseEvaluator;
use crate::clock::{Clock, SystemClock};
use crate::decision::{
    AbuseDecision, BackendFailurePolicy, MessageDecision, QuotaDecision, RateDecision,
    UsageSnapshot,
};
use crate::error::Result;
use crate::policy::{LimitPolicy, PolicyTable};
use crate::quota::FixedWindowQuota;
use crate::rate_limiter::SlidingWindowLimiter;
use crate::scope::{KeySpace, ScopeKey};
use crate::store::CounterStore;
use crate::validation::ScopeValidator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Identity resolved by the auth layer. The engine never authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub scope_id: String,
    pub tier: String,
    #[serde(default)]
    pub exempt: bool,
}

/// Failure policy per enforcer class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicies {
    pub quota: BackendFailurePolicy,
    pub rate: BackendFailurePolicy,
    pub abuse: BackendFailurePolicy,
}

impl Default for FailurePolicies {
    /// Cost-control checks favour availability; abuse checks favour safety.
    fn default() -> Self {
        Self {
            quota: BackendFailurePolicy::Open,
            rate: BackendFailurePolicy::Open,
            abuse: BackendFailurePolicy::Closed,
        }
    }
}

/// Entry point for the caller layer: validates scopes, resolves tier
/// policies and dispatches to the enforcers.
pub struct QuotaEngine {
    policies: PolicyTable,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    quota: FixedWindowQuota,
    limiter: SlidingWindowLimiter,
    abuse: AbuseEvaluator,
}

impl QuotaEngine {
    pub fn builder(policies: PolicyTable, store: Arc<dyn CounterStore>) -> QuotaEngineBuilder {
        QuotaEngineBuilder {
            policies,
            store,
            clock: Arc::new(SystemClock),
            keys: KeySpace::default(),
            failure: FailurePolicies::default(),
        }
    }

    /// Starts the store's background work (the local janitor).
    pub async fn open(&self) -> Result<()> {
        self.store.open().await?;
        info!(
            store = self.store.name(),
            tiers = ?self.policies.tier_names(),
            "quota engine opened"
        );
        Ok(())
    }

    pub async fn close(&self) {
        self.store.close().await;
        info!(store = self.store.name(), "quota engine closed");
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn resolve(&self, scope_id: &str, tier: &str) -> Result<(ScopeKey, &LimitPolicy)> {
        ScopeValidator::validate(scope_id)?;
        ScopeValidator::validate_tier(tier)?;
        let policy = self.policies.resolve(tier)?;
        Ok((ScopeKey::from(scope_id), policy))
    }

    pub async fn check_rate(&self, scope_id: &str, tier: &str) -> Result<RateDecision> {
        let (scope, policy) = self.resolve(scope_id, tier)?;
        self.limiter.check(&scope, policy).await
    }

    pub async fn check_quota(
        &self,
        scope_id: &str,
        tier: &str,
        exempt: bool,
    ) -> Result<QuotaDecision> {
        let (scope, policy) = self.resolve(scope_id, tier)?;
        self.quota.check(&scope, policy, exempt).await
    }

    pub async fn check_abuse(
        &self,
        scope_id: &str,
        tier: &str,
        message: &str,
        conversation_length: u64,
    ) -> Result<AbuseDecision> {
        let (scope, policy) = self.resolve(scope_id, tier)?;
        self.abuse
            .check(&scope, message, conversation_length, policy)
            .await
    }

    pub async fn peek_usage(&self, scope_id: &str, tier: &str) -> Result<UsageSnapshot> {
        let (scope, policy) = self.resolve(scope_id, tier)?;
        self.quota.peek_usage(&scope, policy).await
    }

    /// Abuse heuristics, then quota consumption only if they pass.
    pub async fn admit_message(
        &self,
        caller: &CallerIdentity,
        message: &str,
        conversation_length: u64,
    ) -> Result<MessageDecision> {
        let (scope, policy) = self.resolve(&caller.scope_id, &caller.tier)?;

        let abuse = self
            .abuse
            .check(&scope, message, conversation_length, policy)
            .await?;
        if !abuse.allowed {
            return Ok(MessageDecision {
                allowed: false,
                reason: abuse.reason,
                message: abuse.message,
                quota: None,
            });
        }

        let quota = self.quota.check(&scope, policy, caller.exempt).await?;
        Ok(MessageDecision {
            allowed: quota.allowed,
            reason: quota.reason,
            message: quota.reason.map(|r| r.message().to_string()),
            quota: Some(quota),
        })
    }

    pub async fn health(&self) -> EngineHealth {
        let store_reachable = self.store.ping().await.is_ok();
        EngineHealth {
            store: self.store.name(),
            store_reachable,
            degraded: self.store.is_degraded() || !store_reachable,
            quota_on_backend_error: self.quota.on_backend_error(),
            rate_on_backend_error: self.limiter.on_backend_error(),
            abuse_on_backend_error: self.abuse.on_backend_error(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub store: &'static str,
    pub store_reachable: bool,
    pub degraded: bool,
    pub quota_on_backend_error: BackendFailurePolicy,
    pub rate_on_backend_error: BackendFailurePolicy,
    pub abuse_on_backend_error: BackendFailurePolicy,
}

pub struct QuotaEngineBuilder {
    policies: PolicyTable,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    failure: FailurePolicies,
}

impl QuotaEngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys = KeySpace::new(prefix);
        self
    }

    pub fn failure_policies(mut self, failure: FailurePolicies) -> Self {
        self.failure = failure;
        self
    }

    /// Validates the policy table; an invalid table is fatal.
    pub fn build(self) -> Result<QuotaEngine> {
        self.policies.validate()?;

        let quota = FixedWindowQuota::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.keys.clone(),
            self.failure.quota,
        );
        let limiter = SlidingWindowLimiter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.keys.clone(),
            self.failure.rate,
        );
        let abuse = AbuseEvaluator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.keys,
            self.failure.abuse,
        );

        Ok(QuotaEngine {
            policies: self.policies,
            store: self.store,
            clock: self.clock,
            quota,
            limiter,
            abuse,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::decision::RejectReason;
    use crate::error::QuotaError;
    use crate::store::LocalStore;
    use std::time::Duration;

    fn engine() -> QuotaEngine {
        let clock = Arc::new(ManualClock::new(1_792_368_000_000));
        let store = Arc::new(LocalStore::new(clock.clone(), Duration::from_secs(60)));
        QuotaEngine::builder(PolicyTable::default(), store)
            .clock(clock)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_scope_is_rejected_before_any_counter() {
        let engine = engine();
        let err = engine.check_quota("", "free", false).await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidScope(_)));
    }

    #[tokio::test]
    async fn test_unknown_tier_is_configuration_error() {
        let engine = engine();
        let err = engine.check_rate("apikey:k1", "gold").await.unwrap_err();
        assert!(matches!(err, QuotaError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_empty_policy_table() {
        let store = Arc::new(LocalStore::new(Arc::new(SystemClock), Duration::from_secs(60)));
        assert!(QuotaEngine::builder(PolicyTable::new(), store).build().is_err());
    }

    #[tokio::test]
    async fn test_admit_message_does_not_charge_quota_for_abusive_input() {
        let engine = engine();
        let caller = CallerIdentity {
            scope_id: "agent:a1".to_string(),
            tier: "free".to_string(),
            exempt: false,
        };

        let long = "x".repeat(5_000);
        let decision = engine.admit_message(&caller, &long, 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RejectReason::MessageTooLong));
        assert_eq!(engine.peek_usage("agent:a1", "free").await.unwrap().used, 0);

        let decision = engine.admit_message(&caller, "hello", 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.quota.unwrap().remaining, Some(199));
        assert_eq!(engine.peek_usage("agent:a1", "free").await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_health_reports_failure_policies() {
        let health = engine().health().await;
        assert!(health.store_reachable);
        assert!(!health.degraded);
        assert_eq!(health.abuse_on_backend_error, BackendFailurePolicy::Closed);
        assert_eq!(health.quota_on_backend_error, BackendFailurePolicy::Open);
    }
}
