//! Cheap per-message checks run before any quota is consumed.
//!
//! Order is fixed and short-circuiting:
//! 1. message length
//! 2. rapid-fire: admitted messages within `rapid_fire_window`
//! 3. conversation length

use crate::clock::Clock;
use crate::decision::{AbuseDecision, BackendFailurePolicy, RejectReason};
use crate::error::Result;
use crate::policy::LimitPolicy;
use crate::scope::{KeySpace, ScopeKey};
use crate::store::{CounterStore, WindowAdmission, WindowCheck};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct AbuseEvaluator {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    on_backend_error: BackendFailurePolicy,
}

impl AbuseEvaluator {
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

    /// `conversation_length` is the number of messages already in the
    /// calling conversation, including this one.
    ///
    /// Only messages that pass every check enter the burst window, so a
    /// rejected attempt never extends a client's cooldown.
    pub async fn check(
        &self,
        scope: &ScopeKey,
        message: &str,
        conversation_length: u64,
        policy: &LimitPolicy,
    ) -> Result<AbuseDecision> {
        let length = message.chars().count() as u64;
        if length > policy.max_message_length {
            debug!(scope = %scope, length, max = policy.max_message_length, "message too long");
            return Ok(AbuseDecision::reject(RejectReason::MessageTooLong));
        }

        let now = self.clock.now_ms();
        let burst = WindowCheck::new(
            self.keys.burst(scope),
            policy.rapid_fire_window,
            policy.rapid_fire_max_events,
        );

        if conversation_length > policy.max_conversation_messages {
            return self
                .reject_long_conversation(scope, &burst, now, conversation_length, policy)
                .await;
        }

        match self.store.admit_event(std::slice::from_ref(&burst), now).await {
            Ok(WindowAdmission::Admitted { .. }) => Ok(AbuseDecision::allow()),
            Ok(WindowAdmission::Rejected { count, .. }) => {
                debug!(scope = %scope, count, max = policy.rapid_fire_max_events, "rapid fire");
                Ok(AbuseDecision::reject(RejectReason::RapidFire))
            }
            Err(e) if e.is_backend_unavailable() => {
                warn!(
                    scope = %scope,
                    policy = self.on_backend_error.as_str(),
                    error = %e,
                    "abuse backend unavailable, applying failure policy"
                );
                let mut decision = match self.on_backend_error {
                    BackendFailurePolicy::Open => AbuseDecision::allow(),
                    BackendFailurePolicy::Closed => {
                        AbuseDecision::reject(RejectReason::BackendUnavailable)
                    }
                };
                decision.degraded = true;
                Ok(decision)
            }
            Err(e) => Err(e),
        }
    }

    /// The message is refused either way; a full burst window still takes
    /// precedence as the reported reason. Nothing is recorded.
    async fn reject_long_conversation(
        &self,
        scope: &ScopeKey,
        burst: &WindowCheck,
        now: u64,
        conversation_length: u64,
        policy: &LimitPolicy,
    ) -> Result<AbuseDecision> {
        let recent = match self
            .store
            .count_events(&burst.key, now, policy.rapid_fire_window)
            .await
        {
            Ok(recent) => recent,
            Err(e) if e.is_backend_unavailable() => {
                warn!(scope = %scope, error = %e, "burst window unavailable");
                0
            }
            Err(e) => return Err(e),
        };

        if recent >= policy.rapid_fire_max_events {
            debug!(scope = %scope, recent, max = policy.rapid_fire_max_events, "rapid fire");
            return Ok(AbuseDecision::reject(RejectReason::RapidFire));
        }

        debug!(
            scope = %scope,
            conversation_length,
            max = policy.max_conversation_messages,
            "conversation too long"
        );
        Ok(AbuseDecision::reject(RejectReason::ConversationTooLong))
    }
}
