use serde::{Deserialize, Serialize};

/// How an enforcer treats a request when its counter backend is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendFailurePolicy {
    /// Admit the request.
    Open,
    /// Reject the request with [`RejectReason::BackendUnavailable`].
    Closed,
}

impl BackendFailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendFailurePolicy::Open => "open",
            BackendFailurePolicy::Closed => "closed",
        }
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MessageTooLong,
    RapidFire,
    ConversationTooLong,
    QuotaExceeded,
    RateLimited,
    BackendUnavailable,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::MessageTooLong => "message_too_long",
            RejectReason::RapidFire => "rapid_fire",
            RejectReason::ConversationTooLong => "conversation_too_long",
            RejectReason::QuotaExceeded => "quota_exceeded",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::BackendUnavailable => "backend_unavailable",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::MessageTooLong => {
                "Your message is too long. Please shorten it and try again."
            }
            RejectReason::RapidFire => "You're sending messages too quickly. Please slow down.",
            RejectReason::ConversationTooLong => {
                "This conversation has reached its maximum length. Please start a new one."
            }
            RejectReason::QuotaExceeded => {
                "You've reached your daily message limit. It resets at midnight UTC."
            }
            RejectReason::RateLimited => "Too many requests. Please retry later.",
            RejectReason::BackendUnavailable => {
                "This request cannot be processed right now. Please try again shortly."
            }
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Which sliding window produced a rate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindowKind {
    Minute,
    Day,
}

/// Result of a sliding-window rate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds at which capacity next frees up.
    pub reset_at: u64,
    /// Seconds to wait, only present on rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<RateWindowKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    /// A backend failure policy decided this request.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

/// Result of a fixed-window quota check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// `None` means unlimited (exempt callers).
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    /// Epoch milliseconds of the next window start.
    pub reset_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl QuotaDecision {
    pub fn unlimited(reset_at: u64) -> Self {
        Self {
            allowed: true,
            remaining: None,
            limit: None,
            reset_at,
            reason: None,
            degraded: false,
        }
    }
}

/// Result of the abuse heuristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbuseDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl AbuseDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
            degraded: false,
        }
    }

    pub fn reject(reason: RejectReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            message: Some(reason.message().to_string()),
            degraded: false,
        }
    }
}

/// Read-only view of a fixed-window quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub used: u64,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: u64,
}

/// Abuse heuristics followed by quota consumption for one chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaDecision>,
}
