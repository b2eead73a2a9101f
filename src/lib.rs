pub mod abuse;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod decision;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod policy;
pub mod quota;
pub mod rate_limiter;
pub mod scope;
pub mod server;
pub mod store;
pub mod validation;

pub use config::Config;
pub use decision::{
    AbuseDecision, BackendFailurePolicy, MessageDecision, QuotaDecision, RateDecision,
    RejectReason, UsageSnapshot,
};
pub use engine::{CallerIdentity, FailurePolicies, QuotaEngine};
pub use error::{QuotaError, Result};
pub use policy::{LimitPolicy, PolicyTable};
pub use scope::ScopeKey;
pub use server::create_app;
pub use store::{CounterStore, FailoverStore, LocalStore, RedisStore};
