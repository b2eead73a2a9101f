use crate::config_validator::ConfigValidator;
use crate::decision::BackendFailurePolicy;
use crate::engine::FailurePolicies;
use crate::error::Result;
use crate::policy::PolicyTable;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    /// Process-local counters only.
    Memory,
    /// Redis only; outages are handled by each enforcer's failure policy.
    Redis,
    /// Redis, falling back to process-local counters during outages.
    Failover,
}

/// Service configuration. Every flag can also be set from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "quotaguard", version, about = "Quota and rate-limit decision service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Counter backend
    #[arg(long, env = "STORE_MODE", value_enum, default_value_t = StoreMode::Failover)]
    pub store_mode: StoreMode,

    /// Upper bound for each Redis round trip, in milliseconds
    #[arg(long, env = "REDIS_TIMEOUT_MS", default_value_t = 250)]
    pub redis_timeout_ms: u64,

    /// Local store sweep interval in seconds
    #[arg(long, env = "JANITOR_INTERVAL_SECS", default_value_t = 300)]
    pub janitor_interval_secs: u64,

    /// JSON tier policy table; the built-in table is used when absent
    #[arg(long, env = "POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Tiers that must be present in the policy table
    #[arg(long, env = "REQUIRED_TIERS", value_delimiter = ',', default_value = "free")]
    pub required_tiers: Vec<String>,

    /// Namespace for every store key
    #[arg(long, env = "KEY_PREFIX", default_value = "quotaguard")]
    pub key_prefix: String,

    #[arg(
        long,
        env = "QUOTA_ON_BACKEND_ERROR",
        value_enum,
        default_value_t = BackendFailurePolicy::Open
    )]
    pub quota_on_backend_error: BackendFailurePolicy,

    #[arg(
        long,
        env = "RATE_ON_BACKEND_ERROR",
        value_enum,
        default_value_t = BackendFailurePolicy::Open
    )]
    pub rate_on_backend_error: BackendFailurePolicy,

    #[arg(
        long,
        env = "ABUSE_ON_BACKEND_ERROR",
        value_enum,
        default_value_t = BackendFailurePolicy::Closed
    )]
    pub abuse_on_backend_error: BackendFailurePolicy,

    /// Log level for the quotaguard target when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: None,
            store_mode: StoreMode::Memory,
            redis_timeout_ms: 250,
            janitor_interval_secs: 300,
            policy_file: None,
            required_tiers: vec!["free".to_string()],
            key_prefix: "quotaguard".to_string(),
            quota_on_backend_error: BackendFailurePolicy::Open,
            rate_on_backend_error: BackendFailurePolicy::Open,
            abuse_on_backend_error: BackendFailurePolicy::Closed,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parse from the command line and environment.
    pub fn from_env() -> Self {
        Config::parse()
    }

    /// `failover` without a Redis URL degrades to `memory`.
    pub fn effective_store_mode(&self) -> StoreMode {
        match (self.store_mode, &self.redis_url) {
            (StoreMode::Failover, None) => StoreMode::Memory,
            (mode, _) => mode,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_store(self.effective_store_mode(), self.redis_url.as_deref())?;
        ConfigValidator::validate_positive("REDIS_TIMEOUT_MS", self.redis_timeout_ms)?;
        ConfigValidator::validate_positive("JANITOR_INTERVAL_SECS", self.janitor_interval_secs)?;
        ConfigValidator::validate_key_prefix(&self.key_prefix)?;
        Ok(())
    }

    /// Loads and validates the policy table, including required tiers.
    pub fn load_policies(&self) -> Result<PolicyTable> {
        let table = match &self.policy_file {
            Some(path) => PolicyTable::load(path)?,
            None => PolicyTable::default(),
        };
        table.validate()?;
        table.require(&self.required_tiers)?;
        Ok(table)
    }

    pub fn failure_policies(&self) -> FailurePolicies {
        FailurePolicies {
            quota: self.quota_on_backend_error,
            rate: self.rate_on_backend_error,
            abuse: self.abuse_on_backend_error,
        }
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_flags() {
        let config = Config::try_parse_from([
            "quotaguard",
            "--redis-url",
            "redis://cache:6379",
            "--store-mode",
            "redis",
            "--abuse-on-backend-error",
            "open",
            "--required-tiers",
            "free,pro",
        ])
        .unwrap();

        assert_eq!(config.store_mode, StoreMode::Redis);
        assert_eq!(config.abuse_on_backend_error, BackendFailurePolicy::Open);
        assert_eq!(config.required_tiers, vec!["free", "pro"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_failover_without_redis_is_memory() {
        let config = Config {
            store_mode: StoreMode::Failover,
            ..Config::default()
        };
        assert_eq!(config.effective_store_mode(), StoreMode::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_mode_requires_url() {
        let config = Config {
            store_mode: StoreMode::Redis,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_tier_is_fatal() {
        let config = Config {
            required_tiers: vec!["free".to_string(), "platinum".to_string()],
            ..Config::default()
        };
        assert!(config.load_policies().is_err());
    }

    #[test]
    fn test_default_failure_policies() {
        let policies = Config::default().failure_policies();
        assert_eq!(policies, FailurePolicies::default());
    }
}
