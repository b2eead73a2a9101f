use crate::error::{QuotaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Limits applied to one caller tier. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LimitPolicy {
    #[validate(range(min = 1))]
    pub per_minute: u64,
    #[validate(range(min = 1))]
    pub per_day: u64,
    #[validate(range(min = 1))]
    pub daily_message_limit: u64,
    #[validate(range(min = 1))]
    pub max_message_length: u64,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_window"))]
    pub rapid_fire_window: Duration,
    #[validate(range(min = 1))]
    pub rapid_fire_max_events: u64,
    #[validate(range(min = 1))]
    pub max_conversation_messages: u64,
    /// Bypasses fixed-window quota consumption entirely.
    #[serde(default)]
    pub exempt: bool,
}

fn validate_window(window: &Duration) -> std::result::Result<(), ValidationError> {
    if window.is_zero() {
        return Err(ValidationError::new("rapid_fire_window_must_be_positive"));
    }
    Ok(())
}

impl LimitPolicy {
    pub fn free() -> Self {
        Self {
            per_minute: 20,
            per_day: 1_000,
            daily_message_limit: 200,
            max_message_length: 4_000,
            rapid_fire_window: Duration::from_secs(10),
            rapid_fire_max_events: 5,
            max_conversation_messages: 100,
            exempt: false,
        }
    }

    pub fn pro() -> Self {
        Self {
            per_minute: 60,
            per_day: 10_000,
            daily_message_limit: 2_000,
            max_message_length: 8_000,
            rapid_fire_window: Duration::from_secs(10),
            rapid_fire_max_events: 10,
            max_conversation_messages: 500,
            exempt: false,
        }
    }

    pub fn enterprise() -> Self {
        Self {
            per_minute: 300,
            per_day: 100_000,
            daily_message_limit: 20_000,
            max_message_length: 16_000,
            rapid_fire_window: Duration::from_secs(10),
            rapid_fire_max_events: 20,
            max_conversation_messages: 2_000,
            exempt: false,
        }
    }

    /// Bring-your-own-backend: callers pay for their own model usage, so
    /// message quotas do not apply. Abuse and rate limits still do.
    pub fn byob() -> Self {
        Self {
            exempt: true,
            ..Self::pro()
        }
    }
}

/// Static tier -> policy table, loaded once at process start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    pub tiers: HashMap<String, LimitPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let tiers = [
            ("free", LimitPolicy::free()),
            ("pro", LimitPolicy::pro()),
            ("enterprise", LimitPolicy::enterprise()),
            ("byob", LimitPolicy::byob()),
        ]
        .into_iter()
        .map(|(tier, policy)| (tier.to_string(), policy))
        .collect();

        Self { tiers }
    }
}

impl PolicyTable {
    pub fn new() -> Self {
        Self {
            tiers: HashMap::new(),
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>, policy: LimitPolicy) -> Self {
        self.tiers.insert(tier.into(), policy);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let table: PolicyTable = serde_json::from_str(json)
            .map_err(|e| QuotaError::Configuration(format!("Invalid policy table: {}", e)))?;
        table.validate()?;
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QuotaError::Configuration(format!(
                "Failed to read policy file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&raw)
    }

    /// Fails on an empty table or any policy breaking its field rules.
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(QuotaError::Configuration(
                "Policy table defines no tiers".to_string(),
            ));
        }

        for (tier, policy) in &self.tiers {
            if tier.trim().is_empty() {
                return Err(QuotaError::Configuration(
                    "Tier names cannot be empty".to_string(),
                ));
            }
            policy.validate().map_err(|e| {
                QuotaError::Configuration(format!("Policy for tier '{}' is invalid: {}", tier, e))
            })?;
        }

        Ok(())
    }

    /// Fails unless every tier in `tiers` has a policy.
    pub fn require(&self, tiers: &[String]) -> Result<()> {
        for tier in tiers {
            self.resolve(tier)?;
        }
        Ok(())
    }

    pub fn resolve(&self, tier: &str) -> Result<&LimitPolicy> {
        self.tiers.get(tier).ok_or_else(|| {
            QuotaError::Configuration(format!("No limit policy defined for tier '{}'", tier))
        })
    }

    pub fn tier_names(&self) -> Vec<&String> {
        self.tiers.keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_is_valid() {
        let table = PolicyTable::default();
        assert!(table.validate().is_ok());
        assert_eq!(table.resolve("free").unwrap().daily_message_limit, 200);
        assert!(table.resolve("byob").unwrap().exempt);
    }

    #[test]
    fn test_unknown_tier_is_configuration_error() {
        let table = PolicyTable::default();
        assert!(matches!(
            table.resolve("platinum"),
            Err(QuotaError::Configuration(_))
        ));
        assert!(table.require(&["free".to_string(), "platinum".to_string()]).is_err());
    }

    #[test]
    fn test_from_json_parses_humantime_windows() {
        let json = r#"{
            "tiers": {
                "free": {
                    "per_minute": 10,
                    "per_day": 100,
                    "daily_message_limit": 50,
                    "max_message_length": 2000,
                    "rapid_fire_window": "10s",
                    "rapid_fire_max_events": 5,
                    "max_conversation_messages": 40
                }
            }
        }"#;

        let table = PolicyTable::from_json(json).unwrap();
        let free = table.resolve("free").unwrap();
        assert_eq!(free.rapid_fire_window, Duration::from_secs(10));
        assert!(!free.exempt);
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let mut policy = LimitPolicy::free();
        policy.per_minute = 0;
        let table = PolicyTable::new().with_tier("free", policy);
        assert!(matches!(table.validate(), Err(QuotaError::Configuration(_))));

        let mut policy = LimitPolicy::free();
        policy.rapid_fire_window = Duration::ZERO;
        let table = PolicyTable::new().with_tier("free", policy);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_empty_table_is_rejected() {
        assert!(PolicyTable::new().validate().is_err());
        assert!(PolicyTable::from_json(r#"{"tiers": {}}"#).is_err());
    }
}
