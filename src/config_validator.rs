use crate::config::StoreMode;
use crate::error::{QuotaError, Result};

/// Validates service configuration for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(QuotaError::Configuration(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(QuotaError::Configuration(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Redis-backed modes need a usable URL
    pub fn validate_store(mode: StoreMode, redis_url: Option<&str>) -> Result<()> {
        match (mode, redis_url) {
            (StoreMode::Memory, _) => Ok(()),
            (_, Some(url)) => Self::validate_redis_url(url),
            (_, None) => Err(QuotaError::Configuration(
                "REDIS_URL is required for redis and failover store modes".to_string(),
            )),
        }
    }

    pub fn validate_positive(name: &str, value: u64) -> Result<()> {
        if value == 0 {
            return Err(QuotaError::Configuration(format!(
                "{} must be greater than 0",
                name
            )));
        }
        Ok(())
    }

    /// Validates the store key namespace
    pub fn validate_key_prefix(prefix: &str) -> Result<()> {
        if prefix.is_empty() {
            return Err(QuotaError::Configuration(
                "Key prefix cannot be empty".to_string(),
            ));
        }

        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
        {
            return Err(QuotaError::Configuration(
                "Key prefix can only contain alphanumeric characters, hyphens, underscores and colons"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("redis://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("rediss://localhost:6379").is_ok());
    }

    #[test]
    fn test_invalid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("").is_err());
        assert!(ConfigValidator::validate_redis_url("http://localhost:6379").is_err());
    }

    #[test]
    fn test_store_mode_requirements() {
        assert!(ConfigValidator::validate_store(StoreMode::Memory, None).is_ok());
        assert!(ConfigValidator::validate_store(StoreMode::Redis, None).is_err());
        assert!(
            ConfigValidator::validate_store(StoreMode::Failover, Some("redis://cache:6379")).is_ok()
        );
        assert!(
            ConfigValidator::validate_store(StoreMode::Failover, Some("tcp://cache:6379")).is_err()
        );
    }

    #[test]
    fn test_positive_values() {
        assert!(ConfigValidator::validate_positive("X", 1).is_ok());
        assert!(ConfigValidator::validate_positive("X", 0).is_err());
    }

    #[test]
    fn test_key_prefix() {
        assert!(ConfigValidator::validate_key_prefix("quotaguard").is_ok());
        assert!(ConfigValidator::validate_key_prefix("").is_err());
        assert!(ConfigValidator::validate_key_prefix("bad prefix").is_err());
    }
}
