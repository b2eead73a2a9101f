use crate::error::{QuotaError, Result};
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

pub const MAX_SCOPE_LEN: usize = 256;

static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1F\x7F]").expect("static regex"));

/// Scope identity validation. A bad scope is a bug in the caller layer, so
/// failures are logged rather than surfaced to end users.
pub struct ScopeValidator;

impl ScopeValidator {
    pub fn validate(scope: &str) -> Result<()> {
        let reason = if scope.trim().is_empty() {
            Some("Scope cannot be empty")
        } else if scope.chars().count() > MAX_SCOPE_LEN {
            Some("Scope exceeds 256 characters")
        } else if CONTROL_CHARS.is_match(scope) {
            Some("Scope contains control characters")
        } else {
            None
        };

        match reason {
            None => Ok(()),
            Some(reason) => {
                warn!(
                    target: "quotaguard::caller",
                    scope = %scope.escape_debug(),
                    reason,
                    "rejected malformed scope"
                );
                Err(QuotaError::InvalidScope(reason.to_string()))
            }
        }
    }

    pub fn validate_tier(tier: &str) -> Result<()> {
        if tier.trim().is_empty() {
            return Err(QuotaError::Validation("Tier cannot be empty".to_string()));
        }
        Ok(())
    }
}
