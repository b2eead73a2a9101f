//! Scope identities and the store keys derived from them.

use crate::clock::utc_day;

/// Identity of one countable subject, before any window discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Per-agent quota shared by every visitor of a public agent.
    pub fn agent(agent_id: &str) -> Self {
        Self(format!("agent:{}", sanitize(agent_id)))
    }

    /// One anonymous visitor talking to one agent.
    pub fn ip_agent(ip: &str, agent_id: &str) -> Self {
        Self(format!("ip:{}:agent:{}", sanitize(ip), sanitize(agent_id)))
    }

    pub fn user(user_id: &str) -> Self {
        Self(format!("user:{}", sanitize(user_id)))
    }

    pub fn api_key(key_id: &str) -> Self {
        Self(format!("apikey:{}", sanitize(key_id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Caller-supplied scope ids are used verbatim (trimmed) so distinct ids
/// never share a counter. Validate them first.
impl From<&str> for ScopeKey {
    fn from(scope: &str) -> Self {
        Self(scope.trim().to_string())
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replaces characters outside `[A-Za-z0-9:._@-]` so keys stay printable
/// and unambiguous in Redis.
pub fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '@' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Builds namespaced store keys.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Daily quota counter: `<prefix>:quota:<scope>:<YYYY-MM-DD>`.
    pub fn quota(&self, scope: &ScopeKey, now_ms: u64) -> String {
        format!("{}:quota:{}:{}", self.prefix, scope, utc_day(now_ms))
    }

    pub fn rate_minute(&self, scope: &ScopeKey) -> String {
        format!("{}:rate:{}:minute", self.prefix, scope)
    }

    pub fn rate_day(&self, scope: &ScopeKey) -> String {
        format!("{}:rate:{}:day", self.prefix, scope)
    }

    pub fn burst(&self, scope: &ScopeKey) -> String {
        format!("{}:abuse:{}:burst", self.prefix, scope)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("quotaguard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OCT_19: u64 = 1_792_368_000_000;

    #[test]
    fn test_scope_builders() {
        assert_eq!(ScopeKey::agent("a1").as_str(), "agent:a1");
        assert_eq!(
            ScopeKey::ip_agent("203.0.113.7", "a1").as_str(),
            "ip:203.0.113.7:agent:a1"
        );
        assert_eq!(ScopeKey::user("u@example.com").as_str(), "user:u@example.com");
        assert_eq!(ScopeKey::api_key("k 1").as_str(), "apikey:k_1");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("test#key with$chars"), "test_key_with_chars");
        assert_eq!(sanitize("  padded  "), "padded");
    }

    #[test]
    fn test_quota_key_rolls_with_the_day() {
        let keys = KeySpace::default();
        let scope = ScopeKey::agent("a1");
        assert_eq!(keys.quota(&scope, OCT_19), "quotaguard:quota:agent:a1:2026-10-19");
        assert_eq!(
            keys.quota(&scope, OCT_19 + 86_400_000),
            "quotaguard:quota:agent:a1:2026-10-20"
        );
    }

    #[test]
    fn test_windows_use_distinct_keys() {
        let keys = KeySpace::new("qg");
        let scope = ScopeKey::api_key("k1");
        assert_eq!(keys.rate_minute(&scope), "qg:rate:apikey:k1:minute");
        assert_eq!(keys.rate_day(&scope), "qg:rate:apikey:k1:day");
        assert_eq!(keys.burst(&scope), "qg:abuse:apikey:k1:burst");
    }
}
