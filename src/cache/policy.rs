//! TTL resolution by target type.

use super::pattern::KeyPattern;
use crate::request::Target;
use crate::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Maps a target type to the lifetime of its cached results.
///
/// Keys are `service.operation` strings or glob patterns over them
/// (`ec2.describe-*`, `*.list-*`). Resolution order: exact key, then the
/// longest matching pattern, then the default. A zero TTL means "never cache".
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default: Duration,
    exact: HashMap<String, Duration>,
    patterns: Vec<(KeyPattern, Duration)>,
}

impl TtlPolicy {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            exact: HashMap::new(),
            patterns: Vec::new(),
        }
    }

    /// Build from a raw table. The `"default"` entry is mandatory.
    pub fn from_table(table: &HashMap<String, Duration>) -> Result<Self> {
        let default = table.get("default").copied().ok_or_else(|| {
            Error::configuration("TTL table has no 'default' entry")
        })?;
        let mut policy = Self::new(default);
        for (key, ttl) in table {
            if key == "default" {
                continue;
            }
            policy = policy.with_rule(key, *ttl)?;
        }
        Ok(policy)
    }

    pub fn with_rule(mut self, key: &str, ttl: Duration) -> Result<Self> {
        let pattern = KeyPattern::new(key)
            .map_err(|e| Error::configuration(format!("bad TTL rule '{}': {}", key, e)))?;
        if pattern.is_literal() {
            self.exact.insert(key.to_string(), ttl);
        } else {
            self.patterns.push((pattern, ttl));
            // Longest (most specific) pattern first.
            self.patterns
                .sort_by(|a, b| b.0.as_str().len().cmp(&a.0.as_str().len()));
        }
        Ok(self)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default
    }

    pub fn resolve(&self, target: &Target) -> Duration {
        let key = target.type_key();
        if let Some(ttl) = self.exact.get(&key) {
            return *ttl;
        }
        self.patterns
            .iter()
            .find(|(p, _)| p.matches_target(&key))
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
