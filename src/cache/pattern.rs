//! Glob patterns over cache keys.

use crate::request::Fingerprint;
use crate::{Error, Result};
use regex::Regex;

/// A compiled glob pattern (`*` any run, `?` one character).
///
/// Patterns without a `:` address whole targets and are matched against the
/// `service.operation` prefix of a key; patterns containing `:` are matched
/// against the full key including the digest.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    regex: Regex,
    full_key: bool,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::validation("empty cache invalidation pattern"));
        }
        let mut re = String::with_capacity(pattern.len() * 2 + 2);
        re.push('^');
        for c in pattern.chars() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');
        let regex = Regex::new(&re)
            .map_err(|e| Error::validation(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
            full_key: pattern.contains(':'),
        })
    }

    pub fn matches(&self, key: &Fingerprint) -> bool {
        if self.full_key {
            self.regex.is_match(key.as_str())
        } else {
            self.regex.is_match(key.target_key())
        }
    }

    /// Match a bare `service.operation` string.
    pub fn matches_target(&self, target_key: &str) -> bool {
        !self.full_key && self.regex.is_match(target_key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_literal(&self) -> bool {
        !self.source.contains(['*', '?'])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Fingerprint {
        Fingerprint::from_raw(s)
    }

    #[test]
    fn target_patterns() {
        let p = KeyPattern::new("ec2.describe-*").unwrap();
        assert!(p.matches(&key("ec2.describe-instances:abc")));
        assert!(p.matches(&key("ec2.describe-volumes:def")));
        assert!(!p.matches(&key("ec2.run-instances:abc")));
        assert!(!p.matches(&key("s3api.describe-x:abc")));
    }

    #[test]
    fn literal_dots_are_escaped() {
        let p = KeyPattern::new("ec2.list").unwrap();
        assert!(p.is_literal());
        assert!(!p.matches(&key("ec2xlist:abc")));
        assert!(p.matches(&key("ec2.list:abc")));
    }

    #[test]
    fn full_key_patterns() {
        let p = KeyPattern::new("ec2.describe-instances:ab?d*").unwrap();
        assert!(p.matches(&key("ec2.describe-instances:abcd1234")));
        assert!(!p.matches(&key("ec2.describe-instances:abd")));
        assert!(!p.matches_target("ec2.describe-instances"));
    }

    #[test]
    fn star_matches_everything() {
        let p = KeyPattern::new("*").unwrap();
        assert!(p.matches(&key("iam.list-users:00")));
        assert!(KeyPattern::new("").is_err());
    }
}
