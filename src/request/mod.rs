//! 请求模型模块：目标、参数、缓存策略、优先级与请求指纹。
//!
//! Request model consumed by the execution engine.
//!
//! A [`Request`] is an immutable value: a [`Target`] (service + operation), an
//! ordered parameter map, a [`CachePolicy`] and an optional [`Priority`]. Its
//! [`Fingerprint`] is the identity used by the cache store and the
//! deduplicator.
//!
//! ```rust
//! use cloudcall::request::{Priority, Request};
//! use std::time::Duration;
//!
//! let req = Request::new("ec2", "describe-instances")
//!     .param("region", "us-east-1")
//!     .with_ttl(Duration::from_secs(30))
//!     .with_priority(Priority::High);
//! assert!(req.cache_policy().cacheable);
//! assert_eq!(req.target().to_string(), "ec2.describe-instances");
//! ```

mod fingerprint;

pub use fingerprint::Fingerprint;

pub(crate) use fingerprint::normalize_key;

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Operation verbs treated as side-effect free (cacheable by default).
const READ_VERBS: &[&str] = &["describe", "list", "get", "lookup", "search", "batch-get", "scan", "query"];

/// Service + operation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub service: String,
    pub operation: String,
}

impl Target {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
        }
    }

    /// `service.operation`, the key used by TTL policy and glob patterns.
    pub fn type_key(&self) -> String {
        format!("{}.{}", self.service, self.operation)
    }

    /// Leading verb of the operation (`describe` for `describe-instances`).
    pub fn verb(&self) -> &str {
        self.operation.split('-').next().unwrap_or(&self.operation)
    }

    pub fn is_read_only(&self) -> bool {
        READ_VERBS
            .iter()
            .any(|v| self.operation == *v || self.operation.starts_with(&format!("{}-", v)))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.operation)
    }
}

/// How a request interacts with the cache store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    pub cacheable: bool,
    /// Overrides the TTL resolved from the target type.
    pub ttl: Option<Duration>,
    /// Glob patterns invalidated after this request succeeds (mutations).
    pub invalidates: Vec<String>,
}

impl CachePolicy {
    pub fn cached() -> Self {
        Self {
            cacheable: true,
            ..Default::default()
        }
    }

    pub fn bypass() -> Self {
        Self::default()
    }

    /// A non-cacheable mutation that makes the given patterns stale.
    pub fn mutation<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cacheable: false,
            ttl: None,
            invalidates: patterns.into_iter().map(Into::into).collect(),
        }
    }

    fn inferred(target: &Target) -> Self {
        if target.is_read_only() {
            Self::cached()
        } else {
            Self::bypass()
        }
    }
}

/// Scheduling priority when waiting for a concurrency permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Immutable request value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    target: Target,
    parameters: BTreeMap<String, Value>,
    cache_policy: CachePolicy,
    priority: Option<Priority>,
}

impl Request {
    /// New request with a cache policy inferred from the operation verb.
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        let target = Target::new(service, operation);
        let cache_policy = CachePolicy::inferred(&target);
        Self {
            target,
            parameters: BTreeMap::new(),
            cache_policy,
            priority: None,
        }
    }

    /// Names are stored normalized (`--Instance_Ids` becomes `instance-ids`),
    /// so the rendered call is exactly what the fingerprint identifies.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters
            .insert(normalize_key(&key.into()), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters = parameters
            .into_iter()
            .map(|(k, v)| (normalize_key(&k), v))
            .collect();
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache_policy.cacheable = true;
        self.cache_policy.ttl = Some(ttl);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cache_policy.cacheable = false;
        self
    }

    pub fn invalidates(mut self, pattern: impl Into<String>) -> Self {
        self.cache_policy.invalidates.push(pattern.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(&normalize_key(key))
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache_policy
    }

    pub fn priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.target, &self.parameters)
    }

    /// Reject requests the transport could never render.
    pub fn validate(&self) -> Result<()> {
        fn valid_ident(s: &str) -> bool {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        }
        if !valid_ident(&self.target.service) {
            return Err(Error::validation(format!("invalid service name '{}'", self.target.service))
                .with_context(self.error_context()));
        }
        if !valid_ident(&self.target.operation) {
            return Err(Error::validation(format!(
                "invalid operation name '{}'",
                self.target.operation
            ))
            .with_context(self.error_context()));
        }
        if let Some(key) = self.parameters.keys().find(|k| k.is_empty()) {
            return Err(Error::validation(format!("invalid parameter name '{}'", key))
                .with_context(self.error_context()));
        }
        Ok(())
    }

    /// Context used to attribute failures back to this request.
    pub fn error_context(&self) -> ErrorContext {
        ErrorContext::new()
            .with_target(self.target.to_string())
            .with_details(format!(
                "parameters: {}",
                serde_json::to_string(&self.parameters).unwrap_or_default()
            ))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target)?;
        if !self.parameters.is_empty() {
            write!(
                f,
                " {}",
                serde_json::to_string(&self.parameters).unwrap_or_default()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn read_verbs_are_cacheable_by_default() {
        assert!(Request::new("ec2", "describe-instances").cache_policy().cacheable);
        assert!(Request::new("s3api", "list-buckets").cache_policy().cacheable);
        assert!(!Request::new("ec2", "run-instances").cache_policy().cacheable);
        assert!(!Request::new("ec2", "terminate-instances").cache_policy().cacheable);
    }

    #[test]
    fn builder_sets_policy_and_priority() {
        let req = Request::new("ec2", "create-tags")
            .param("resources", json!(["i-1"]))
            .invalidates("ec2.describe-*")
            .with_priority(Priority::High);
        assert_eq!(req.priority(), Priority::High);
        assert_eq!(req.cache_policy().invalidates, vec!["ec2.describe-*".to_string()]);
        assert_eq!(req.parameter("resources"), Some(&json!(["i-1"])));
        assert_eq!(Request::new("ec2", "describe-regions").priority(), Priority::Normal);
    }

    #[test]
    fn validation_rejects_bad_names() {
        assert!(Request::new("ec2", "describe-instances").validate().is_ok());
        assert!(Request::new("", "describe").validate().is_err());
        assert!(Request::new("ec2", "describe instances").validate().is_err());
        let err = Request::new("ec2", "describe-instances")
            .param("--", 1)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("ec2.describe-instances"));
    }

    #[test]
    fn equal_requests_share_fingerprint() {
        let a = Request::new("ec2", "describe-instances").param("region", "us-east-1");
        let b = Request::new("ec2", "describe-instances")
            .param("region", "us-east-1")
            .with_priority(Priority::Low);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn parameter_names_are_stored_normalized() {
        let req = Request::new("ec2", "describe-instances").param("--Instance_Ids", json!(["i-1"]));
        assert_eq!(req.parameters().keys().collect::<Vec<_>>(), vec!["instance-ids"]);
        assert_eq!(req.parameter("instance_ids"), Some(&json!(["i-1"])));

        let mut raw = BTreeMap::new();
        raw.insert("Max_Items".to_string(), json!(5));
        let req = Request::new("ec2", "describe-instances").with_parameters(raw);
        assert_eq!(req.parameter("max-items"), Some(&json!(5)));
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
