//! Deterministic request identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use super::Target;

/// Identity shared by the cache store and the deduplicator.
///
/// The display form is `service.operation:<sha256>` so glob patterns such as
/// `ec2.describe-*` can address every cached entry of a target family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a target and its parameters.
    ///
    /// Parameter names are normalized (leading dashes stripped, ASCII
    /// lowercased, `_` folded to `-`) and `null` values are dropped, so
    /// `{"--Instance_Ids": [..]}` and `{"instance-ids": [..]}` collide. Object keys inside values are canonicalized by sorting; array
    /// order is significant.
    pub fn compute(target: &Target, parameters: &BTreeMap<String, Value>) -> Self {
        let mut normalized: BTreeMap<String, Value> = BTreeMap::new();
        for (key, value) in parameters {
            if value.is_null() {
                continue;
            }
            normalized.insert(normalize_key(key), canonicalize(value));
        }

        let mut hasher = Sha256::new();
        hasher.update(target.type_key().as_bytes());
        hasher.update([0u8]);
        // BTreeMap serializes in key order, and canonicalize() sorted nested objects.
        let canonical = serde_json::to_string(&normalized).unwrap_or_default();
        hasher.update(canonical.as_bytes());
        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Fingerprint(format!("{}:{}", target.type_key(), digest))
    }

    /// Wrap an already-rendered key (used when reading back persisted entries).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Fingerprint(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `service.operation` prefix.
    pub fn target_key(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }

    /// The hex digest part.
    pub fn digest(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical parameter name, also the flag name the transport renders.
pub(crate) fn normalize_key(key: &str) -> String {
    key.trim_start_matches('-')
        .chars()
        .map(|c| if c == '_' { '-' } else { c.to_ascii_lowercase() })
        .collect()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
