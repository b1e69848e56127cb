//! Endpoint rate limit policies.
//!
//! Policies are looked up by exact endpoint path. Paths without an entry get
//! the default policy. The built-in table can be replaced from YAML at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ServiceError};

/// A fixed-window limit: at most `max_requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_requests: u64,
}

impl RateLimitPolicy {
    pub const fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

const MINUTE: Duration = Duration::from_secs(60);

/// Uploads are expensive: low ceiling, short window.
const UPLOAD_POLICY: RateLimitPolicy = RateLimitPolicy::new(MINUTE, 10);
/// Provider webhooks retry in bursts.
const WEBHOOK_POLICY: RateLimitPolicy = RateLimitPolicy::new(MINUTE, 50);
const DEFAULT_POLICY: RateLimitPolicy = RateLimitPolicy::new(Duration::from_secs(15 * 60), 100);

const BUILTIN_POLICIES: &[(&str, RateLimitPolicy)] = &[
    ("/api/upload-photo", UPLOAD_POLICY),
    ("/api/upload", UPLOAD_POLICY),
    ("/api/webhooks/stripe", WEBHOOK_POLICY),
    ("/api/webhooks/shopify", WEBHOOK_POLICY),
];

/// Endpoint path to policy lookup table with a default entry.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    endpoints: HashMap<String, RateLimitPolicy>,
    default: RateLimitPolicy,
}

/// On-disk form of a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests allowed per window
    pub max_requests: u64,
}

impl From<PolicyRule> for RateLimitPolicy {
    fn from(rule: PolicyRule) -> Self {
        RateLimitPolicy::new(Duration::from_millis(rule.window_ms), rule.max_requests)
    }
}

/// On-disk form of a policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTable {
    pub default: PolicyRule,
    #[serde(default)]
    pub endpoints: HashMap<String, PolicyRule>,
}

impl PolicyRegistry {
    /// The compiled-in policy table.
    pub fn builtin() -> Self {
        Self {
            endpoints: BUILTIN_POLICIES
                .iter()
                .map(|(path, policy)| (path.to_string(), *policy))
                .collect(),
            default: DEFAULT_POLICY,
        }
    }

    /// A registry with only a default policy.
    pub fn with_default(default: RateLimitPolicy) -> Self {
        Self {
            endpoints: HashMap::new(),
            default,
        }
    }

    /// Add or replace the policy for an endpoint path.
    pub fn insert(mut self, endpoint: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.endpoints.insert(endpoint.into(), policy);
        self
    }

    /// Load a policy table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: PolicyTable = serde_yaml::from_str(yaml)
            .map_err(|e| ServiceError::Config(format!("Failed to parse policy table: {}", e)))?;
        Self::from_table(table)
    }

    fn from_table(table: PolicyTable) -> Result<Self> {
        let rules = std::iter::once(("default", &table.default))
            .chain(table.endpoints.iter().map(|(path, rule)| (path.as_str(), rule)));
        for (name, rule) in rules {
            if rule.window_ms == 0 {
                return Err(ServiceError::Config(format!(
                    "Policy '{}' has a zero-length window",
                    name
                )));
            }
        }

        Ok(Self {
            endpoints: table
                .endpoints
                .into_iter()
                .map(|(path, rule)| (path, rule.into()))
                .collect(),
            default: table.default.into(),
        })
    }

    /// The policy for an endpoint path. Never fails.
    pub fn resolve(&self, endpoint: &str) -> RateLimitPolicy {
        self.endpoints.get(endpoint).copied().unwrap_or(self.default)
    }

    pub fn default_policy(&self) -> RateLimitPolicy {
        self.default
    }

    /// Number of endpoint-specific entries.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
