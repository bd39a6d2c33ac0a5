//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{build_rules, RateLimiter, RuleConfig};
use crate::registry::{FailurePolicy, LimiterOptions, DEFAULT_PREFIX};

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Limiter defaults
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Shared store connection
    #[serde(default)]
    pub store: StoreSettings,

    /// Declared rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Limiter defaults applied when the registry is initialised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Prefix of every quota key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Behaviour when the store cannot decide
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Deadline for each store round trip in milliseconds
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            failure_policy: FailurePolicy::default(),
            store_timeout_ms: None,
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl LimiterSettings {
    /// The store deadline, if configured.
    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout_ms.map(Duration::from_millis)
    }

    /// Apply these settings on top of `options`.
    pub fn apply<R: Sync + 'static>(&self, options: LimiterOptions<R>) -> LimiterOptions<R> {
        options
            .prefix(self.prefix.clone())
            .failure_policy(self.failure_policy)
            .store_timeout(self.store_timeout())
    }
}

/// Shared store connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Redis URL; the in-memory store is used when absent
    #[serde(default)]
    pub url: Option<String>,
}

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))?;
        if config.limiter.prefix.is_empty() {
            return Err(LimiterError::Config("limiter.prefix must not be empty".to_string()));
        }
        Ok(config)
    }

    /// Build every declared rule.
    pub fn build_rules<R: Sync + 'static>(&self) -> Result<Vec<RateLimiter<R>>> {
        build_rules(&self.rules)
    }

    /// Find a declared rule by name.
    pub fn rule(&self, name: &str) -> Option<&RuleConfig> {
        self.rules.iter().find(|rule| rule.name == name)
    }
}
