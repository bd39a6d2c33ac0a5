//! Rule declarations and ordered rule composition.
//!
//! Rules can be declared in YAML:
//!
//! ```yaml
//! rules:
//!   - name: burst
//!     fixed_window:
//!       times: 2
//!       seconds: 5
//!   - name: sustained
//!     token_bucket:
//!       capacity: 100
//!       refill_rate: 10
//! ```
//!
//! Declared names become rule ids, so counters keep their continuity across
//! restarts and deployments.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::algorithm::Verdict;
use super::fixed_window::{FixedWindow, WindowSpec};
use super::limiter::RateLimiter;
use super::token_bucket::{TokenBucket, TokenBucketSpec};
use crate::error::{LimiterError, Result};
use crate::registry::Registry;

/// Fixed-window parameters as declared in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowSpec {
    /// Requests allowed per window
    #[serde(default = "default_times")]
    pub times: i64,
    /// Window length components
    #[serde(flatten)]
    pub window: WindowSpec,
}

fn default_times() -> i64 {
    1
}

/// A single declared rule. Exactly one algorithm must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name, used as the rule id in quota keys
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_window: Option<FixedWindowSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_bucket: Option<TokenBucketSpec>,
}

impl RuleConfig {
    /// Validate the declaration and build the rule.
    pub fn build<R: Sync + 'static>(&self) -> Result<RateLimiter<R>> {
        if self.name.trim().is_empty() {
            return Err(LimiterError::InvalidRuleParameter(
                "rule name must not be empty".to_string(),
            ));
        }

        let rule = match (&self.fixed_window, &self.token_bucket) {
            (Some(spec), None) => RateLimiter::new(FixedWindow::new(spec.times, spec.window)?),
            (None, Some(spec)) => RateLimiter::new(TokenBucket::try_from(*spec)?),
            (None, None) => {
                return Err(LimiterError::InvalidRuleParameter(format!(
                    "rule '{}' declares no algorithm",
                    self.name
                )))
            }
            (Some(_), Some(_)) => {
                return Err(LimiterError::InvalidRuleParameter(format!(
                    "rule '{}' declares more than one algorithm",
                    self.name
                )))
            }
        };

        Ok(rule.named(self.name.clone()))
    }
}

/// Build every declared rule, rejecting duplicate names.
pub fn build_rules<R: Sync + 'static>(configs: &[RuleConfig]) -> Result<Vec<RateLimiter<R>>> {
    let mut seen = HashSet::new();
    configs
        .iter()
        .map(|config| {
            if !seen.insert(config.name.as_str()) {
                return Err(LimiterError::InvalidRuleParameter(format!(
                    "duplicate rule name '{}'",
                    config.name
                )));
            }
            config.build()
        })
        .collect()
}

/// Rules applied to one endpoint, evaluated in declaration order.
pub struct RuleChain<R: Sync> {
    rules: Vec<RateLimiter<R>>,
}

impl<R: Sync + 'static> RuleChain<R> {
    pub fn new(rules: Vec<RateLimiter<R>>) -> Self {
        Self { rules }
    }

    /// Append a rule evaluated after the existing ones.
    pub fn push(&mut self, rule: RateLimiter<R>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[RateLimiter<R>] {
        &self.rules
    }

    /// Return the first blocked verdict; later rules are not evaluated.
    pub async fn check(&self, registry: &Registry<R>, request: &R) -> Result<Verdict> {
        for rule in &self.rules {
            let verdict = rule.check(registry, request).await?;
            if !verdict.is_admitted() {
                return Ok(verdict);
            }
        }
        Ok(Verdict::Admitted)
    }

    /// Enforce each rule in turn, stopping at the first rejection.
    ///
    /// Blocked verdicts that a callback lets through do not stop evaluation;
    /// the first of them is returned.
    pub async fn enforce(&self, registry: &Registry<R>, request: &R) -> Result<Verdict> {
        let mut outcome = Verdict::Admitted;
        for rule in &self.rules {
            let verdict = rule.enforce(registry, request).await?;
            if outcome.is_admitted() {
                outcome = verdict;
            }
        }
        Ok(outcome)
    }
}

impl<R: Sync + 'static> From<Vec<RateLimiter<R>>> for RuleChain<R> {
    fn from(rules: Vec<RateLimiter<R>>) -> Self {
        Self::new(rules)
    }
}
