//! Core rate limiter implementation.
//!
//! A [`RateLimiter`] is one rule: an algorithm with its parameters, a unique
//! rule id, and optional identifier and callback overrides. Each check runs
//! in a single pass: resolve the identity, derive the quota key, evaluate the
//! algorithm's procedure on the shared store, and decode the verdict.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::algorithm::{QuotaAlgorithm, Verdict};
use super::callback::BlockCallback;
use super::fixed_window::{FixedWindow, WindowSpec};
use super::identity::Identifier;
use super::token_bucket::TokenBucket;
use crate::error::{LimiterError, Result, StoreError};
use crate::registry::{Context, FailurePolicy, Registry};

/// Identity of one rule instance, part of every quota key it owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleId(String);

impl RuleId {
    /// A declared name; stable across restarts.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A random id, unique for the lifetime of the process.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store key naming one (identifier, rule) pair: `{prefix}:{identifier}:{rule}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey(String);

impl QuotaKey {
    pub fn new(prefix: &str, identifier: &str, rule: &RuleId) -> Self {
        Self(format!("{}:{}:{}", prefix, identifier, rule))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One quota rule.
pub struct RateLimiter<R: Sync> {
    id: RuleId,
    algorithm: Arc<dyn QuotaAlgorithm>,
    identifier: Option<Arc<dyn Identifier<R>>>,
    callback: Option<Arc<dyn BlockCallback<R>>>,
}

impl<R: Sync + 'static> RateLimiter<R> {
    /// Create a rule with a generated id.
    pub fn new(algorithm: impl QuotaAlgorithm + 'static) -> Self {
        Self {
            id: RuleId::generate(),
            algorithm: Arc::new(algorithm),
            identifier: None,
            callback: None,
        }
    }

    /// Allow `times` requests per `window`.
    pub fn fixed_window(times: i64, window: WindowSpec) -> Result<Self> {
        Ok(Self::new(FixedWindow::new(times, window)?))
    }

    /// Token bucket of `capacity`, refilled at `refill_rate` tokens per second.
    pub fn token_bucket(capacity: i64, refill_rate: i64) -> Result<Self> {
        Ok(Self::new(TokenBucket::new(capacity, refill_rate)?))
    }

    /// Use a declared name as the rule id.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.id = RuleId::named(name);
        self
    }

    /// Override the registry's identifier for this rule.
    pub fn with_identifier(mut self, identifier: impl Identifier<R> + 'static) -> Self {
        self.identifier = Some(Arc::new(identifier));
        self
    }

    /// Override the registry's block callback for this rule.
    pub fn with_callback(mut self, callback: impl BlockCallback<R> + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn id(&self) -> &RuleId {
        &self.id
    }

    pub fn algorithm(&self) -> &dyn QuotaAlgorithm {
        self.algorithm.as_ref()
    }

    /// Evaluate the rule for `request` without invoking any callback.
    pub async fn check(&self, registry: &Registry<R>, request: &R) -> Result<Verdict> {
        let context = registry.context()?;
        let key = self.key_for(&context, request).await;
        self.check_key(&context, &key).await
    }

    /// Evaluate the rule and hand a blocked verdict to the callback.
    ///
    /// Returns the verdict when the request may proceed (including blocked
    /// verdicts the callback chose to let through); a rejecting callback's
    /// error is returned as is.
    pub async fn enforce(&self, registry: &Registry<R>, request: &R) -> Result<Verdict> {
        let context = registry.context()?;
        let key = self.key_for(&context, request).await;
        let verdict = self.check_key(&context, &key).await?;

        if let Verdict::Blocked { wait_ms } = verdict {
            let callback = self.callback.as_ref().unwrap_or(context.callback());
            callback.on_blocked(request, wait_ms).await?;
        }
        Ok(verdict)
    }

    /// Derive the quota key for `request`.
    pub async fn key_for(&self, context: &Context<R>, request: &R) -> QuotaKey {
        let identifier = self.identifier.as_ref().unwrap_or(context.identifier());
        let identity = identifier.identify(request).await;
        QuotaKey::new(context.prefix(), &identity, &self.id)
    }

    /// Evaluate the rule against an already derived key.
    pub async fn check_key(&self, context: &Context<R>, key: &QuotaKey) -> Result<Verdict> {
        if self.algorithm.is_disabled() {
            trace!(key = %key, rule = %self.id, "Rule disabled, admitting");
            return Ok(Verdict::Admitted);
        }

        trace!(key = %key, rule = %self.id, "Checking rate limit");

        match self.run_procedure(context, key).await {
            Ok(reply) => {
                let verdict = self.algorithm.decode(reply);
                if let Verdict::Blocked { wait_ms } = verdict {
                    debug!(key = %key, rule = %self.id, wait_ms = wait_ms, "Rate limit exceeded");
                }
                Ok(verdict)
            }
            Err(StoreError::Script(reason)) => {
                error!(key = %key, rule = %self.id, %reason, "Procedure failed");
                Err(LimiterError::ProcedureFailed(reason))
            }
            Err(err) => match context.failure_policy() {
                FailurePolicy::Closed => {
                    warn!(key = %key, rule = %self.id, error = %err, "Store failure, rejecting");
                    Err(LimiterError::from(err))
                }
                FailurePolicy::Open => {
                    warn!(key = %key, rule = %self.id, error = %err, "Store failure, admitting");
                    Ok(Verdict::Admitted)
                }
            },
        }
    }

    /// Invoke the procedure, reloading it once if the store lost it.
    async fn run_procedure(
        &self,
        context: &Context<R>,
        key: &QuotaKey,
    ) -> std::result::Result<i64, StoreError> {
        let procedure = self.algorithm.procedure();
        let args = self.algorithm.arguments();
        let adapter = context.adapter();

        match adapter.invoke(procedure, key.as_str(), &args).await {
            Err(StoreError::NoScript) => {
                warn!(procedure = %procedure.id(), "Procedure missing from store, reloading");
                adapter.reload(procedure).await?;
                match adapter.invoke(procedure, key.as_str(), &args).await {
                    Err(StoreError::NoScript) => Err(StoreError::Unavailable(format!(
                        "procedure {} missing again after reload",
                        procedure.id()
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }
}

impl<R: Sync> fmt::Debug for RateLimiter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("identifier", &self.identifier.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
