//! Process-wide limiter configuration with an explicit init/close lifecycle.
//!
//! A [`Registry`] is created once (typically in a `static` or shared `Arc`),
//! initialised at startup with a store and defaults, and closed at shutdown.
//! Every check resolves the current [`Context`] from it; using the registry
//! before `init` or after `close` fails with [`LimiterError::NotInitialized`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{LimiterError, Result};
use crate::ratelimit::{BlockCallback, DefaultIdentifier, Identifier, RejectCallback, RequestParts};
use crate::store::{ScriptAdapter, ScriptStore};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "tollgate";

/// What a check reports when the store cannot produce a decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Surface [`LimiterError::StoreUnavailable`] to the caller
    #[default]
    Closed,
    /// Admit the request and log the failure
    Open,
}

/// Defaults applied by [`Registry::init`].
pub struct LimiterOptions<R: Sync> {
    prefix: String,
    identifier: Arc<dyn Identifier<R>>,
    callback: Arc<dyn BlockCallback<R>>,
    failure_policy: FailurePolicy,
    store_timeout: Option<Duration>,
}

impl<R: Sync + 'static> LimiterOptions<R> {
    /// Options using `identifier` as the default identity strategy.
    pub fn new(identifier: impl Identifier<R> + 'static) -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            identifier: Arc::new(identifier),
            callback: Arc::new(RejectCallback),
            failure_policy: FailurePolicy::default(),
            store_timeout: None,
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn callback(mut self, callback: impl BlockCallback<R> + 'static) -> Self {
        self.callback = Arc::new(callback);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }
}

impl<R: RequestParts + Sync + 'static> Default for LimiterOptions<R> {
    fn default() -> Self {
        Self::new(DefaultIdentifier)
    }
}

/// Configuration resolved by every check.
pub struct Context<R: Sync> {
    adapter: ScriptAdapter,
    prefix: String,
    identifier: Arc<dyn Identifier<R>>,
    callback: Arc<dyn BlockCallback<R>>,
    failure_policy: FailurePolicy,
}

impl<R: Sync> Context<R> {
    pub fn adapter(&self) -> &ScriptAdapter {
        &self.adapter
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn identifier(&self) -> &Arc<dyn Identifier<R>> {
        &self.identifier
    }

    pub fn callback(&self) -> &Arc<dyn BlockCallback<R>> {
        &self.callback
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }
}

/// Holder of the process-wide [`Context`].
pub struct Registry<R: Sync> {
    current: RwLock<Option<Arc<Context<R>>>>,
}

impl<R: Sync + 'static> Registry<R> {
    /// Create an uninitialised registry.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    /// Install `store` and `options`, replacing any previous configuration.
    pub fn init(&self, store: Arc<dyn ScriptStore>, options: LimiterOptions<R>) {
        let context = Context {
            adapter: ScriptAdapter::new(store).with_timeout(options.store_timeout),
            prefix: options.prefix,
            identifier: options.identifier,
            callback: options.callback,
            failure_policy: options.failure_policy,
        };

        info!(
            prefix = %context.prefix,
            failure_policy = ?context.failure_policy,
            "Limiter registry initialized"
        );

        let previous = self.current.write().replace(Arc::new(context));
        if previous.is_some() {
            debug!("Replaced previous limiter configuration");
        }
    }

    /// Release the store connection. Later checks fail with `NotInitialized`.
    pub async fn close(&self) -> Result<()> {
        let context = self.current.write().take();
        match context {
            Some(context) => {
                context.adapter.close().await?;
                info!("Limiter registry closed");
            }
            None => debug!("Limiter registry already closed"),
        }
        Ok(())
    }

    /// The current context.
    pub fn context(&self) -> Result<Arc<Context<R>>> {
        self.current
            .read()
            .clone()
            .ok_or(LimiterError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.current.read().is_some()
    }
}

impl<R: Sync + 'static> Default for Registry<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RequestMeta;
    use crate::store::MemoryStore;
    use tokio_test::assert_ok;

    #[test]
    fn test_uninitialized_registry() {
        let registry: Registry<RequestMeta> = Registry::new();
        assert!(!registry.is_initialized());
        assert!(matches!(
            registry.context(),
            Err(LimiterError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_init_and_close() {
        let registry: Registry<RequestMeta> = Registry::new();
        let store = Arc::new(MemoryStore::new());
        registry.init(store.clone(), LimiterOptions::default());

        let context = assert_ok!(registry.context());
        assert_eq!(context.prefix(), DEFAULT_PREFIX);
        assert_eq!(context.failure_policy(), FailurePolicy::Closed);

        assert_ok!(registry.close().await);
        assert!(!registry.is_initialized());
        assert!(matches!(
            registry.context(),
            Err(LimiterError::NotInitialized)
        ));

        // Closing twice is harmless.
        assert_ok!(registry.close().await);
    }

    #[tokio::test]
    async fn test_reinit_overwrites() {
        let registry: Registry<RequestMeta> = Registry::new();
        registry.init(
            Arc::new(MemoryStore::new()),
            LimiterOptions::default().prefix("first"),
        );
        registry.init(
            Arc::new(MemoryStore::new()),
            LimiterOptions::default()
                .prefix("second")
                .failure_policy(FailurePolicy::Open),
        );

        let context = registry.context().unwrap();
        assert_eq!(context.prefix(), "second");
        assert_eq!(context.failure_policy(), FailurePolicy::Open);
    }

    #[test]
    fn test_failure_policy_serde() {
        let policy: FailurePolicy = serde_yaml::from_str("open").unwrap();
        assert_eq!(policy, FailurePolicy::Open);
        assert_eq!(serde_yaml::to_string(&FailurePolicy::Closed).unwrap().trim(), "closed");
    }
}
