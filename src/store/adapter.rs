//! Compiled-procedure cache in front of a [`ScriptStore`].

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{Procedure, ScriptHandle, ScriptStore};
use crate::error::StoreError;

/// Wraps a store with one cached handle per procedure.
///
/// Handles are shared by every rule using the same algorithm. The only write
/// to the cache is a registration, and concurrent registrations of the same
/// source store the same handle, so the last writer wins harmlessly.
/// The adapter never retries; recovery from [`StoreError::NoScript`] is the
/// caller's decision.
pub struct ScriptAdapter {
    store: Arc<dyn ScriptStore>,
    handles: DashMap<(&'static str, u32), ScriptHandle>,
    timeout: Option<Duration>,
}

impl ScriptAdapter {
    /// Create an adapter over `store`.
    pub fn new(store: Arc<dyn ScriptStore>) -> Self {
        Self {
            store,
            handles: DashMap::new(),
            timeout: None,
        }
    }

    /// Bound every store round trip by `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn ScriptStore> {
        &self.store
    }

    /// Return the cached handle for `procedure`, loading it on first use.
    pub async fn register(&self, procedure: &Procedure) -> Result<ScriptHandle, StoreError> {
        if let Some(handle) = self.cached(procedure) {
            return Ok(handle);
        }
        self.reload(procedure).await
    }

    /// Load `procedure` into the store unconditionally and refresh the cache.
    pub async fn reload(&self, procedure: &Procedure) -> Result<ScriptHandle, StoreError> {
        let handle = self.bounded(self.store.load(procedure)).await?;
        debug!(procedure = %procedure.id(), handle = %handle, "Procedure registered");
        self.handles
            .insert((procedure.name, procedure.version), handle.clone());
        Ok(handle)
    }

    /// Run `procedure` against `key`, registering it first if needed.
    pub async fn invoke(
        &self,
        procedure: &Procedure,
        key: &str,
        args: &[i64],
    ) -> Result<i64, StoreError> {
        let handle = self.register(procedure).await?;
        trace!(procedure = %procedure.id(), key = %key, args = ?args, "Invoking procedure");
        self.bounded(self.store.invoke(&handle, key, args)).await
    }

    /// Release the store connection and forget cached handles.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.handles.clear();
        self.bounded(self.store.close()).await
    }

    fn cached(&self, procedure: &Procedure) -> Option<ScriptHandle> {
        self.handles
            .get(&(procedure.name, procedure.version))
            .map(|entry| entry.value().clone())
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                StoreError::Unavailable(format!("store call timed out after {:?}", limit))
            })?,
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeySpace, MemoryStore};
    use async_trait::async_trait;

    fn zero(_: &mut KeySpace<'_>, _: &[i64]) -> Result<i64, StoreError> {
        Ok(0)
    }

    static ZERO: Procedure = Procedure {
        name: "zero",
        version: 1,
        source: "return 0",
        native: zero,
    };

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptAdapter::new(store.clone());

        let first = adapter.register(&ZERO).await.unwrap();
        let second = adapter.register(&ZERO).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_always_reaches_store() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptAdapter::new(store.clone());

        let first = adapter.register(&ZERO).await.unwrap();
        let reloaded = adapter.reload(&ZERO).await.unwrap();

        assert_eq!(first, reloaded);
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn test_invoke_does_not_retry() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptAdapter::new(store.clone());

        assert_eq!(adapter.invoke(&ZERO, "k", &[]).await, Ok(0));
        store.evict_procedures();
        assert_eq!(
            adapter.invoke(&ZERO, "k", &[]).await,
            Err(StoreError::NoScript)
        );
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(ScriptAdapter::new(store.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let adapter = adapter.clone();
                tokio::spawn(async move { adapter.reload(&ZERO).await })
            })
            .collect();
        let handles: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert!(handles.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(adapter.register(&ZERO).await.unwrap(), handles[0]);
    }

    struct StalledStore;

    #[async_trait]
    impl ScriptStore for StalledStore {
        async fn load(&self, _: &Procedure) -> Result<ScriptHandle, StoreError> {
            Ok(ScriptHandle::new("stalled"))
        }

        async fn invoke(&self, _: &ScriptHandle, _: &str, _: &[i64]) -> Result<i64, StoreError> {
            std::future::pending().await
        }

        async fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_unavailable() {
        let adapter = ScriptAdapter::new(Arc::new(StalledStore))
            .with_timeout(Some(Duration::from_millis(50)));

        let result = adapter.invoke(&ZERO, "k", &[]).await;
        assert!(matches!(result, Err(StoreError::Unavailable(msg)) if msg.contains("timed out")));
    }
}
