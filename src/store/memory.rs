//! In-process shared store.
//!
//! Runs the native rendition of each registered procedure while holding the
//! map shard lock for the key, which gives the same per-key atomicity a
//! scripting store provides. Time is read from the tokio clock so paused
//! tests can drive expirations deterministically.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{KeySpace, NativeProcedure, Procedure, ScriptHandle, ScriptStore, Slot, StoredValue};
use crate::error::StoreError;

/// Invocations between sweeps of expired keys.
const SWEEP_EVERY: usize = 1024;

/// Shared store kept in process memory.
pub struct MemoryStore {
    /// Quota state indexed by key
    data: DashMap<String, Option<Slot>>,
    /// Registered procedures indexed by handle
    procedures: DashMap<ScriptHandle, NativeProcedure>,
    /// Origin of the store clock
    epoch: Instant,
    loads: AtomicUsize,
    invocations: AtomicUsize,
    available: AtomicBool,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            procedures: DashMap::new(),
            epoch: Instant::now(),
            loads: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Forget every registered procedure, as a scripting store does on restart.
    pub fn evict_procedures(&self) {
        debug!(count = self.procedures.len(), "Evicting registered procedures");
        self.procedures.clear();
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of `invoke` calls that reached a procedure.
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Read the live value of a key without running a procedure.
    pub fn peek(&self, key: &str) -> Option<StoredValue> {
        let now_ms = self.now_ms();
        let entry = self.data.get(key)?;
        entry
            .value()
            .as_ref()
            .filter(|slot| slot.is_live(now_ms))
            .map(|slot| slot.value.clone())
    }

    /// Number of keys currently holding live state.
    pub fn key_count(&self) -> usize {
        let now_ms = self.now_ms();
        self.data
            .iter()
            .filter(|e| e.value().as_ref().is_some_and(|slot| slot.is_live(now_ms)))
            .count()
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.now_ms();
        let before = self.data.len();
        self.data
            .retain(|_, slot| slot.as_ref().is_some_and(|slot| slot.is_live(now_ms)));
        let removed = before.saturating_sub(self.data.len());
        if removed > 0 {
            debug!(removed, "Purged expired keys");
        }
        removed
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn ensure_reachable(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is closed".to_string()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn load(&self, procedure: &Procedure) -> Result<ScriptHandle, StoreError> {
        self.ensure_reachable()?;
        self.loads.fetch_add(1, Ordering::SeqCst);

        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, procedure.source.as_bytes());
        let handle = ScriptHandle::new(digest.simple().to_string());
        self.procedures.insert(handle.clone(), procedure.native);

        debug!(procedure = %procedure.id(), handle = %handle, "Procedure loaded");
        Ok(handle)
    }

    async fn invoke(
        &self,
        handle: &ScriptHandle,
        key: &str,
        args: &[i64],
    ) -> Result<i64, StoreError> {
        self.ensure_reachable()?;
        let native = match self.procedures.get(handle) {
            Some(entry) => *entry.value(),
            None => return Err(StoreError::NoScript),
        };
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;

        let now_ms = self.now_ms();
        let (reply, emptied) = {
            let mut entry = self.data.entry(key.to_string()).or_insert(None);
            let mut space = KeySpace::new(entry.value_mut(), now_ms);
            let reply = native(&mut space, args);
            (reply, space.value().is_none())
        };
        if emptied {
            self.data.remove_if(key, |_, slot| slot.is_none());
        }
        if invocation % SWEEP_EVERY == 0 {
            self.purge_expired();
        }

        trace!(key = %key, reply = ?reply, "Procedure invoked");
        reply
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        self.procedures.clear();
        self.data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bump(space: &mut KeySpace<'_>, args: &[i64]) -> Result<i64, StoreError> {
        let next = match space.value() {
            Some(StoredValue::Counter(n)) => n + 1,
            _ => 1,
        };
        space.set(StoredValue::Counter(next));
        if next == 1 {
            space.pexpire(super::super::arg(args, 0)?);
        }
        Ok(next)
    }

    static BUMP: Procedure = Procedure {
        name: "bump",
        version: 1,
        source: "return redis.call('INCR', KEYS[1])",
        native: bump,
    };

    #[tokio::test]
    async fn test_load_is_deterministic() {
        let store = MemoryStore::new();
        let first = store.load(&BUMP).await.unwrap();
        let second = store.load(&BUMP).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn test_invoke_unknown_handle() {
        let store = MemoryStore::new();
        let result = store.invoke(&ScriptHandle::new("missing"), "k", &[]).await;
        assert_eq!(result, Err(StoreError::NoScript));
    }

    #[tokio::test]
    async fn test_eviction_loses_procedures() {
        let store = MemoryStore::new();
        let handle = store.load(&BUMP).await.unwrap();
        assert_eq!(store.invoke(&handle, "k", &[1000]).await, Ok(1));

        store.evict_procedures();
        assert_eq!(
            store.invoke(&handle, "k", &[1000]).await,
            Err(StoreError::NoScript)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_expire() {
        let store = MemoryStore::new();
        let handle = store.load(&BUMP).await.unwrap();

        assert_eq!(store.invoke(&handle, "k", &[1000]).await, Ok(1));
        assert_eq!(store.invoke(&handle, "k", &[1000]).await, Ok(2));
        assert_eq!(store.peek("k"), Some(StoredValue::Counter(2)));

        tokio::time::advance(std::time::Duration::from_millis(1000)).await;
        assert_eq!(store.peek("k"), None);
        assert_eq!(store.invoke(&handle, "k", &[1000]).await, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_swept() {
        let store = MemoryStore::new();
        let handle = store.load(&BUMP).await.unwrap();

        for client in 0..SWEEP_EVERY - 1 {
            let key = format!("client-{}", client);
            assert_eq!(store.invoke(&handle, &key, &[1000]).await, Ok(1));
        }
        assert_eq!(store.key_count(), SWEEP_EVERY - 1);

        tokio::time::advance(std::time::Duration::from_secs(60)).await;
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.peek("client-0"), None);

        // The next invocation completes a sweep interval.
        assert_eq!(store.invoke(&handle, "fresh", &[1000]).await, Ok(1));
        assert_eq!(store.data.len(), 1);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_keeps_live_keys() {
        let store = MemoryStore::new();
        let handle = store.load(&BUMP).await.unwrap();

        store.invoke(&handle, "short", &[100]).await.unwrap();
        store.invoke(&handle, "long", &[10_000]).await.unwrap();
        tokio::time::advance(std::time::Duration::from_millis(500)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.peek("long"), Some(StoredValue::Counter(1)));
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_and_closed() {
        let store = MemoryStore::new();
        let handle = store.load(&BUMP).await.unwrap();

        store.set_available(false);
        assert!(matches!(
            store.invoke(&handle, "k", &[1000]).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert_eq!(store.invoke(&handle, "k", &[1000]).await, Ok(1));

        store.close().await.unwrap();
        assert!(matches!(
            store.load(&BUMP).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.key_count(), 0);
    }
}
