//! Shared store adapter.
//!
//! The shared store is treated as an opaque executor of short server-side
//! procedures. A procedure is registered once, then invoked by handle against
//! a single key; the store guarantees the invocation does not interleave with
//! any other operation on that key.

mod adapter;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use adapter::ScriptAdapter;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::fmt;

use crate::error::StoreError;

/// Longest expiry a procedure may set, in milliseconds (100 years).
///
/// Rules whose state would outlive this are rejected when they are built.
pub const MAX_TTL_MS: i64 = 100 * 365 * 24 * 3_600_000;

/// Opaque reference to a procedure compiled by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    /// Wrap a store-issued handle.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The raw handle as issued by the store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Native rendition of a procedure, run by in-process stores under the key lock.
pub type NativeProcedure = fn(&mut KeySpace<'_>, &[i64]) -> Result<i64, StoreError>;

/// A versioned atomic procedure.
///
/// `source` is registered verbatim with scripting stores. Its argument order
/// and single-integer reply (`0` admitted, `> 0` milliseconds to wait) are a
/// compatibility surface tied to `version`.
pub struct Procedure {
    /// Stable procedure name, also the cache key together with `version`
    pub name: &'static str,
    /// Bumped whenever arguments or reply change
    pub version: u32,
    /// Script text as registered with the store
    pub source: &'static str,
    /// Equivalent native body for stores that cannot run `source`
    pub native: NativeProcedure,
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Procedure {
    /// Identifier used for logging and cache lookups, e.g. `fixed_window@v1`.
    pub fn id(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }
}

/// A value held by the store under one quota key.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// An integer counter
    Counter(i64),
    /// Token bucket state: fractional tokens and the last refill time in ms
    Bucket { tokens: f64, refilled_at_ms: i64 },
}

/// A stored value with its absolute expiry on the store clock.
#[derive(Debug, Clone)]
pub struct Slot {
    pub value: StoredValue,
    pub expires_at_ms: Option<i64>,
}

/// Exclusive view of one key while a native procedure runs.
pub struct KeySpace<'a> {
    slot: &'a mut Option<Slot>,
    now_ms: i64,
}

impl<'a> KeySpace<'a> {
    /// Open a view at store time `now_ms`, dropping the value if it expired.
    pub fn new(slot: &'a mut Option<Slot>, now_ms: i64) -> Self {
        if slot.as_ref().is_some_and(|s| !s.is_live(now_ms)) {
            *slot = None;
        }
        Self { slot, now_ms }
    }

    /// Current store time in milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// The live value, if any.
    pub fn value(&self) -> Option<&StoredValue> {
        self.slot.as_ref().map(|s| &s.value)
    }

    /// Replace the value, keeping any existing expiry.
    pub fn set(&mut self, value: StoredValue) {
        let expires_at_ms = self.slot.as_ref().and_then(|s| s.expires_at_ms);
        *self.slot = Some(Slot {
            value,
            expires_at_ms,
        });
    }

    /// Set the time-to-live of the live value in milliseconds.
    ///
    /// A non-positive TTL deletes the value, as `PEXPIRE` does.
    pub fn pexpire(&mut self, ttl_ms: i64) {
        if ttl_ms <= 0 {
            *self.slot = None;
            return;
        }
        let now_ms = self.now_ms;
        if let Some(slot) = self.slot.as_mut() {
            slot.expires_at_ms = Some(now_ms.saturating_add(ttl_ms));
        }
    }

    /// Remaining time-to-live: `-2` when absent, `-1` when it never expires.
    pub fn pttl(&self) -> i64 {
        match self.slot.as_ref() {
            None => -2,
            Some(Slot {
                expires_at_ms: None,
                ..
            }) => -1,
            Some(Slot {
                expires_at_ms: Some(at),
                ..
            }) => at - self.now_ms,
        }
    }
}

impl Slot {
    /// Whether the value is still live at store time `now_ms`.
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |at| at > now_ms)
    }
}

/// Read a positional integer argument.
pub fn arg(args: &[i64], index: usize) -> Result<i64, StoreError> {
    args.get(index)
        .copied()
        .ok_or_else(|| StoreError::Script(format!("missing argument #{}", index + 1)))
}

/// A store able to register and run atomic procedures.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Compile `procedure`, returning its handle. Identical sources yield identical handles.
    async fn load(&self, procedure: &Procedure) -> Result<ScriptHandle, StoreError>;

    /// Run a previously loaded procedure against `key`.
    ///
    /// Fails with [`StoreError::NoScript`] when the store lost the procedure.
    async fn invoke(
        &self,
        handle: &ScriptHandle,
        key: &str,
        args: &[i64],
    ) -> Result<i64, StoreError>;

    /// Release the connection to the store.
    async fn close(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_slot_is_cleared() {
        let mut slot = Some(Slot {
            value: StoredValue::Counter(3),
            expires_at_ms: Some(100),
        });
        let space = KeySpace::new(&mut slot, 100);
        assert!(space.value().is_none());
        assert_eq!(space.pttl(), -2);
    }

    #[test]
    fn test_set_keeps_expiry() {
        let mut slot = None;
        let mut space = KeySpace::new(&mut slot, 10);
        space.set(StoredValue::Counter(1));
        assert_eq!(space.pttl(), -1);
        space.pexpire(500);
        space.set(StoredValue::Counter(2));
        assert_eq!(space.pttl(), 500);
        assert_eq!(space.value(), Some(&StoredValue::Counter(2)));
    }

    #[test]
    fn test_expiry_saturates_near_clock_limit() {
        let mut slot = None;
        let mut space = KeySpace::new(&mut slot, i64::MAX - 10);
        space.set(StoredValue::Counter(1));
        space.pexpire(MAX_TTL_MS);
        assert_eq!(space.pttl(), 10);
        assert!(space.value().is_some());
    }

    #[test]
    fn test_non_positive_expiry_deletes() {
        let mut slot = None;
        let mut space = KeySpace::new(&mut slot, 10);
        space.set(StoredValue::Counter(1));
        space.pexpire(0);
        assert!(space.value().is_none());
        assert_eq!(space.pttl(), -2);
    }

    #[test]
    fn test_missing_argument() {
        assert_eq!(arg(&[7], 0), Ok(7));
        assert!(matches!(arg(&[7], 1), Err(StoreError::Script(_))));
    }
}
