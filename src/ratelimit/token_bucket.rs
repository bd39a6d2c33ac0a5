//! Token-bucket quota.
//!
//! A bucket starts full at `capacity` tokens and refills continuously at
//! `refill_rate` tokens per second. Each admitted request consumes one token.
//! Refill and consumption happen inside the same atomic procedure, reading
//! the store's clock, so concurrent callers can never share a token.

use serde::{Deserialize, Serialize};

use super::algorithm::QuotaAlgorithm;
use crate::error::{LimiterError, Result, StoreError};
use crate::store::{arg, KeySpace, Procedure, StoredValue, MAX_TTL_MS};

/// Atomic token-bucket procedure. Arguments: `capacity`, `refill_rate` (tokens/s).
pub static TOKEN_BUCKET: Procedure = Procedure {
    name: "token_bucket",
    version: 1,
    source: include_str!("../../lua/token_bucket.lua"),
    native: evaluate,
};

fn evaluate(space: &mut KeySpace<'_>, args: &[i64]) -> std::result::Result<i64, StoreError> {
    let capacity = arg(args, 0)? as f64;
    let rate = arg(args, 1)? as f64;
    let now = space.now_ms();

    let (tokens, refilled_at) = match space.value() {
        None => (capacity, now),
        Some(StoredValue::Bucket {
            tokens,
            refilled_at_ms,
        }) => (*tokens, *refilled_at_ms),
        Some(_) => {
            return Err(StoreError::Script(
                "WRONGTYPE key holds a non-bucket value".to_string(),
            ))
        }
    };

    let elapsed = (now - refilled_at).max(0) as f64;
    let mut tokens = (tokens + elapsed * rate / 1000.0).min(capacity);

    let wait = if tokens >= 1.0 {
        tokens -= 1.0;
        0
    } else {
        ((1.0 - tokens) * 1000.0 / rate).ceil() as i64
    };

    space.set(StoredValue::Bucket {
        tokens,
        refilled_at_ms: now,
    });
    space.pexpire((capacity * 1000.0 / rate).ceil() as i64);
    Ok(wait)
}

/// Milliseconds to refill an empty bucket, which is also the state's TTL.
fn refill_time_ms(capacity: i64, refill_rate: i64) -> Option<i64> {
    let ms = capacity.checked_mul(1000)?;
    Some((ms - 1) / refill_rate + 1)
}

/// Token-bucket parameters as declared in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketSpec {
    pub capacity: i64,
    pub refill_rate: i64,
}

/// Token-bucket algorithm parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucket {
    capacity: i64,
    refill_rate: i64,
}

impl TokenBucket {
    /// Hold up to `capacity` tokens, refilling `refill_rate` tokens per second.
    pub fn new(capacity: i64, refill_rate: i64) -> Result<Self> {
        if capacity < 1 {
            return Err(LimiterError::InvalidRuleParameter(format!(
                "capacity must be >= 1, got {}",
                capacity
            )));
        }
        if refill_rate < 1 {
            return Err(LimiterError::InvalidRuleParameter(format!(
                "refill_rate must be >= 1, got {}",
                refill_rate
            )));
        }
        match refill_time_ms(capacity, refill_rate) {
            Some(ttl_ms) if ttl_ms <= MAX_TTL_MS => {}
            _ => {
                return Err(LimiterError::InvalidRuleParameter(format!(
                    "refilling {} tokens at {}/s takes longer than {}ms",
                    capacity, refill_rate, MAX_TTL_MS
                )))
            }
        }
        Ok(Self {
            capacity,
            refill_rate,
        })
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> i64 {
        self.refill_rate
    }
}

impl TryFrom<TokenBucketSpec> for TokenBucket {
    type Error = LimiterError;

    fn try_from(spec: TokenBucketSpec) -> Result<Self> {
        TokenBucket::new(spec.capacity, spec.refill_rate)
    }
}

impl QuotaAlgorithm for TokenBucket {
    fn procedure(&self) -> &'static Procedure {
        &TOKEN_BUCKET
    }

    fn arguments(&self) -> Vec<i64> {
        vec![self.capacity, self.refill_rate]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Verdict;
    use crate::store::{MemoryStore, ScriptAdapter};
    use std::sync::Arc;
    use std::time::Duration;

    async fn check(adapter: &ScriptAdapter, algorithm: &TokenBucket, key: &str) -> Verdict {
        let reply = adapter
            .invoke(algorithm.procedure(), key, &algorithm.arguments())
            .await
            .unwrap();
        algorithm.decode(reply)
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(matches!(
            TokenBucket::new(0, 1),
            Err(LimiterError::InvalidRuleParameter(_))
        ));
        assert!(matches!(
            TokenBucket::new(1, 0),
            Err(LimiterError::InvalidRuleParameter(_))
        ));
        assert!(TokenBucket::try_from(TokenBucketSpec {
            capacity: 5,
            refill_rate: 1
        })
        .is_ok());
    }

    #[test]
    fn test_rejects_state_outliving_max_expiry() {
        assert!(matches!(
            TokenBucket::new(i64::MAX, 1),
            Err(LimiterError::InvalidRuleParameter(_))
        ));
        assert!(TokenBucket::new(MAX_TTL_MS / 1000 + 1, 1).is_err());
        assert!(TokenBucket::new(MAX_TTL_MS / 1000, 1).is_ok());
        // A faster refill shortens the TTL.
        assert!(TokenBucket::new(MAX_TTL_MS / 1000 + 1, 2).is_ok());
    }

    #[test]
    fn test_refill_time_rounds_up() {
        assert_eq!(refill_time_ms(5, 1), Some(5000));
        assert_eq!(refill_time_ms(1, 3), Some(334));
        assert_eq!(refill_time_ms(i64::MAX, 1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let adapter = ScriptAdapter::new(Arc::new(MemoryStore::new()));
        let algorithm = TokenBucket::new(5, 1).unwrap();

        for i in 1..=5 {
            assert_eq!(
                check(&adapter, &algorithm, "k").await,
                Verdict::Admitted,
                "request {} should be admitted",
                i
            );
        }
        assert_eq!(
            check(&adapter, &algorithm, "k").await,
            Verdict::Blocked { wait_ms: 1000 }
        );

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(check(&adapter, &algorithm, "k").await, Verdict::Admitted);
        assert!(!check(&adapter, &algorithm, "k").await.is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_continuous() {
        let adapter = ScriptAdapter::new(Arc::new(MemoryStore::new()));
        let algorithm = TokenBucket::new(1, 2).unwrap();

        assert_eq!(check(&adapter, &algorithm, "k").await, Verdict::Admitted);
        assert_eq!(
            check(&adapter, &algorithm, "k").await,
            Verdict::Blocked { wait_ms: 500 }
        );

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(
            check(&adapter, &algorithm, "k").await,
            Verdict::Blocked { wait_ms: 300 }
        );

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(check(&adapter, &algorithm, "k").await, Verdict::Admitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptAdapter::new(store.clone());
        let algorithm = TokenBucket::new(3, 10).unwrap();

        assert_eq!(check(&adapter, &algorithm, "k").await, Verdict::Admitted);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(check(&adapter, &algorithm, "k").await, Verdict::Admitted);

        match store.peek("k") {
            Some(StoredValue::Bucket { tokens, .. }) => assert_eq!(tokens, 2.0),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_bucket_expires() {
        let store = Arc::new(MemoryStore::new());
        let adapter = ScriptAdapter::new(store.clone());
        let algorithm = TokenBucket::new(2, 1).unwrap();

        check(&adapter, &algorithm, "k").await;
        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(store.peek("k"), None);
    }
}
