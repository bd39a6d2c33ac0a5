//! Tollgate - per-client request quotas on a shared store
//!
//! Many service instances share one store and agree on a single admission
//! decision per client per rule. Each decision is made by a short procedure
//! the store runs atomically against the client's quota key, so no
//! client-side locking is needed. Two algorithms are provided (fixed window
//! and token bucket); several rules can be composed on one endpoint.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod registry;
pub mod store;

pub use error::{LimiterError, Result, StoreError};
pub use ratelimit::{RateLimiter, RuleChain, Verdict};
pub use registry::{FailurePolicy, LimiterOptions, Registry};
