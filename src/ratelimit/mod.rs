//! Rate limiting logic: algorithms, identification, callbacks and the limiter engine.

mod algorithm;
mod callback;
mod fixed_window;
mod identity;
mod limiter;
mod rules;
mod token_bucket;

pub use algorithm::{QuotaAlgorithm, Verdict};
pub use callback::{BlockCallback, ObserveCallback, RejectCallback};
pub use fixed_window::{FixedWindow, WindowSpec, DISABLED_WINDOW_MS, FIXED_WINDOW};
pub use identity::{DefaultIdentifier, Identifier, RequestMeta, RequestParts, ANONYMOUS};
pub use limiter::{QuotaKey, RateLimiter, RuleId};
pub use rules::{build_rules, FixedWindowSpec, RuleChain, RuleConfig};
pub use token_bucket::{TokenBucket, TokenBucketSpec, TOKEN_BUCKET};
