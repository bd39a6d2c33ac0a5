//! Quota algorithm interface and verdicts.

use std::fmt;
use std::time::Duration;

use crate::store::Procedure;

/// Outcome of one quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The request may proceed
    Admitted,
    /// The quota is exhausted; retry after `wait_ms`
    Blocked { wait_ms: u64 },
}

impl Verdict {
    /// Decode a procedure reply: `0` (or a negative TTL) admits, `> 0` is the wait.
    pub fn from_reply(reply: i64) -> Self {
        if reply > 0 {
            Verdict::Blocked {
                wait_ms: reply as u64,
            }
        } else {
            Verdict::Admitted
        }
    }

    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted)
    }

    /// The wait hint, if blocked.
    pub fn wait(&self) -> Option<Duration> {
        match self {
            Verdict::Admitted => None,
            Verdict::Blocked { wait_ms } => Some(Duration::from_millis(*wait_ms)),
        }
    }

    /// The wait hint rounded up to whole seconds, as used for `Retry-After`.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Verdict::Admitted => None,
            Verdict::Blocked { wait_ms } => Some(wait_ms.div_ceil(1000)),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Admitted => f.write_str("admitted"),
            Verdict::Blocked { wait_ms } => write!(f, "blocked ({}ms)", wait_ms),
        }
    }
}

/// A quota algorithm bound to its parameters.
///
/// Each variant owns its atomic procedure and the encoding of its parameters
/// into procedure arguments. The limiter engine depends only on this trait.
pub trait QuotaAlgorithm: Send + Sync + fmt::Debug {
    /// The procedure evaluated by the store. Shared by all instances of a variant.
    fn procedure(&self) -> &'static Procedure;

    /// Procedure arguments, in the procedure's declared order.
    fn arguments(&self) -> Vec<i64>;

    /// Decode the procedure reply.
    fn decode(&self, reply: i64) -> Verdict {
        Verdict::from_reply(reply)
    }

    /// A disabled algorithm admits everything without touching the store.
    fn is_disabled(&self) -> bool {
        false
    }
}
