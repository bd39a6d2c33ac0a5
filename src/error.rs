//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The registry was used before `init` or after `close`
    #[error("Limiter registry is not initialized; call Registry::init before checking requests")]
    NotInitialized,

    /// A rule was constructed with parameters outside their valid range
    #[error("Invalid rule parameter: {0}")]
    InvalidRuleParameter(String),

    /// The shared store could not produce a decision
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store ran the procedure and it failed
    #[error("Procedure failed: {0}")]
    ProcedureFailed(String),

    /// Raised by the default block callback
    #[error("Too many requests, retry after {retry_after_secs}s")]
    TooManyRequests {
        /// Milliseconds until the quota is expected to admit again
        wait_ms: u64,
        /// `wait_ms` rounded up to whole seconds
        retry_after_secs: u64,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Build the rejection the default callback raises for a wait hint.
    pub fn too_many_requests(wait_ms: u64) -> Self {
        LimiterError::TooManyRequests {
            wait_ms,
            retry_after_secs: wait_ms.div_ceil(1000),
        }
    }
}

/// Faults reported by a [`ScriptStore`](crate::store::ScriptStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store no longer holds the compiled procedure (e.g. after a restart)
    #[error("Procedure is not registered with the store")]
    NoScript,

    /// Transport failure, timeout or a closed store
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The procedure itself failed while running
    #[error("Procedure failed: {0}")]
    Script(String),
}

impl From<StoreError> for LimiterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Script(reason) => LimiterError::ProcedureFailed(reason),
            other => LimiterError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_rounds_up() {
        match LimiterError::too_many_requests(1001) {
            LimiterError::TooManyRequests {
                wait_ms,
                retry_after_secs,
            } => {
                assert_eq!(wait_ms, 1001);
                assert_eq!(retry_after_secs, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_retry_after_exact_seconds() {
        match LimiterError::too_many_requests(5000) {
            LimiterError::TooManyRequests {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 5),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_store_error_converts_to_unavailable() {
        let err: LimiterError = StoreError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, LimiterError::StoreUnavailable(msg) if msg.contains("connection refused")));
    }

    #[test]
    fn test_script_error_converts_to_procedure_failure() {
        let err: LimiterError = StoreError::Script("WRONGTYPE".into()).into();
        assert!(matches!(err, LimiterError::ProcedureFailed(msg) if msg == "WRONGTYPE"));
    }
}
