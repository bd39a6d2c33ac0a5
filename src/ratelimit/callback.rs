//! Strategies invoked when a rule blocks a request.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{LimiterError, Result};

/// Decides the caller-visible outcome of a blocked request.
///
/// `Ok(())` lets the request continue; an error rejects it.
#[async_trait]
pub trait BlockCallback<R: Sync>: Send + Sync {
    async fn on_blocked(&self, request: &R, wait_ms: u64) -> Result<()>;
}

#[async_trait]
impl<R, F> BlockCallback<R> for F
where
    R: Sync,
    F: Fn(&R, u64) -> Result<()> + Send + Sync,
{
    async fn on_blocked(&self, request: &R, wait_ms: u64) -> Result<()> {
        self(request, wait_ms)
    }
}

/// Rejects with [`LimiterError::TooManyRequests`], retry-after rounded up to seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectCallback;

#[async_trait]
impl<R: Sync> BlockCallback<R> for RejectCallback {
    async fn on_blocked(&self, _request: &R, wait_ms: u64) -> Result<()> {
        Err(LimiterError::too_many_requests(wait_ms))
    }
}

/// Records the block and lets the request through.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObserveCallback;

#[async_trait]
impl<R: Sync> BlockCallback<R> for ObserveCallback {
    async fn on_blocked(&self, _request: &R, wait_ms: u64) -> Result<()> {
        debug!(wait_ms = wait_ms, "Quota exceeded, admitting in observe mode");
        Ok(())
    }
}
