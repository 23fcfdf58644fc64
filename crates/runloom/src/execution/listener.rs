//! Retry lifecycle listeners

use std::time::Duration;

use async_trait::async_trait;

use crate::state::StepFailure;

/// Observer of the retry loop's lifecycle
///
/// Listener failures are logged and swallowed; they never affect the
/// retried execution.
#[async_trait]
pub trait RetryListener: Send + Sync {
    /// A retry is about to be scheduled after `delay`
    async fn before_retry(
        &self,
        _step_id: &str,
        _next_attempt: u32,
        _delay: Duration,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// An execution succeeded after at least one retry
    async fn on_retry_success(&self, _step_id: &str, _attempt: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// An attempt failed
    async fn on_retry_failure(
        &self,
        _step_id: &str,
        _attempt: u32,
        _will_retry: bool,
        _error: &StepFailure,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Retrying was aborted by an abort predicate
    async fn on_retry_aborted(
        &self,
        _step_id: &str,
        _attempt: u32,
        _error: &StepFailure,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Every attempt was spent without success
    async fn on_retry_exhausted(
        &self,
        _step_id: &str,
        _attempts: u32,
        _error: &StepFailure,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
