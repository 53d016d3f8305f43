//! Bounded retry for chunk-level failures

use crate::utils::error::DownloadError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Exponential backoff with a cap on both attempts and delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(8);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Decide what happens after `attempt` failed with `err`.
    ///
    /// Returns `Ok(())` once the backoff has elapsed and another attempt
    /// should be made, or the error itself when it is not retryable or the
    /// budget is spent. A stop request during the backoff yields `Cancelled`.
    pub async fn wait_before_retry(
        &self,
        what: &str,
        attempt: u32,
        err: DownloadError,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if matches!(err, DownloadError::Cancelled) {
            return Err(err);
        }
        if !err.is_retryable() {
            error!("{} failed: {}", what, err);
            return Err(err);
        }
        if attempt >= self.max_attempts {
            error!("{} failed after {} attempts: {}", what, attempt, err);
            return Err(err);
        }

        let delay = self.delay_for(attempt);
        warn!(
            "{} failed (attempt {}/{}), retrying in {:?}: {}",
            what, attempt, self.max_attempts, delay, err
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
