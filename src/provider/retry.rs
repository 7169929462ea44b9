//! Retry policy for provider requests.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TransportError, ValidationError};

/// Bounded exponential backoff.
///
/// Attempt numbers start at 0 for the first request; `max_retries = 2`
/// therefore allows three requests in total.
///
/// # Examples
///
/// ```
/// use company_id_resolver::error::TransportError;
/// use company_id_resolver::provider::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// let timeout = TransportError::Timeout { duration_ms: 5000 };
/// assert!(policy.should_retry(0, &timeout));
/// assert!(policy.should_retry(1, &timeout));
/// assert!(!policy.should_retry(2, &timeout));
/// assert!(!policy.should_retry(0, &TransportError::from_status(404, "not found")));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each further retry.
    pub base_delay_ms: u64,
    /// Upper bound on a single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Hard ceiling on `max_retries`.
    pub const MAX_RETRIES_LIMIT: u32 = 2;

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Checks the policy.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if more than two retries are
    /// requested or the delay bounds are inverted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_retries > Self::MAX_RETRIES_LIMIT {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "retry.max_retries must be at most {} (got {})",
                    Self::MAX_RETRIES_LIMIT,
                    self.max_retries
                ),
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                    self.base_delay_ms, self.max_delay_ms
                ),
            });
        }
        Ok(())
    }

    /// Whether a failure on `attempt` (0-based) should be retried.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, error: &TransportError) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    /// Delay to wait after a failed `attempt` before the next one.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Worst-case number of requests for one lookup.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
