//! Retry policy for failed operations

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How failed values are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub period_ms: u64,
    /// Failed attempts after which the value is marked failed
    pub max_attempts: u32,
    /// Double the delay with every attempt
    pub exp_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            max_attempts: 3,
            exp_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Policy retrying every `period`, doubled per attempt when `exp_backoff` is set
    #[must_use]
    pub fn new(period: Duration, max_attempts: u32, exp_backoff: bool) -> Self {
        Self {
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            max_attempts,
            exp_backoff,
        }
    }

    /// Base delay between attempts
    #[inline]
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Delay before retrying after `attempts` failures
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        if !self.exp_backoff || attempts <= 1 {
            return self.period();
        }
        let factor = 1_u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
        Duration::from_millis(self.period_ms.saturating_mul(factor))
    }

    /// Whether another attempt is allowed after `attempts` failures
    #[inline]
    #[must_use]
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
