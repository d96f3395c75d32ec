//! Retry ceiling and backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry ceiling applied when a job is enqueued without an explicit one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^retry_count`
    #[default]
    Exponential,
    /// `base * (retry_count + 1)`
    Linear,
    /// `base` every time
    Fixed,
}

/// How long a failed job waits before it becomes eligible again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(24 * 60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff from `base_delay`, capped at the default maximum.
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Default::default()
        }
    }

    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to apply after a failure, given the job's `retry_count` *before*
    /// the failure is counted.
    ///
    /// With a 30s base the exponential schedule is 30s, 60s, 120s, 240s, ...
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry_count.saturating_add(1)),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let policy = RetryPolicy::exponential(Duration::from_secs(30));

        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(240));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(7), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(300));
    }

    #[test]
    fn huge_retry_counts_saturate_at_the_cap() {
        let policy = RetryPolicy::exponential(Duration::from_secs(30))
            .with_max_delay(Duration::from_secs(3600));

        assert_eq!(policy.delay_for_retry(40), Duration::from_secs(3600));
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(3600));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: exponential delays never shrink as the retry count grows,
        /// and strictly grow while below the cap.
        #[test]
        fn exponential_delay_is_monotonic(base_ms in 1u64..60_000, retry in 0u32..40) {
            let policy = RetryPolicy::exponential(Duration::from_millis(base_ms));

            let current = policy.delay_for_retry(retry);
            let next = policy.delay_for_retry(retry + 1);

            prop_assert!(next >= current);
            if next < policy.max_delay {
                prop_assert!(next > current);
            }
        }
    }
}
