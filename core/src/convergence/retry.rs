//! Retry policy for retryable steps.
//!
//! Only steps marked retryable are ever re-attempted, and only after a
//! failure. The policy bounds the number of re-attempts and spaces them with
//! a fixed, linear or exponential backoff.

use std::time::Duration;

use crate::types::config::{BackoffStrategy, RetrySettings};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, strategy: BackoffStrategy, base_delay_ms: u64) -> Self {
        RetryPolicy {
            max_retries,
            strategy,
            base_delay_ms,
        }
    }

    /// Whether retry number `retry` (0-indexed) is within the budget.
    pub fn should_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_ms(&self, retry: u32) -> u64 {
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(retry as u64 + 1),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(retry)),
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.delay_ms(retry))
    }

    /// Total attempts a retryable step may make, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        RetryPolicy::new(s.max_retries, s.backoff_strategy, s.base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fixed_backoff() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.strategy, BackoffStrategy::Fixed);
        assert_eq!(p.delay_ms(0), p.delay_ms(4));
        assert_eq!(p.max_attempts(), 4);
    }

    #[test]
    fn retry_budget() {
        let p = RetryPolicy::new(2, BackoffStrategy::Fixed, 100);
        assert!(p.should_retry(0));
        assert!(p.should_retry(1));
        assert!(!p.should_retry(2));
        assert!(!RetryPolicy::new(0, BackoffStrategy::Fixed, 0).should_retry(0));
    }

    #[test]
    fn linear_and_exponential_delays() {
        let lin = RetryPolicy::new(5, BackoffStrategy::Linear, 1000);
        assert_eq!(lin.delay_ms(0), 1000);
        assert_eq!(lin.delay_ms(2), 3000);

        let exp = RetryPolicy::new(5, BackoffStrategy::Exponential, 1000);
        assert_eq!(exp.delay_ms(0), 1000);
        assert_eq!(exp.delay_ms(3), 8000);
        assert_eq!(exp.delay(1), Duration::from_secs(2));
    }

    #[test]
    fn exponential_delay_saturates() {
        let p = RetryPolicy::new(100, BackoffStrategy::Exponential, u64::MAX / 2);
        assert_eq!(p.delay_ms(80), u64::MAX);
    }

    #[test]
    fn built_from_settings() {
        let s = RetrySettings {
            max_retries: 1,
            backoff_strategy: BackoffStrategy::Linear,
            base_delay_ms: 5,
        };
        assert_eq!(RetryPolicy::from(&s), RetryPolicy::new(1, BackoffStrategy::Linear, 5));
    }
}
