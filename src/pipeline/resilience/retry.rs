use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Retry settings for one dependency
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Full jitter: sleep a uniform random time up to the computed backoff
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Backoff ceiling before the `retry`-th retry (0-based), capped at `max_backoff_ms`
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let exp = self.config.multiplier.max(1.0).powi(retry.min(32) as i32);
        let ms = (self.config.initial_backoff_ms as f64 * exp).min(self.config.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay to sleep before the `retry`-th retry
    pub fn backoff(&self, retry: u32) -> Duration {
        let ceiling = self.backoff_ceiling(retry);
        if !self.config.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter,
        })
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy(false);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1_000));
        assert_eq!(p.backoff(30), Duration::from_millis(1_000));
    }

    #[test]
    fn test_full_jitter_stays_under_ceiling() {
        let p = policy(true);
        for retry in 0..6 {
            for _ in 0..50 {
                assert!(p.backoff(retry) <= p.backoff_ceiling(retry));
            }
        }
    }
}
