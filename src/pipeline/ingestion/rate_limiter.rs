use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::common::constants::MAX_TRACKED_CALLERS;
use crate::common::error::RateLimitedError;

/// Longest wait ever reported; also used when the bucket never refills
const MAX_RETRY_AFTER: Duration = Duration::from_secs(u32::MAX as u64);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Burst size per caller
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_per_second: 10.0,
        }
    }
}

/// Token bucket per caller identity. Never waits: an empty bucket is reported with the time
/// until one token is available.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    // token buckets are modeled by the current tokens and the time of last refill
    buckets: Mutex<HashMap<String, (f64, Instant)>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity.max(1) as f64,
            refill_per_second: config.refill_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, caller: &str) -> Result<(), RateLimitedError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        if buckets.len() >= MAX_TRACKED_CALLERS && !buckets.contains_key(caller) {
            self.prune(&mut buckets, now);
        }

        let (tokens, last) = buckets
            .entry(caller.to_string())
            .or_insert((self.capacity, now));
        let elapsed = now.duration_since(*last).as_secs_f64();
        *tokens = (*tokens + elapsed * self.refill_per_second).min(self.capacity);
        *last = now;

        if *tokens >= 1.0 {
            *tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - *tokens;
        let retry_after = if self.refill_per_second > 0.0 {
            // Tiny refill rates overflow Duration
            Duration::try_from_secs_f64(deficit / self.refill_per_second)
                .map_or(MAX_RETRY_AFTER, |wait| wait.min(MAX_RETRY_AFTER))
        } else {
            MAX_RETRY_AFTER
        };
        Err(RateLimitedError {
            caller: caller.to_string(),
            retry_after,
        })
    }

    /// Drop callers whose bucket has refilled completely; they are indistinguishable from new ones
    fn prune(&self, buckets: &mut HashMap<String, (f64, Instant)>, now: Instant) {
        let capacity = self.capacity;
        let rate = self.refill_per_second;
        buckets.retain(|_, (tokens, last)| {
            *tokens + now.duration_since(*last).as_secs_f64() * rate < capacity
        });
    }

    pub fn tracked_callers(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_per_second: f64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            capacity,
            refill_per_second,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_reject_with_retry_after() {
        let rl = limiter(3, 1.0);
        for _ in 0..3 {
            rl.try_acquire("10.0.0.1").unwrap();
        }
        let err = rl.try_acquire("10.0.0.1").unwrap_err();
        assert_eq!(err.caller, "10.0.0.1");
        assert!(err.retry_after > Duration::ZERO);
        assert!(err.retry_after <= Duration::from_secs(1));

        // Other callers have their own bucket
        rl.try_acquire("10.0.0.2").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refills_over_time() {
        let rl = limiter(2, 2.0);
        rl.try_acquire("c").unwrap();
        rl.try_acquire("c").unwrap();
        assert!(rl.try_acquire("c").is_err());

        tokio::time::advance(Duration::from_millis(500)).await;
        rl.try_acquire("c").unwrap();
        assert!(rl.try_acquire("c").is_err());

        // Never refills beyond capacity
        tokio::time::advance(Duration::from_secs(60)).await;
        rl.try_acquire("c").unwrap();
        rl.try_acquire("c").unwrap();
        assert!(rl.try_acquire("c").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negligible_refill_reports_capped_retry_after() {
        for rate in [1e-300, f64::MIN_POSITIVE, 0.0] {
            let rl = limiter(1, rate);
            rl.try_acquire("c").unwrap();
            let err = rl.try_acquire("c").unwrap_err();
            assert_eq!(err.retry_after, MAX_RETRY_AFTER);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_prunes_full_buckets() {
        let rl = limiter(1, 100.0);
        for i in 0..MAX_TRACKED_CALLERS {
            rl.try_acquire(&format!("caller-{i}")).unwrap();
        }
        assert_eq!(rl.tracked_callers(), MAX_TRACKED_CALLERS);

        tokio::time::advance(Duration::from_secs(1)).await;
        rl.try_acquire("newcomer").unwrap();
        assert_eq!(rl.tracked_callers(), 1);
    }
}
