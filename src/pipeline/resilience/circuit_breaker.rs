//! Per-dependency circuit breaker.
//!
//! Closed counts consecutive failures inside a rolling window and opens at the threshold.
//! Open rejects every call until the cool-down has elapsed. Half-open admits a limited number of
//! trial calls: enough successes close the circuit, any failure reopens it.

use serde::Deserialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::common::error::Dependency;
use crate::metrics::ResilienceMetrics;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Failures further apart than this do not accumulate
    pub window_ms: u64,
    pub open_ms: u64,
    pub half_open_max_calls: u32,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            open_ms: 30_000,
            half_open_max_calls: 3,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: Dependency,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission to call the dependency; settle it with `on_success`/`on_failure`/`on_neutral`.
/// A permit dropped unsettled (a cancelled call) frees its half-open slot.
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    pub fn on_success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn on_failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }

    /// The call failed in a way that says nothing about the dependency's health
    pub fn on_neutral(mut self) {
        self.settled = true;
        self.breaker.release_trial(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_trial(self.trial);
        }
    }
}

impl CircuitBreaker {
    pub fn new(dependency: Dependency, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                streak_started: None,
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_duration(&self) -> Duration {
        Duration::from_millis(self.config.open_ms)
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// Admit a call, or return how long until the circuit may admit again
    pub fn try_acquire(&self) -> Result<Permit<'_>, Duration> {
        let mut inner = self.lock();
        self.advance(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(self.open_duration().saturating_sub(elapsed))
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls.max(1) {
                    return Err(Duration::ZERO);
                }
                inner.half_open_in_flight += 1;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
        }
    }

    /// Open -> HalfOpen once the cool-down is over
    fn advance(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open {
            let cooled = inner
                .opened_at
                .map_or(true, |t| t.elapsed() >= self.open_duration());
            if cooled {
                self.transition(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                warn!(dependency = %self.dependency, ?from, "Circuit opened");
            }
            CircuitState::HalfOpen => {
                info!(dependency = %self.dependency, "Circuit half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.streak_started = None;
                inner.opened_at = None;
                info!(dependency = %self.dependency, "Circuit closed");
            }
        }
        ResilienceMetrics::set_circuit_state(self.dependency, to.gauge_value());
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.streak_started = None;
            }
            CircuitState::HalfOpen if trial => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold.max(1) {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A call admitted before the circuit opened; its outcome is stale
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                let window = Duration::from_millis(self.config.window_ms);
                let now = Instant::now();
                let in_window = inner
                    .streak_started
                    .map_or(false, |start| now.duration_since(start) <= window);
                if !in_window {
                    inner.streak_started = Some(now);
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if trial => {
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn release_trial(&self, trial: bool) {
        if !trial {
            return;
        }
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            Dependency::Storage,
            CircuitBreakerConfig {
                failure_threshold: 3,
                window_ms: 10_000,
                open_ms: 1_000,
                half_open_max_calls: 1,
                success_threshold: 2,
            },
        )
    }

    fn fail(b: &CircuitBreaker) {
        b.try_acquire().unwrap().on_failure();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let b = breaker();
        fail(&b);
        fail(&b);
        b.try_acquire().unwrap().on_success();
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);

        let retry_in = b.try_acquire().unwrap_err();
        assert!(retry_in <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let b = breaker();
        fail(&b);
        fail(&b);
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trials_close_or_reopen() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // Only one trial at a time
        let trial = b.try_acquire().unwrap();
        assert_eq!(b.try_acquire().unwrap_err(), Duration::ZERO);
        trial.on_failure();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        b.try_acquire().unwrap().on_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.try_acquire().unwrap().on_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        drop(b.try_acquire().unwrap());
        assert!(b.try_acquire().is_ok());
    }
}
