//! Retry and circuit breaking around dependency calls.
//!
//! A [`ResiliencePolicy`] decorates an async operation: the breaker decides whether the call may
//! run at all, the classifier decides whether a failure is worth retrying, and the retry policy
//! decides how long to wait. Breaker rejections are never retried inside the same call.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{RetryConfig, RetryPolicy};

use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::error::{Dependency, DependencyError, FailureKind};
use crate::metrics::ResilienceMetrics;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Policy settings per dependency
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    pub queue: PolicyConfig,
    pub ledger: PolicyConfig,
    pub storage: PolicyConfig,
    pub kms: PolicyConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let storage = PolicyConfig {
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 50,
                ..RetryConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                open_ms: 15_000,
                ..CircuitBreakerConfig::default()
            },
        };
        Self {
            queue: PolicyConfig::default(),
            ledger: storage.clone(),
            storage,
            kms: PolicyConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError<E> {
    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("{0}")]
    Rejected(E),
}

#[derive(Debug)]
pub struct ResiliencePolicy {
    dependency: Dependency,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResiliencePolicy {
    pub fn new(dependency: Dependency, config: &PolicyConfig) -> Self {
        Self {
            dependency,
            retry: RetryPolicy::new(config.retry.clone()),
            breaker: CircuitBreaker::new(dependency, config.circuit_breaker.clone()),
        }
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run `op` under the breaker, retrying failures `classify` calls transient
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        operation: &str,
        classify: C,
        mut op: F,
    ) -> Result<T, PolicyError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureKind,
        E: Display,
    {
        let mut retry = 0u32;
        loop {
            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(retry_in) => {
                    ResilienceMetrics::record_circuit_rejected(self.dependency);
                    debug!(dependency = %self.dependency, operation, "Rejected by open circuit");
                    return Err(PolicyError::CircuitOpen { retry_in });
                }
            };

            let err = match op().await {
                Ok(value) => {
                    permit.on_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            if classify(&err) == FailureKind::Permanent {
                permit.on_neutral();
                return Err(PolicyError::Rejected(err));
            }
            permit.on_failure();

            if retry >= self.retry.max_retries() {
                ResilienceMetrics::record_exhausted(self.dependency);
                warn!(
                    dependency = %self.dependency,
                    operation,
                    attempts = retry + 1,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(PolicyError::Exhausted {
                    attempts: retry + 1,
                    last: err,
                });
            }

            let delay = self.retry.backoff(retry);
            ResilienceMetrics::record_retry(self.dependency);
            debug!(
                dependency = %self.dependency,
                operation,
                retry = retry + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    /// `execute` for dependency calls, folding policy outcomes back into a `DependencyError`
    pub async fn call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, DependencyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        self.execute(operation, |e: &DependencyError| e.kind, op)
            .await
            .map_err(|e| match e {
                PolicyError::CircuitOpen { retry_in } => DependencyError::transient(
                    self.dependency,
                    format!(
                        "{operation}: circuit open, retry in {}ms",
                        retry_in.as_millis()
                    ),
                ),
                PolicyError::Exhausted { attempts, last } => DependencyError::transient(
                    last.dependency,
                    format!("{operation} failed after {attempts} attempts: {}", last.message),
                ),
                PolicyError::Rejected(err) => err,
            })
    }
}

/// One policy per dependency, shared by the gateway and the workers
#[derive(Debug, Clone)]
pub struct DependencyPolicies {
    pub queue: Arc<ResiliencePolicy>,
    pub ledger: Arc<ResiliencePolicy>,
    pub storage: Arc<ResiliencePolicy>,
    pub kms: Arc<ResiliencePolicy>,
}

impl DependencyPolicies {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            queue: Arc::new(ResiliencePolicy::new(Dependency::Queue, &config.queue)),
            ledger: Arc::new(ResiliencePolicy::new(Dependency::Ledger, &config.ledger)),
            storage: Arc::new(ResiliencePolicy::new(Dependency::Storage, &config.storage)),
            kms: Arc::new(ResiliencePolicy::new(Dependency::KeyManagement, &config.kms)),
        }
    }
}
