// Asynchronous half of the pipeline: worker pool, per-message processing and re-keying

pub mod pool;
pub mod rekey;
pub mod worker;

pub use pool::WorkerPool;
pub use rekey::{rekey_stored_leads, RekeyReport};
pub use worker::{LeadProcessor, MessageOutcome, MessageStage};

use serde::Deserialize;
use std::time::Duration;

/// Worker pool sizing and lease timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Messages leased per receive call
    pub batch_size: usize,
    /// Messages of one batch processed at the same time by one worker
    pub message_concurrency: usize,
    pub lease_ms: u64,
    /// Deliveries allowed before a message is dead-lettered
    pub max_delivery_count: u32,
    /// Sleep after an empty receive
    pub poll_interval_ms: u64,
    /// Redelivery delay after a transient failure
    pub retry_delay_ms: u64,
    /// A message task running longer than this is abandoned
    pub max_processing_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 10,
            message_concurrency: 4,
            lease_ms: 30_000,
            max_delivery_count: 5,
            poll_interval_ms: 500,
            retry_delay_ms: 10_000,
            max_processing_ms: 120_000,
        }
    }
}

impl WorkerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_ms)
    }
}
