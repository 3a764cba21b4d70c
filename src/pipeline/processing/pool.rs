//! Fixed-size worker pool.
//!
//! Each worker leases a batch, processes its messages concurrently up to
//! `message_concurrency`, and keeps every message's lease alive from the moment it is leased,
//! including while it waits for a concurrency permit. A message task
//! that panics is logged and its message redelivers after the lease; the worker carries on.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::worker::{LeadProcessor, MessageOutcome};
use super::WorkerConfig;
use crate::app::ports::QueueClient;
use crate::common::error::DependencyError;
use crate::domain::QueueMessage;
use crate::metrics::WorkerMetrics;
use crate::pipeline::resilience::ResiliencePolicy;

pub struct WorkerPool {
    queue: Arc<dyn QueueClient>,
    queue_policy: Arc<ResiliencePolicy>,
    processor: Arc<LeadProcessor>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        queue_policy: Arc<ResiliencePolicy>,
        processor: Arc<LeadProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            queue_policy,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start `config.workers` workers; they stop once `shutdown` turns true and their current
    /// batch has finished
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.config.workers,
            batch_size = self.config.batch_size,
            message_concurrency = self.config.message_concurrency,
            "Starting worker pool"
        );
        (0..self.config.workers)
            .map(|worker_id| {
                let pool = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.receive().await {
                Ok(batch) if !batch.is_empty() => {
                    self.process_batch(batch).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(worker_id, error = %e, "Receive failed"),
            }
            tokio::select! {
                _ = sleep(self.config.poll_interval()) => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn receive(&self) -> Result<Vec<QueueMessage>, DependencyError> {
        let batch = self
            .queue_policy
            .call("receive", || {
                self.queue
                    .receive(self.config.batch_size, self.config.lease())
            })
            .await?;
        if !batch.is_empty() {
            WorkerMetrics::record_received(batch.len());
        }
        Ok(batch)
    }

    /// Lease one batch and process it to completion
    pub async fn drain_once(&self) -> Result<Vec<MessageOutcome>, DependencyError> {
        let batch = self.receive().await?;
        Ok(self.process_batch(batch).await)
    }

    /// Outcomes of tasks that panicked are missing from the result
    pub async fn process_batch(&self, batch: Vec<QueueMessage>) -> Vec<MessageOutcome> {
        let permits = Arc::new(Semaphore::new(self.config.message_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for msg in batch {
            let permits = Arc::clone(&permits);
            let processor = Arc::clone(&self.processor);
            let queue = Arc::clone(&self.queue);
            let lease = self.config.lease();
            let max_processing = self.config.max_processing_time();
            tasks.spawn(process_with_lease(
                processor,
                queue,
                msg,
                lease,
                max_processing,
                permits,
            ));
        }

        let mut outcomes = Vec::new();
        WorkerMetrics::set_in_flight(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_panic() => error!(error = %e, "Message task panicked"),
                Err(e) => warn!(error = %e, "Message task cancelled"),
            }
            WorkerMetrics::set_in_flight(tasks.len());
        }
        outcomes
    }
}

/// Run one message once a permit is free, extending its lease every half period from the start;
/// give up after `max_processing` of actual processing
async fn process_with_lease(
    processor: Arc<LeadProcessor>,
    queue: Arc<dyn QueueClient>,
    msg: QueueMessage,
    lease: Duration,
    max_processing: Duration,
    permits: Arc<Semaphore>,
) -> MessageOutcome {
    let half = (lease / 2).max(Duration::from_millis(1));
    let mut keeper = interval_at(Instant::now() + half, half);
    keeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let work = async {
        // The semaphore is never closed
        let _permit = permits.acquire_owned().await.ok();
        timeout(max_processing, processor.process(&msg)).await
    };
    tokio::pin!(work);

    let finished = loop {
        tokio::select! {
            finished = &mut work => break finished,
            _ = keeper.tick() => {
                match queue.extend_lease(&msg.receipt_handle, lease).await {
                    Ok(()) => WorkerMetrics::record_lease_extended(),
                    Err(e) => warn!(message_id = %msg.message_id, error = %e, "Lease extension failed"),
                }
            }
        }
    };

    match finished {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                message_id = %msg.message_id,
                max_processing_ms = max_processing.as_millis() as u64,
                "Processing exceeded maximum time, abandoning message"
            );
            WorkerMetrics::record_abandoned();
            processor.release_abandoned(&msg).await;
            MessageOutcome::Abandoned {
                message_id: msg.message_id.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{IdempotencyLedger, LeadStore, PutOutcome};
    use crate::domain::{BeginOutcome, Lead, LeadId, LeadPayload, StoredLead};
    use crate::infra::{InMemoryLeadStore, InMemoryLedger, InMemoryQueue, LocalKms};
    use crate::pipeline::crypto::CryptoBoundary;
    use crate::pipeline::resilience::{DependencyPolicies, ResilienceConfig};

    fn pool(queue: Arc<InMemoryQueue>, config: WorkerConfig) -> (Arc<WorkerPool>, Arc<InMemoryLeadStore>) {
        let store = Arc::new(InMemoryLeadStore::new());
        let policies = DependencyPolicies::from_config(&ResilienceConfig::default());
        let crypto = Arc::new(CryptoBoundary::new(
            Arc::new(LocalKms::ephemeral("local/test", "v1")),
            policies.kms.clone(),
            ["email"],
        ));
        let processor = Arc::new(LeadProcessor::new(
            queue.clone(),
            Arc::new(InMemoryLedger::new(Duration::from_secs(300))),
            store.clone(),
            crypto,
            policies.clone(),
            config.max_delivery_count,
            config.retry_delay(),
        ));
        let pool = Arc::new(WorkerPool::new(queue, policies.queue, processor, config));
        (pool, store)
    }

    async fn enqueue(queue: &InMemoryQueue, id: &str) {
        let lead = Lead::accepted(
            LeadId::parse(id).unwrap(),
            LeadPayload::default().with_field("source", "web"),
            "corr".into(),
        );
        queue.enqueue(&lead).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_once_processes_a_batch() {
        let queue = Arc::new(InMemoryQueue::new());
        for i in 0..5 {
            enqueue(&queue, &format!("L{i}")).await;
        }
        let (pool, store) = pool(queue.clone(), WorkerConfig::default());
        let outcomes = pool.drain_once().await.unwrap();
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, MessageOutcome::Stored { .. })));
        assert_eq!(store.len(), 5);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_workers_stop_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::new());
        for i in 0..12 {
            enqueue(&queue, &format!("L{i}")).await;
        }
        let config = WorkerConfig {
            workers: 3,
            batch_size: 4,
            poll_interval_ms: 10,
            ..WorkerConfig::default()
        };
        let (pool, store) = pool(queue.clone(), config);
        let (tx, rx) = watch::channel(false);
        let handles = pool.spawn(rx);

        for _ in 0..200 {
            if store.len() == 12 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len(), 12);
        assert!(queue.is_empty());
    }

    /// Storage that never answers in reasonable time
    struct StalledStore;

    #[async_trait::async_trait]
    impl LeadStore for StalledStore {
        async fn put_if_absent(&self, lead: &StoredLead) -> Result<PutOutcome, DependencyError> {
            sleep(Duration::from_secs(3_600)).await;
            Ok(PutOutcome::Created {
                storage_ref: lead.lead_id.to_string(),
            })
        }

        async fn get(&self, _: &LeadId) -> Result<Option<StoredLead>, DependencyError> {
            Ok(None)
        }

        async fn scan(
            &self,
            _: Option<&LeadId>,
            _: usize,
        ) -> Result<Vec<StoredLead>, DependencyError> {
            Ok(Vec::new())
        }

        async fn replace(&self, _: &StoredLead) -> Result<(), DependencyError> {
            Ok(())
        }
    }

    /// Storage whose writes take a few seconds each
    struct SlowStore {
        inner: InMemoryLeadStore,
        write_time: Duration,
    }

    #[async_trait::async_trait]
    impl LeadStore for SlowStore {
        async fn put_if_absent(&self, lead: &StoredLead) -> Result<PutOutcome, DependencyError> {
            sleep(self.write_time).await;
            self.inner.put_if_absent(lead).await
        }

        async fn get(&self, lead_id: &LeadId) -> Result<Option<StoredLead>, DependencyError> {
            self.inner.get(lead_id).await
        }

        async fn scan(
            &self,
            after: Option<&LeadId>,
            limit: usize,
        ) -> Result<Vec<StoredLead>, DependencyError> {
            self.inner.scan(after, limit).await
        }

        async fn replace(&self, lead: &StoredLead) -> Result<(), DependencyError> {
            self.inner.replace(lead).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_waiting_for_a_permit_keep_their_lease() {
        let queue = Arc::new(InMemoryQueue::new());
        enqueue(&queue, "L1").await;
        enqueue(&queue, "L2").await;
        let config = WorkerConfig {
            batch_size: 2,
            message_concurrency: 1,
            lease_ms: 2_000,
            ..WorkerConfig::default()
        };
        let store = Arc::new(SlowStore {
            inner: InMemoryLeadStore::new(),
            write_time: Duration::from_secs(5),
        });
        let policies = DependencyPolicies::from_config(&ResilienceConfig::default());
        let processor = Arc::new(LeadProcessor::new(
            queue.clone(),
            Arc::new(InMemoryLedger::new(Duration::from_secs(300))),
            store.clone(),
            Arc::new(CryptoBoundary::new(
                Arc::new(LocalKms::ephemeral("local/test", "v1")),
                policies.kms.clone(),
                ["email"],
            )),
            policies.clone(),
            config.max_delivery_count,
            config.retry_delay(),
        ));
        let lease = config.lease();
        let pool = WorkerPool::new(queue.clone(), policies.queue, processor, config);

        let batch = queue.receive(2, lease).await.unwrap();
        // The second message waits ~5s for the only permit, well past its 2s lease
        let (outcomes, mid_run) = tokio::join!(pool.process_batch(batch), async {
            sleep(Duration::from_secs(4)).await;
            queue.receive(2, lease).await.unwrap()
        });

        assert!(mid_run.is_empty(), "a queued message was redelivered while waiting");
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, MessageOutcome::Stored { .. })));
        assert_eq!(store.inner.len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_message_keeps_its_lease_then_is_abandoned() {
        let queue = Arc::new(InMemoryQueue::new());
        enqueue(&queue, "L1").await;
        let ledger = Arc::new(InMemoryLedger::new(Duration::from_secs(300)));
        let policies = DependencyPolicies::from_config(&ResilienceConfig::default());
        let processor = Arc::new(LeadProcessor::new(
            queue.clone(),
            ledger.clone(),
            Arc::new(StalledStore),
            Arc::new(CryptoBoundary::new(
                Arc::new(LocalKms::ephemeral("local/test", "v1")),
                policies.kms.clone(),
                ["email"],
            )),
            policies,
            5,
            Duration::from_secs(1),
        ));

        let lease = Duration::from_secs(10);
        let msg = queue.receive(1, lease).await.unwrap().remove(0);
        let outcome = process_with_lease(
            processor,
            queue.clone(),
            msg,
            lease,
            Duration::from_secs(35),
            Arc::new(Semaphore::new(1)),
        )
        .await;
        assert!(matches!(outcome, MessageOutcome::Abandoned { .. }));

        // The abandoned attempt gave its claim back instead of holding it for the TTL
        let lead_id = LeadId::parse("L1").unwrap();
        assert!(ledger.get(&lead_id).await.unwrap().is_none());
        assert!(matches!(
            ledger.try_begin_processing(&lead_id).await.unwrap(),
            BeginOutcome::Admitted(_)
        ));

        // The keeper extended the lease past the initial 10s
        assert!(queue.receive(1, lease).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let redelivered = queue.receive(1, lease).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].delivery_count, 2);
    }
}
