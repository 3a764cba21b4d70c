//! Wiring: builds every adapter and pipeline component from an [`AppConfig`].

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use crate::app::ports::{IdempotencyLedger, KeyManagement, LeadStore, QueueClient};
use crate::config::{AppConfig, Backend};
use crate::infra::{
    InMemoryLeadStore, InMemoryLedger, InMemoryQueue, LocalKms, SqliteLeadStore, SqliteLedger,
    SqliteQueue,
};
use crate::pipeline::crypto::CryptoBoundary;
use crate::pipeline::ingestion::{IngestionGateway, RateLimiter};
use crate::pipeline::processing::{LeadProcessor, WorkerPool};
use crate::pipeline::resilience::DependencyPolicies;

pub struct AppContext {
    pub queue: Arc<dyn QueueClient>,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub store: Arc<dyn LeadStore>,
    pub kms: Arc<LocalKms>,
    pub policies: DependencyPolicies,
    pub crypto: Arc<CryptoBoundary>,
    pub gateway: Arc<IngestionGateway>,
    pub pool: Arc<WorkerPool>,
}

impl AppContext {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let queue: Arc<dyn QueueClient> = match config.queue.backend {
            Backend::Memory => Arc::new(InMemoryQueue::new()),
            Backend::Sqlite => Arc::new(
                SqliteQueue::open(&config.queue.path)
                    .with_context(|| format!("opening queue at {}", config.queue.path.display()))?,
            ),
        };
        let ledger: Arc<dyn IdempotencyLedger> = match config.ledger.backend {
            Backend::Memory => Arc::new(InMemoryLedger::new(config.ledger.claim_ttl())),
            Backend::Sqlite => Arc::new(
                SqliteLedger::open(&config.ledger.path, config.ledger.claim_ttl())
                    .with_context(|| format!("opening ledger at {}", config.ledger.path.display()))?,
            ),
        };
        let store: Arc<dyn LeadStore> = match config.storage.backend {
            Backend::Memory => Arc::new(InMemoryLeadStore::new()),
            Backend::Sqlite => Arc::new(
                SqliteLeadStore::open(&config.storage.path).with_context(|| {
                    format!("opening lead storage at {}", config.storage.path.display())
                })?,
            ),
        };
        let kms = Arc::new(LocalKms::from_config(&config.kms)?);

        Ok(Self::assemble(config, queue, ledger, store, kms))
    }

    /// Build the pipeline around already constructed adapters
    pub fn assemble(
        config: &AppConfig,
        queue: Arc<dyn QueueClient>,
        ledger: Arc<dyn IdempotencyLedger>,
        store: Arc<dyn LeadStore>,
        kms: Arc<LocalKms>,
    ) -> Self {
        let policies = DependencyPolicies::from_config(&config.resilience);
        let key_management: Arc<dyn KeyManagement> = kms.clone();
        let crypto = Arc::new(CryptoBoundary::new(
            key_management,
            policies.kms.clone(),
            config.crypto.sensitive_fields.iter().cloned(),
        ));

        let gateway = Arc::new(IngestionGateway::new(
            RateLimiter::new(&config.rate_limit),
            crypto.clone(),
            queue.clone(),
            policies.queue.clone(),
        ));
        let processor = Arc::new(LeadProcessor::new(
            queue.clone(),
            ledger.clone(),
            store.clone(),
            crypto.clone(),
            policies.clone(),
            config.worker.max_delivery_count,
            config.worker.retry_delay(),
        ));
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            policies.queue.clone(),
            processor,
            config.worker.clone(),
        ));

        info!(
            queue = %config.queue.backend,
            ledger = %config.ledger.backend,
            storage = %config.storage.backend,
            key_id = kms.key_id(),
            "Pipeline assembled"
        );

        Self {
            queue,
            ledger,
            store,
            kms,
            policies,
            crypto,
            gateway,
            pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_context_accepts_and_stores() {
        let ctx = AppContext::from_config(&AppConfig::default()).unwrap();
        let receipt = ctx
            .gateway
            .submit("c", None, &json!({"email": "a@b.com"}))
            .await
            .unwrap();
        ctx.pool.drain_once().await.unwrap();
        assert!(ctx.store.get(&receipt.lead_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sqlite_context_opens_files() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.queue.backend = Backend::Sqlite;
        config.queue.path = dir.path().join("q.db");
        config.ledger.backend = Backend::Sqlite;
        config.ledger.path = dir.path().join("l.db");
        config.storage.backend = Backend::Sqlite;
        config.storage.path = dir.path().join("s.db");
        config.metrics.enabled = false;

        let ctx = AppContext::from_config(&config).unwrap();
        let receipt = ctx
            .gateway
            .submit("c", None, &json!({"leadId": "L9", "email": "a@b.com"}))
            .await
            .unwrap();
        ctx.pool.drain_once().await.unwrap();
        let stored = ctx.store.get(&receipt.lead_id).await.unwrap().unwrap();
        assert_eq!(stored.lead_id.as_str(), "L9");
        assert!(dir.path().join("q.db").exists());
    }
}
