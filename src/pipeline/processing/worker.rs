//! Per-message processing: decode, admit through the ledger, move the lead from transit to
//! storage encryption, persist, commit, acknowledge.
//!
//! Storage correctness rests on the ledger and the conditional put, never on in-process locks:
//! any number of redeliveries, concurrent workers or abandoned attempts produce one stored record.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::app::ports::{IdempotencyLedger, LeadStore, PutOutcome, QueueClient};
use crate::common::error::PipelineError;
use crate::domain::{
    AttemptToken, BeginOutcome, CommitOutcome, Lead, LeadId, QueueMessage, ReceiptHandle, StoredLead,
};
use crate::metrics::WorkerMetrics;
use crate::pipeline::crypto::{CryptoBoundary, Purpose};
use crate::pipeline::resilience::DependencyPolicies;

/// Extra visibility past a foreign claim's expiry, so the next delivery finds it reclaimable
const CLAIM_RECHECK_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStage {
    Leased,
    Decoding,
    LedgerCheck,
    Decrypting,
    Writing,
    Committing,
    Acknowledged,
}

impl MessageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStage::Leased => "leased",
            MessageStage::Decoding => "decoding",
            MessageStage::LedgerCheck => "ledger_check",
            MessageStage::Decrypting => "decrypting",
            MessageStage::Writing => "writing",
            MessageStage::Committing => "committing",
            MessageStage::Acknowledged => "acknowledged",
        }
    }
}

impl fmt::Display for MessageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Stored {
        lead_id: LeadId,
        storage_ref: String,
    },
    /// The lead was already stored; this delivery was acknowledged without writing
    Duplicate { lead_id: LeadId },
    /// Another attempt holds the lead; the lease is left to expire
    InFlight { lead_id: LeadId },
    /// The claim was taken over before commit; the owner of the new claim finishes the lead
    LostOwnership { lead_id: LeadId },
    RetryScheduled {
        stage: MessageStage,
        reason: String,
    },
    DeadLettered {
        stage: MessageStage,
        reason: String,
    },
    /// Exceeded the maximum processing time and was dropped mid-flight
    Abandoned { message_id: String },
}

#[derive(Debug)]
struct StageError {
    stage: MessageStage,
    error: PipelineError,
}

fn at(stage: MessageStage) -> impl FnOnce(PipelineError) -> StageError {
    move |error| StageError { stage, error }
}

pub struct LeadProcessor {
    queue: Arc<dyn QueueClient>,
    ledger: Arc<dyn IdempotencyLedger>,
    store: Arc<dyn LeadStore>,
    crypto: Arc<CryptoBoundary>,
    policies: DependencyPolicies,
    max_delivery_count: u32,
    retry_delay: Duration,
    /// Claims held by attempts between admission and their outcome, by delivery receipt
    claims: Mutex<HashMap<ReceiptHandle, (LeadId, AttemptToken)>>,
}

impl LeadProcessor {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        ledger: Arc<dyn IdempotencyLedger>,
        store: Arc<dyn LeadStore>,
        crypto: Arc<CryptoBoundary>,
        policies: DependencyPolicies,
        max_delivery_count: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            queue,
            ledger,
            store,
            crypto,
            policies,
            max_delivery_count,
            retry_delay,
            claims: Mutex::new(HashMap::new()),
        }
    }

    fn claims(&self) -> std::sync::MutexGuard<'_, HashMap<ReceiptHandle, (LeadId, AttemptToken)>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give up the ledger claim of a delivery whose processing was dropped mid-flight, so the
    /// next delivery is admitted without waiting for the claim TTL
    pub async fn release_abandoned(&self, msg: &QueueMessage) {
        let claim = self.claims().remove(&msg.receipt_handle);
        if let Some((lead_id, token)) = claim {
            warn!(lead_id = %lead_id, message_id = %msg.message_id, "Releasing claim of abandoned attempt");
            self.release(&lead_id, &token).await;
        }
    }

    pub async fn process(&self, msg: &QueueMessage) -> MessageOutcome {
        let span = info_span!(
            "message",
            message_id = %msg.message_id,
            delivery_count = msg.delivery_count,
            lead_id = tracing::field::Empty,
        );
        self.process_inner(msg, span.clone()).instrument(span).await
    }

    async fn process_inner(&self, msg: &QueueMessage, span: tracing::Span) -> MessageOutcome {
        let started = Instant::now();

        let lead = match msg.decode_lead() {
            Ok(lead) => lead,
            Err(e) => {
                return self
                    .dead_letter(msg, MessageStage::Decoding, e.to_string())
                    .await
            }
        };
        span.record("lead_id", tracing::field::display(&lead.lead_id));

        if msg.delivery_count > self.max_delivery_count {
            let reason = format!(
                "delivery count {} exceeds maximum {}",
                msg.delivery_count, self.max_delivery_count
            );
            return self.dead_letter(msg, MessageStage::Leased, reason).await;
        }

        let begin = self
            .policies
            .ledger
            .call("try_begin_processing", || {
                self.ledger.try_begin_processing(&lead.lead_id)
            })
            .await;
        let token = match begin {
            Ok(BeginOutcome::Admitted(token)) => token,
            Ok(BeginOutcome::AlreadyStored { storage_ref }) => {
                debug!(storage_ref = %storage_ref, "Lead already stored, absorbing duplicate");
                WorkerMetrics::record_duplicate();
                self.acknowledge(msg).await;
                return MessageOutcome::Duplicate {
                    lead_id: lead.lead_id,
                };
            }
            Ok(BeginOutcome::AlreadyInFlight { expires_in }) => {
                // Redeliver once the foreign claim can be reclaimed; earlier deliveries would
                // only spend the delivery budget
                let hide_for = expires_in + CLAIM_RECHECK_MARGIN;
                debug!(
                    hide_for_ms = hide_for.as_millis() as u64,
                    "Lead in flight elsewhere, deferring until its claim expires"
                );
                WorkerMetrics::record_in_flight_skip();
                let deferred = self
                    .policies
                    .queue
                    .call("extend_lease", || {
                        self.queue.extend_lease(&msg.receipt_handle, hide_for)
                    })
                    .await;
                if let Err(e) = deferred {
                    warn!(error = %e, "Could not defer in-flight lead; lease expires as is");
                }
                return MessageOutcome::InFlight {
                    lead_id: lead.lead_id,
                };
            }
            Err(e) => return self.fail(msg, None, MessageStage::LedgerCheck, e.into()).await,
        };

        self.claims()
            .insert(msg.receipt_handle.clone(), (lead.lead_id.clone(), token.clone()));
        let stored = self.store_lead(&lead, &token).await;
        self.claims().remove(&msg.receipt_handle);

        let storage_ref = match stored {
            Ok((CommitOutcome::Committed, storage_ref)) => storage_ref,
            // Another attempt committed between our put and commit; same record either way
            Ok((CommitOutcome::AlreadyStored { storage_ref }, _)) => storage_ref,
            Ok((CommitOutcome::LostOwnership, _)) => {
                warn!("Claim taken over before commit; leaving the lead to the new owner");
                WorkerMetrics::record_lost_ownership();
                return MessageOutcome::LostOwnership {
                    lead_id: lead.lead_id,
                };
            }
            Err(StageError { stage, error }) => {
                self.release(&lead.lead_id, &token).await;
                return self.fail(msg, Some(&lead.lead_id), stage, error).await;
            }
        };

        self.acknowledge(msg).await;
        WorkerMetrics::record_stored(started.elapsed().as_secs_f64());
        info!(storage_ref = %storage_ref, stage = %MessageStage::Acknowledged, "Lead stored");
        MessageOutcome::Stored {
            lead_id: lead.lead_id,
            storage_ref,
        }
    }

    /// Decrypting, Writing and Committing for an admitted attempt
    async fn store_lead(
        &self,
        lead: &Lead,
        token: &AttemptToken,
    ) -> Result<(CommitOutcome, String), StageError> {
        let plain = self
            .crypto
            .decrypt_sensitive(&lead.lead_id, &lead.payload)
            .await
            .map_err(at(MessageStage::Decrypting))?;

        let protected = self
            .crypto
            .encrypt_sensitive(&lead.lead_id, Purpose::Storage, &plain)
            .await
            .map_err(at(MessageStage::Writing))?;
        drop(plain);
        self.crypto
            .ensure_protected(&protected)
            .map_err(at(MessageStage::Writing))?;

        let record = StoredLead::from_lead(lead, protected);
        let put = self
            .policies
            .storage
            .call("put_if_absent", || self.store.put_if_absent(&record))
            .await
            .map_err(|e| at(MessageStage::Writing)(e.into()))?;
        if let PutOutcome::AlreadyExists { storage_ref } = &put {
            debug!(storage_ref = %storage_ref, "Record already present, reusing it");
        }

        let committed = self
            .policies
            .ledger
            .call("commit_stored", || {
                self.ledger
                    .commit_stored(&lead.lead_id, token, put.storage_ref())
            })
            .await
            .map_err(|e| at(MessageStage::Committing)(e.into()))?;
        Ok((committed, put.storage_ref().to_string()))
    }

    /// Failure after (or instead of) admission: dead-letter or schedule a redelivery
    async fn fail(
        &self,
        msg: &QueueMessage,
        lead_id: Option<&LeadId>,
        stage: MessageStage,
        error: PipelineError,
    ) -> MessageOutcome {
        if !error.is_transient() {
            return self
                .dead_letter(msg, stage, format!("permanent failure: {error}"))
                .await;
        }
        if msg.delivery_count >= self.max_delivery_count {
            let reason = format!(
                "transient failure on final delivery {}/{}: {error}",
                msg.delivery_count, self.max_delivery_count
            );
            return self.dead_letter(msg, stage, reason).await;
        }

        warn!(
            lead_id = ?lead_id.map(LeadId::as_str),
            stage = %stage,
            error = %error,
            retry_delay_ms = self.retry_delay.as_millis() as u64,
            "Transient failure, scheduling redelivery"
        );
        let extended = self
            .policies
            .queue
            .call("extend_lease", || {
                self.queue.extend_lease(&msg.receipt_handle, self.retry_delay)
            })
            .await;
        if let Err(e) = extended {
            // The lease still expires on its own; redelivery just comes sooner or later
            warn!(error = %e, "Could not set retry delay");
        }
        WorkerMetrics::record_retry_scheduled(stage.as_str());
        MessageOutcome::RetryScheduled {
            stage,
            reason: error.to_string(),
        }
    }

    async fn dead_letter(
        &self,
        msg: &QueueMessage,
        stage: MessageStage,
        cause: String,
    ) -> MessageOutcome {
        let reason = format!("{stage}: {cause}");
        warn!(stage = %stage, reason = %reason, "Dead-lettering message");
        let moved = self
            .policies
            .queue
            .call("dead_letter", || {
                self.queue.dead_letter(&msg.receipt_handle, &reason)
            })
            .await;
        if let Err(e) = moved {
            warn!(error = %e, "Dead-letter failed; message will be redelivered");
        }
        WorkerMetrics::record_dead_lettered(stage.as_str());
        MessageOutcome::DeadLettered { stage, reason }
    }

    async fn acknowledge(&self, msg: &QueueMessage) {
        let acked = self
            .policies
            .queue
            .call("acknowledge", || self.queue.acknowledge(&msg.receipt_handle))
            .await;
        match acked {
            Ok(()) => {}
            // A superseded receipt means another delivery owns the message now; the ledger
            // turns that delivery into a duplicate
            Err(e) if !e.is_transient() => debug!(error = %e, "Acknowledge on superseded receipt"),
            Err(e) => warn!(error = %e, "Acknowledge failed; message will be redelivered"),
        }
    }

    async fn release(&self, lead_id: &LeadId, token: &AttemptToken) {
        let released = self
            .policies
            .ledger
            .call("release", || self.ledger.release(lead_id, token))
            .await;
        match released {
            Ok(true) => debug!("Processing claim released"),
            Ok(false) => debug!("Processing claim already gone"),
            Err(e) => warn!(error = %e, "Could not release claim; it expires after the claim TTL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::Dependency;
    use crate::domain::{FieldValue, LeadPayload, LedgerStatus};
    use crate::infra::{InMemoryLeadStore, InMemoryLedger, InMemoryQueue, LocalKms};
    use crate::pipeline::resilience::ResilienceConfig;

    struct Harness {
        queue: Arc<InMemoryQueue>,
        ledger: Arc<InMemoryLedger>,
        store: Arc<InMemoryLeadStore>,
        crypto: Arc<CryptoBoundary>,
        processor: LeadProcessor,
    }

    fn harness(max_delivery_count: u32) -> Harness {
        let queue = Arc::new(InMemoryQueue::new());
        let ledger = Arc::new(InMemoryLedger::new(Duration::from_secs(300)));
        let store = Arc::new(InMemoryLeadStore::new());
        let policies = DependencyPolicies::from_config(&ResilienceConfig::default());
        let kms = Arc::new(LocalKms::ephemeral("local/test", "v1"));
        let crypto = Arc::new(CryptoBoundary::new(
            kms,
            policies.kms.clone(),
            ["email", "cpf"],
        ));
        let processor = LeadProcessor::new(
            queue.clone(),
            ledger.clone(),
            store.clone(),
            crypto.clone(),
            policies,
            max_delivery_count,
            Duration::from_secs(5),
        );
        Harness {
            queue,
            ledger,
            store,
            crypto,
            processor,
        }
    }

    impl Harness {
        async fn enqueue(&self, id: &str) {
            let lead_id = LeadId::parse(id).unwrap();
            let payload = self
                .crypto
                .encrypt_sensitive(
                    &lead_id,
                    Purpose::Transit,
                    &LeadPayload::default().with_field("email", "a@b.com"),
                )
                .await
                .unwrap();
            self.queue
                .enqueue(&Lead::accepted(lead_id, payload, "corr".into()))
                .await
                .unwrap();
        }

        async fn next(&self) -> QueueMessage {
            self.queue
                .receive(1, Duration::from_secs(30))
                .await
                .unwrap()
                .remove(0)
        }
    }

    #[tokio::test]
    async fn test_stores_with_storage_encryption() {
        let h = harness(5);
        h.enqueue("L1").await;
        let outcome = h.processor.process(&h.next().await).await;
        let MessageOutcome::Stored { lead_id, storage_ref } = outcome else {
            panic!("expected stored, got {outcome:?}");
        };
        assert_eq!(storage_ref, "memory:leads/L1");
        assert!(h.queue.is_empty());

        let stored = h.store.get(&lead_id).await.unwrap().unwrap();
        let FieldValue::Encrypted(email) = &stored.payload.fields["email"] else {
            panic!("email stored in plaintext");
        };
        assert_eq!(email.encryption_context["purpose"], "storage");
        let entry = h.ledger.get(&lead_id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Stored);
    }

    #[tokio::test]
    async fn test_redelivery_of_stored_lead_is_acknowledged() {
        let h = harness(5);
        h.enqueue("L1").await;
        h.enqueue("L1").await;
        let first = h.processor.process(&h.next().await).await;
        let second = h.processor.process(&h.next().await).await;
        assert!(matches!(first, MessageOutcome::Stored { .. }));
        assert!(matches!(second, MessageOutcome::Duplicate { .. }));
        assert!(h.queue.is_empty());
        assert_eq!(h.store.create_count(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_dead_lettered() {
        let h = harness(5);
        h.queue.enqueue_raw("{not json");
        let outcome = h.processor.process(&h.next().await).await;
        let MessageOutcome::DeadLettered { stage, reason } = outcome else {
            panic!("expected dead letter");
        };
        assert_eq!(stage, MessageStage::Decoding);
        assert!(reason.starts_with("decoding: "));
        assert_eq!(h.queue.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exceeding_max_delivery_count_dead_letters_before_work() {
        let h = harness(1);
        h.enqueue("L1").await;
        let _first = h.queue.receive(1, Duration::ZERO).await.unwrap();
        let second = h.next().await;
        assert_eq!(second.delivery_count, 2);

        let outcome = h.processor.process(&second).await;
        assert!(matches!(
            outcome,
            MessageOutcome::DeadLettered { stage: MessageStage::Leased, .. }
        ));
        assert!(h.ledger.get(&LeadId::parse("L1").unwrap()).await.unwrap().is_none());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_lead_is_skipped() {
        let h = harness(5);
        h.enqueue("L1").await;
        h.ledger
            .try_begin_processing(&LeadId::parse("L1").unwrap())
            .await
            .unwrap();
        let outcome = h.processor.process(&h.next().await).await;
        assert!(matches!(outcome, MessageOutcome::InFlight { .. }));
        assert_eq!(h.queue.len(), 1);
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_lead_is_hidden_until_claim_expires() {
        let h = harness(2);
        h.enqueue("L1").await;
        h.ledger
            .try_begin_processing(&LeadId::parse("L1").unwrap())
            .await
            .unwrap();
        let first = h.next().await;
        assert!(matches!(
            h.processor.process(&first).await,
            MessageOutcome::InFlight { .. }
        ));

        // Several lease periods pass without spending deliveries
        tokio::time::advance(Duration::from_secs(290)).await;
        assert!(h.queue.receive(1, Duration::from_secs(30)).await.unwrap().is_empty());

        // Once the 300s claim is reclaimable the next delivery stores the lead
        tokio::time::advance(Duration::from_secs(12)).await;
        let second = h.next().await;
        assert_eq!(second.delivery_count, 2);
        assert!(matches!(
            h.processor.process(&second).await,
            MessageOutcome::Stored { .. }
        ));
        assert_eq!(h.store.create_count(), 1);
    }

    #[tokio::test]
    async fn test_foreign_ciphertext_is_dead_lettered_and_claim_released() {
        let h = harness(5);
        // A transit payload sealed for L2 delivered as L1
        let foreign = h
            .crypto
            .encrypt_sensitive(
                &LeadId::parse("L2").unwrap(),
                Purpose::Transit,
                &LeadPayload::default().with_field("email", "x@y.com"),
            )
            .await
            .unwrap();
        h.queue
            .enqueue(&Lead::accepted(LeadId::parse("L1").unwrap(), foreign, "c".into()))
            .await
            .unwrap();

        let outcome = h.processor.process(&h.next().await).await;
        let MessageOutcome::DeadLettered { stage, reason } = outcome else {
            panic!("expected dead letter");
        };
        assert_eq!(stage, MessageStage::Decrypting);
        assert!(reason.contains("permanent"));
        assert!(h.ledger.get(&LeadId::parse("L1").unwrap()).await.unwrap().is_none());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(MessageStage::LedgerCheck.to_string(), "ledger_check");
        assert_eq!(Dependency::KeyManagement.to_string(), "kms");
    }
}
