use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::common::error::DependencyError;
use crate::domain::{
    AttemptToken, BeginOutcome, CommitOutcome, DeadLetter, Lead, LeadId, LedgerEntry,
    QueueMessage, ReceiptHandle, StoredLead,
};

// Pipeline-side ports

/// At-least-once delivery queue with leases
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Returns the message id
    async fn enqueue(&self, lead: &Lead) -> Result<String, DependencyError>;
    /// Zero messages is a normal result
    async fn receive(
        &self,
        max_messages: usize,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, DependencyError>;
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), DependencyError>;
    /// Resets the remaining lease to `duration` from now
    async fn extend_lease(
        &self,
        receipt: &ReceiptHandle,
        duration: Duration,
    ) -> Result<(), DependencyError>;
    async fn dead_letter(&self, receipt: &ReceiptHandle, reason: &str)
        -> Result<(), DependencyError>;
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, DependencyError>;
}

/// Durable record of which leads are in flight or stored
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn try_begin_processing(&self, lead_id: &LeadId)
        -> Result<BeginOutcome, DependencyError>;
    async fn commit_stored(
        &self,
        lead_id: &LeadId,
        token: &AttemptToken,
        storage_ref: &str,
    ) -> Result<CommitOutcome, DependencyError>;
    /// Returns whether an entry owned by `token` was removed
    async fn release(&self, lead_id: &LeadId, token: &AttemptToken)
        -> Result<bool, DependencyError>;
    async fn get(&self, lead_id: &LeadId) -> Result<Option<LedgerEntry>, DependencyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Created { storage_ref: String },
    /// A record for this lead already exists; nothing was written
    AlreadyExists { storage_ref: String },
}

impl PutOutcome {
    pub fn storage_ref(&self) -> &str {
        match self {
            PutOutcome::Created { storage_ref } | PutOutcome::AlreadyExists { storage_ref } => {
                storage_ref
            }
        }
    }
}

/// Long-term lead storage keyed by lead id
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Conditional put: create if absent
    async fn put_if_absent(&self, lead: &StoredLead) -> Result<PutOutcome, DependencyError>;
    async fn get(&self, lead_id: &LeadId) -> Result<Option<StoredLead>, DependencyError>;
    /// Records ordered by lead id, strictly after `after`
    async fn scan(
        &self,
        after: Option<&LeadId>,
        limit: usize,
    ) -> Result<Vec<StoredLead>, DependencyError>;
    /// Overwrite an existing record (re-keying only)
    async fn replace(&self, lead: &StoredLead) -> Result<(), DependencyError>;
}

pub type EncryptionContext = BTreeMap<String, String>;

/// A data key as wrapped by the key-management capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub key_version: String,
}

#[derive(Debug, Clone)]
pub struct DataKey {
    pub plaintext: Vec<u8>,
    pub wrapped: WrappedKey,
}

/// External key-management capability; every call is bound to an encryption context
#[async_trait]
pub trait KeyManagement: Send + Sync {
    fn key_id(&self) -> &str;
    async fn current_key_version(&self) -> Result<String, DependencyError>;
    async fn generate_data_key(&self, context: &EncryptionContext)
        -> Result<DataKey, DependencyError>;
    async fn encrypt_data_key(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<WrappedKey, DependencyError>;
    async fn decrypt_data_key(
        &self,
        wrapped: &WrappedKey,
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, DependencyError>;
}
