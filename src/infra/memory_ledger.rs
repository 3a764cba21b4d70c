use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::app::ports::IdempotencyLedger;
use crate::common::error::DependencyError;
use crate::domain::{
    AttemptToken, BeginOutcome, CommitOutcome, LeadId, LedgerEntry, LedgerStatus,
};

#[derive(Debug)]
struct Claim {
    entry: LedgerEntry,
    claimed: Instant,
}

/// Ledger held in process memory; claim age is measured on the tokio clock
#[derive(Debug)]
pub struct InMemoryLedger {
    claim_ttl: Duration,
    entries: Mutex<HashMap<LeadId, Claim>>,
}

impl InMemoryLedger {
    pub fn new(claim_ttl: Duration) -> Self {
        Self {
            claim_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<LeadId, Claim>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(lead_id: &LeadId) -> (AttemptToken, Claim) {
        let token = AttemptToken::generate();
        let claim = Claim {
            entry: LedgerEntry {
                lead_id: lead_id.clone(),
                status: LedgerStatus::Processing,
                owner: Some(token.clone()),
                claimed_at: Utc::now(),
                committed_at: None,
                storage_ref: None,
            },
            claimed: Instant::now(),
        };
        (token, claim)
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn try_begin_processing(
        &self,
        lead_id: &LeadId,
    ) -> Result<BeginOutcome, DependencyError> {
        let mut entries = self.lock();
        match entries.get(lead_id) {
            None => {}
            Some(existing) if existing.entry.status == LedgerStatus::Stored => {
                return Ok(BeginOutcome::AlreadyStored {
                    storage_ref: existing.entry.storage_ref.clone().unwrap_or_default(),
                });
            }
            Some(existing) if existing.claimed.elapsed() < self.claim_ttl => {
                return Ok(BeginOutcome::AlreadyInFlight {
                    expires_in: self.claim_ttl.saturating_sub(existing.claimed.elapsed()),
                });
            }
            Some(existing) => {
                warn!(
                    lead_id = %lead_id,
                    previous_owner = ?existing.entry.owner,
                    "Reclaiming expired processing claim"
                );
            }
        }
        let (token, claim) = Self::claim(lead_id);
        entries.insert(lead_id.clone(), claim);
        Ok(BeginOutcome::Admitted(token))
    }

    async fn commit_stored(
        &self,
        lead_id: &LeadId,
        token: &AttemptToken,
        storage_ref: &str,
    ) -> Result<CommitOutcome, DependencyError> {
        let mut entries = self.lock();
        let Some(claim) = entries.get_mut(lead_id) else {
            return Ok(CommitOutcome::LostOwnership);
        };
        let entry = &mut claim.entry;
        match entry.status {
            LedgerStatus::Stored => Ok(CommitOutcome::AlreadyStored {
                storage_ref: entry.storage_ref.clone().unwrap_or_default(),
            }),
            LedgerStatus::Processing if entry.owner.as_ref() == Some(token) => {
                entry.status = LedgerStatus::Stored;
                entry.owner = None;
                entry.committed_at = Some(Utc::now());
                entry.storage_ref = Some(storage_ref.to_string());
                Ok(CommitOutcome::Committed)
            }
            LedgerStatus::Processing => Ok(CommitOutcome::LostOwnership),
        }
    }

    async fn release(
        &self,
        lead_id: &LeadId,
        token: &AttemptToken,
    ) -> Result<bool, DependencyError> {
        let mut entries = self.lock();
        let owned = entries.get(lead_id).map_or(false, |c| {
            c.entry.status == LedgerStatus::Processing && c.entry.owner.as_ref() == Some(token)
        });
        if owned {
            entries.remove(lead_id);
        }
        Ok(owned)
    }

    async fn get(&self, lead_id: &LeadId) -> Result<Option<LedgerEntry>, DependencyError> {
        Ok(self.lock().get(lead_id).map(|c| c.entry.clone()))
    }
}
