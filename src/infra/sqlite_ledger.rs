use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use super::sqlite::{corrupt_row, from_millis, now_millis, SqliteDb};
use crate::app::ports::IdempotencyLedger;
use crate::common::error::{Dependency, DependencyError};
use crate::domain::{
    AttemptToken, BeginOutcome, CommitOutcome, LeadId, LedgerEntry, LedgerStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ledger (
    lead_id      TEXT PRIMARY KEY,
    status       TEXT NOT NULL,
    owner        TEXT,
    claimed_at   INTEGER NOT NULL,
    committed_at INTEGER,
    storage_ref  TEXT
);
"#;

/// Raw row; status is parsed after the query so bad values surface as corruption
struct LedgerRow {
    lead_id: String,
    status: String,
    owner: Option<String>,
    claimed_at: i64,
    committed_at: Option<i64>,
    storage_ref: Option<String>,
}

impl LedgerRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            lead_id: r.get(0)?,
            status: r.get(1)?,
            owner: r.get(2)?,
            claimed_at: r.get(3)?,
            committed_at: r.get(4)?,
            storage_ref: r.get(5)?,
        })
    }

    fn into_entry(self, lead_id: &LeadId) -> Result<LedgerEntry, DependencyError> {
        let status = LedgerStatus::parse(&self.status).ok_or_else(|| {
            corrupt_row(Dependency::Ledger, "ledger", format!("status '{}'", self.status))
        })?;
        debug_assert_eq!(self.lead_id, lead_id.as_str());
        Ok(LedgerEntry {
            lead_id: lead_id.clone(),
            status,
            owner: self.owner.map(AttemptToken),
            claimed_at: from_millis(self.claimed_at),
            committed_at: self.committed_at.map(from_millis),
            storage_ref: self.storage_ref,
        })
    }
}

const SELECT_ENTRY: &str = "SELECT lead_id, status, owner, claimed_at, committed_at, storage_ref
                            FROM ledger WHERE lead_id = ?1";

/// Ledger in a SQLite file; every transition is a single conditional statement
pub struct SqliteLedger {
    db: SqliteDb,
    claim_ttl: Duration,
}

impl SqliteLedger {
    pub fn open<P: AsRef<Path>>(path: P, claim_ttl: Duration) -> Result<Self, DependencyError> {
        Ok(Self {
            db: SqliteDb::open(path, Dependency::Ledger, SCHEMA)?,
            claim_ttl,
        })
    }

    fn read(&self, lead_id: &LeadId) -> Result<Option<LedgerEntry>, DependencyError> {
        let row = self.db.with_conn(|c| {
            c.query_row(SELECT_ENTRY, params![lead_id.as_str()], LedgerRow::from_row)
                .optional()
        })?;
        row.map(|r| r.into_entry(lead_id)).transpose()
    }
}

#[async_trait]
impl IdempotencyLedger for SqliteLedger {
    async fn try_begin_processing(
        &self,
        lead_id: &LeadId,
    ) -> Result<BeginOutcome, DependencyError> {
        let token = AttemptToken::generate();
        let now = now_millis();
        let expired_before = now - self.claim_ttl.as_millis() as i64;

        let inserted = self.db.with_conn(|c| {
            c.execute(
                "INSERT OR IGNORE INTO ledger (lead_id, status, owner, claimed_at)
                 VALUES (?1, 'processing', ?2, ?3)",
                params![lead_id.as_str(), token.as_str(), now],
            )
        })?;
        if inserted == 1 {
            return Ok(BeginOutcome::Admitted(token));
        }

        let reclaimed = self.db.with_conn(|c| {
            c.execute(
                "UPDATE ledger SET owner = ?2, claimed_at = ?3
                 WHERE lead_id = ?1 AND status = 'processing' AND claimed_at <= ?4",
                params![lead_id.as_str(), token.as_str(), now, expired_before],
            )
        })?;
        if reclaimed == 1 {
            warn!(lead_id = %lead_id, "Reclaimed expired processing claim");
            return Ok(BeginOutcome::Admitted(token));
        }

        match self.read(lead_id)? {
            Some(entry) if entry.status == LedgerStatus::Stored => Ok(BeginOutcome::AlreadyStored {
                storage_ref: entry.storage_ref.unwrap_or_default(),
            }),
            Some(entry) => {
                let expires_at = entry.claimed_at.timestamp_millis() + self.claim_ttl.as_millis() as i64;
                Ok(BeginOutcome::AlreadyInFlight {
                    expires_in: Duration::from_millis(expires_at.saturating_sub(now).max(0) as u64),
                })
            }
            // Released between our insert and read; the next delivery will be admitted
            None => Ok(BeginOutcome::AlreadyInFlight {
                expires_in: Duration::ZERO,
            }),
        }
    }

    async fn commit_stored(
        &self,
        lead_id: &LeadId,
        token: &AttemptToken,
        storage_ref: &str,
    ) -> Result<CommitOutcome, DependencyError> {
        let committed = self.db.with_conn(|c| {
            c.execute(
                "UPDATE ledger SET status = 'stored', owner = NULL, committed_at = ?3, storage_ref = ?4
                 WHERE lead_id = ?1 AND status = 'processing' AND owner = ?2",
                params![lead_id.as_str(), token.as_str(), now_millis(), storage_ref],
            )
        })?;
        if committed == 1 {
            return Ok(CommitOutcome::Committed);
        }
        match self.read(lead_id)? {
            Some(entry) if entry.status == LedgerStatus::Stored => Ok(CommitOutcome::AlreadyStored {
                storage_ref: entry.storage_ref.unwrap_or_default(),
            }),
            _ => Ok(CommitOutcome::LostOwnership),
        }
    }

    async fn release(
        &self,
        lead_id: &LeadId,
        token: &AttemptToken,
    ) -> Result<bool, DependencyError> {
        let deleted = self.db.with_conn(|c| {
            c.execute(
                "DELETE FROM ledger WHERE lead_id = ?1 AND status = 'processing' AND owner = ?2",
                params![lead_id.as_str(), token.as_str()],
            )
        })?;
        Ok(deleted == 1)
    }

    async fn get(&self, lead_id: &LeadId) -> Result<Option<LedgerEntry>, DependencyError> {
        self.read(lead_id)
    }
}
