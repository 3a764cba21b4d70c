use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::sqlite::{corrupt_row, now_millis, SqliteDb};
use crate::app::ports::{LeadStore, PutOutcome};
use crate::common::constants::SQLITE_STORAGE_PREFIX;
use crate::common::error::{Dependency, DependencyError};
use crate::domain::{LeadId, StoredLead};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stored_leads (
    lead_id   TEXT PRIMARY KEY,
    body      TEXT NOT NULL,
    stored_at INTEGER NOT NULL
);
"#;

/// Lead storage in a SQLite file; records are JSON bodies keyed by lead id
pub struct SqliteLeadStore {
    db: SqliteDb,
}

impl SqliteLeadStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DependencyError> {
        Ok(Self {
            db: SqliteDb::open(path, Dependency::Storage, SCHEMA)?,
        })
    }

    fn storage_ref(lead_id: &LeadId) -> String {
        format!("{SQLITE_STORAGE_PREFIX}{lead_id}")
    }

    fn encode(lead: &StoredLead) -> Result<String, DependencyError> {
        serde_json::to_string(lead)
            .map_err(|e| DependencyError::permanent(Dependency::Storage, e.to_string()))
    }

    fn decode(body: &str) -> Result<StoredLead, DependencyError> {
        serde_json::from_str(body).map_err(|e| corrupt_row(Dependency::Storage, "stored_leads", e))
    }
}

#[async_trait]
impl LeadStore for SqliteLeadStore {
    async fn put_if_absent(&self, lead: &StoredLead) -> Result<PutOutcome, DependencyError> {
        let body = Self::encode(lead)?;
        let inserted = self.db.with_conn(|c| {
            c.execute(
                "INSERT OR IGNORE INTO stored_leads (lead_id, body, stored_at) VALUES (?1, ?2, ?3)",
                params![lead.lead_id.as_str(), body, now_millis()],
            )
        })?;
        let storage_ref = Self::storage_ref(&lead.lead_id);
        Ok(if inserted == 1 {
            PutOutcome::Created { storage_ref }
        } else {
            PutOutcome::AlreadyExists { storage_ref }
        })
    }

    async fn get(&self, lead_id: &LeadId) -> Result<Option<StoredLead>, DependencyError> {
        let body: Option<String> = self.db.with_conn(|c| {
            c.query_row(
                "SELECT body FROM stored_leads WHERE lead_id = ?1",
                params![lead_id.as_str()],
                |r| r.get(0),
            )
            .optional()
        })?;
        body.as_deref().map(Self::decode).transpose()
    }

    async fn scan(
        &self,
        after: Option<&LeadId>,
        limit: usize,
    ) -> Result<Vec<StoredLead>, DependencyError> {
        let after = after.map(|id| id.as_str().to_string()).unwrap_or_default();
        let bodies: Vec<String> = self.db.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT body FROM stored_leads WHERE lead_id > ?1 ORDER BY lead_id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![after, limit as i64], |r| r.get(0))?;
            rows.collect()
        })?;
        bodies.iter().map(|b| Self::decode(b)).collect()
    }

    async fn replace(&self, lead: &StoredLead) -> Result<(), DependencyError> {
        let body = Self::encode(lead)?;
        let updated = self.db.with_conn(|c| {
            c.execute(
                "UPDATE stored_leads SET body = ?2 WHERE lead_id = ?1",
                params![lead.lead_id.as_str(), body],
            )
        })?;
        if updated == 0 {
            return Err(DependencyError::permanent(
                Dependency::Storage,
                format!("no stored record for {}", lead.lead_id),
            ));
        }
        Ok(())
    }
}
