use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::lead::LeadId;

/// Identifies one processing attempt; commits and releases must present it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptToken(pub String);

impl AttemptToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Processing,
    Stored,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Processing => "processing",
            LedgerStatus::Stored => "stored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(LedgerStatus::Processing),
            "stored" => Some(LedgerStatus::Stored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub lead_id: LeadId,
    pub status: LedgerStatus,
    /// Owning attempt while `Processing`; cleared on commit
    pub owner: Option<AttemptToken>,
    pub claimed_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub storage_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    Admitted(AttemptToken),
    AlreadyStored { storage_ref: String },
    /// Another attempt holds an unexpired claim; it can be reclaimed after `expires_in`
    AlreadyInFlight { expires_in: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Another attempt committed first; the caller's write is a duplicate
    AlreadyStored { storage_ref: String },
    /// The claim expired and was taken over (or released) before this commit
    LostOwnership,
}
