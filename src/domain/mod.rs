//! Domain data shapes shared across layers

pub mod lead;
pub mod ledger;
pub mod message;
pub mod schema;

pub use lead::{
    AcceptanceReceipt, EncryptedField, FieldValue, Lead, LeadId, LeadPayload, LeadStatus,
    StoredLead,
};
pub use ledger::{AttemptToken, BeginOutcome, CommitOutcome, LedgerEntry, LedgerStatus};
pub use message::{DeadLetter, QueueMessage, ReceiptHandle};
