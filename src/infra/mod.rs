//! Adapters behind the ports in `app::ports`: in-memory and SQLite backends plus the local
//! key-management keyring.

pub mod local_kms;
pub mod memory_ledger;
pub mod memory_queue;
pub mod memory_store;
pub mod sqlite;
pub mod sqlite_ledger;
pub mod sqlite_queue;
pub mod sqlite_store;

pub use local_kms::LocalKms;
pub use memory_ledger::InMemoryLedger;
pub use memory_queue::InMemoryQueue;
pub use memory_store::InMemoryLeadStore;
pub use sqlite_ledger::SqliteLedger;
pub use sqlite_queue::SqliteQueue;
pub use sqlite_store::SqliteLeadStore;
