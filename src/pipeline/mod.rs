// Lead pipeline: ingestion, processing, crypto boundary and resilience policies

pub mod crypto;
pub mod ingestion;
pub mod processing;
pub mod resilience;

pub use crypto::{CryptoBoundary, Purpose};
