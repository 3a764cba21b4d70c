// Inbound path: per-caller rate limiting and the ingestion gateway

pub mod gateway;
pub mod rate_limiter;

pub use gateway::IngestionGateway;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
