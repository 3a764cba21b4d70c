/// Header and identity constants shared by the HTTP surface and the gateway
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const ANONYMOUS_CALLER: &str = "anonymous";

// Encryption context keys bound to every encrypted field and data key
pub const CONTEXT_LEAD_ID: &str = "lead_id";
pub const CONTEXT_PURPOSE: &str = "purpose";

// Sensitive fields when the configuration does not list any
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &["name", "email", "phone", "cpf"];

// Storage reference prefixes, one per backend
pub const MEMORY_STORAGE_PREFIX: &str = "memory:leads/";
pub const SQLITE_STORAGE_PREFIX: &str = "sqlite:stored_leads/";

/// Upper bound on messages a single receive call may lease
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Number of idle caller buckets kept before the rate limiter prunes full buckets
pub const MAX_TRACKED_CALLERS: usize = 10_000;
