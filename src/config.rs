//! Application configuration: TOML file, then `LEADS_*` environment overrides, then validation.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::constants::{DEFAULT_SENSITIVE_FIELDS, MAX_RECEIVE_BATCH};
use crate::common::error::ConfigError;
use crate::pipeline::ingestion::rate_limiter::RateLimitConfig;
use crate::pipeline::processing::WorkerConfig;
use crate::pipeline::resilience::ResilienceConfig;

pub const DEFAULT_CONFIG_PATH: &str = "lead_pipeline.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub kms: KmsConfig,
    pub crypto: CryptoConfig,
    pub worker: WorkerConfig,
    pub resilience: ResilienceConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Sqlite,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Memory => write!(f, "memory"),
            Backend::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "sqlite" => Ok(Backend::Sqlite),
            other => Err(format!("unknown backend '{other}', expected memory or sqlite")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: Backend,
    pub path: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            path: PathBuf::from("data/queue.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: Backend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            path: PathBuf::from("data/leads.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: Backend,
    pub path: PathBuf,
    /// A processing claim older than this may be taken over by another attempt
    pub claim_ttl_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            path: PathBuf::from("data/ledger.db"),
            claim_ttl_ms: 300_000,
        }
    }
}

impl LedgerConfig {
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    pub key_id: String,
    pub current_version: String,
    /// Base64 AES-256 master keys by version; empty means an ephemeral development key
    pub master_keys: BTreeMap<String, String>,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            key_id: "local/lead-pipeline".to_string(),
            current_version: "v1".to_string(),
            master_keys: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub sensitive_fields: Vec<String>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            sensitive_fields: DEFAULT_SENSITIVE_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
    /// Also write JSON lines to daily rolling files under `dir`
    pub json_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_prefix: "lead_pipeline.log".to_string(),
            json_file: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Prometheus scrape listener, e.g. "127.0.0.1:9898"
    pub listen_addr: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: None,
        }
    }
}

impl AppConfig {
    /// Load from `path`, or from `lead_pipeline.toml` when present, then apply the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `LEADS_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LEADS_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("LEADS_QUEUE_BACKEND") {
            self.queue.backend = parse_env("LEADS_QUEUE_BACKEND", &v)?;
        }
        if let Some(v) = lookup("LEADS_QUEUE_PATH") {
            self.queue.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LEADS_STORAGE_BACKEND") {
            self.storage.backend = parse_env("LEADS_STORAGE_BACKEND", &v)?;
        }
        if let Some(v) = lookup("LEADS_STORAGE_PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LEADS_LEDGER_BACKEND") {
            self.ledger.backend = parse_env("LEADS_LEDGER_BACKEND", &v)?;
        }
        if let Some(v) = lookup("LEADS_LEDGER_PATH") {
            self.ledger.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LEADS_CLAIM_TTL_MS") {
            self.ledger.claim_ttl_ms = parse_env("LEADS_CLAIM_TTL_MS", &v)?;
        }
        if let Some(v) = lookup("LEADS_KMS_KEY_ID") {
            self.kms.key_id = v;
        }
        if let Some(v) = lookup("LEADS_KMS_CURRENT_VERSION") {
            self.kms.current_version = v;
        }
        if let Some(v) = lookup("LEADS_KMS_MASTER_KEY") {
            self.kms
                .master_keys
                .insert(self.kms.current_version.clone(), v);
        }
        if let Some(v) = lookup("LEADS_WORKERS") {
            self.worker.workers = parse_env("LEADS_WORKERS", &v)?;
        }
        if let Some(v) = lookup("LEADS_LEASE_MS") {
            self.worker.lease_ms = parse_env("LEADS_LEASE_MS", &v)?;
        }
        if let Some(v) = lookup("LEADS_MAX_DELIVERY_COUNT") {
            self.worker.max_delivery_count = parse_env("LEADS_MAX_DELIVERY_COUNT", &v)?;
        }
        if let Some(v) = lookup("LEADS_RATE_LIMIT_CAPACITY") {
            self.rate_limit.capacity = parse_env("LEADS_RATE_LIMIT_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("LEADS_RATE_LIMIT_REFILL_PER_SECOND") {
            self.rate_limit.refill_per_second = parse_env("LEADS_RATE_LIMIT_REFILL_PER_SECOND", &v)?;
        }
        if let Some(v) = lookup("LEADS_LOG_DIR") {
            self.logging.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LEADS_METRICS_ADDR") {
            self.metrics.listen_addr = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.worker;
        if w.workers == 0 {
            return Err(invalid("worker.workers", "must be at least 1"));
        }
        if w.batch_size == 0 || w.batch_size > MAX_RECEIVE_BATCH {
            return Err(invalid(
                "worker.batch_size",
                format!("must be between 1 and {MAX_RECEIVE_BATCH}"),
            ));
        }
        if w.message_concurrency == 0 {
            return Err(invalid("worker.message_concurrency", "must be at least 1"));
        }
        if w.lease_ms < 1_000 {
            return Err(invalid("worker.lease_ms", "must be at least 1000"));
        }
        if w.max_delivery_count == 0 {
            return Err(invalid("worker.max_delivery_count", "must be at least 1"));
        }
        if w.max_processing_ms < w.lease_ms {
            return Err(invalid(
                "worker.max_processing_ms",
                "must not be shorter than worker.lease_ms",
            ));
        }
        // A live attempt must not lose its claim while it may still be running
        if self.ledger.claim_ttl_ms < w.max_processing_ms {
            return Err(invalid(
                "ledger.claim_ttl_ms",
                "must be at least worker.max_processing_ms",
            ));
        }
        if self.rate_limit.capacity == 0 {
            return Err(invalid("rate_limit.capacity", "must be at least 1"));
        }
        if !(self.rate_limit.refill_per_second > 0.0) {
            return Err(invalid("rate_limit.refill_per_second", "must be positive"));
        }
        if self.kms.key_id.trim().is_empty() {
            return Err(invalid("kms.key_id", "must not be empty"));
        }
        if !self.kms.master_keys.is_empty()
            && !self.kms.master_keys.contains_key(&self.kms.current_version)
        {
            return Err(invalid(
                "kms.current_version",
                format!("no master key configured for '{}'", self.kms.current_version),
            ));
        }
        if self.crypto.sensitive_fields.is_empty() {
            return Err(invalid("crypto.sensitive_fields", "must list at least one field"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, e.to_string()))
}
