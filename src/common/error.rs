use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// External collaborators whose calls run under a resilience policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    Queue,
    Ledger,
    Storage,
    KeyManagement,
}

impl Dependency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::Queue => "queue",
            Dependency::Ledger => "ledger",
            Dependency::Storage => "storage",
            Dependency::KeyManagement => "kms",
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failure may succeed when tried again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts, throttling, open circuits
    Transient,
    /// Authorization, configuration and integrity failures
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Failure of a queue, ledger, storage or key-management call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} {dependency} failure: {message}")]
pub struct DependencyError {
    pub dependency: Dependency,
    pub kind: FailureKind,
    pub message: String,
}

impl DependencyError {
    pub fn transient(dependency: Dependency, message: impl Into<String>) -> Self {
        Self {
            dependency,
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(dependency: Dependency, message: impl Into<String>) -> Self {
        Self {
            dependency,
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl From<rusqlite::Error> for DependencyError {
    fn from(err: rusqlite::Error) -> Self {
        // Busy/locked databases clear up on their own; everything else is a bug or bad config
        let kind = match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                FailureKind::Transient
            }
            _ => FailureKind::Permanent,
        };
        Self {
            // Callers re-tag the dependency with `for_dependency`
            dependency: Dependency::Storage,
            kind,
            message: err.to_string(),
        }
    }
}

impl DependencyError {
    pub fn for_dependency(mut self, dependency: Dependency) -> Self {
        self.dependency = dependency;
        self
    }
}

/// One violated field of a lead submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Submission rejected by the payload schema; lists every violated field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("lead payload invalid: {}", summarize(.violations))]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

fn summarize(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Caller exceeded its token bucket
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("rate limit exceeded for caller '{caller}', retry after {retry_after:?}")]
pub struct RateLimitedError {
    pub caller: String,
    pub retry_after: Duration,
}

/// Errors a synchronous submission can surface to its caller
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitedError),

    #[error("lead could not be accepted: {0}")]
    Unavailable(#[source] PipelineError),
}

/// Failures inside the asynchronous pipeline
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("encrypted field rejected: {0}")]
    Integrity(String),

    #[error("malformed queue message: {0}")]
    Malformed(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl PipelineError {
    /// Only dependency failures classified transient are worth another delivery
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Dependency(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Configuration could not be loaded or is inconsistent
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
