use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::lead::Lead;
use crate::common::error::PipelineError;

/// Opaque lease token; valid only for the delivery that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A leased delivery of a serialized lead
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: ReceiptHandle,
    pub body: String,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn decode_lead(&self) -> Result<Lead, PipelineError> {
        serde_json::from_str(&self.body).map_err(|e| PipelineError::Malformed(e.to_string()))
    }
}

/// A message removed from circulation, kept for operator inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub reason: String,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Lead id of the dead-lettered body, when it still decodes
    pub fn lead_id(&self) -> Option<String> {
        serde_json::from_str::<Lead>(&self.body)
            .ok()
            .map(|l| l.lead_id.to_string())
    }
}
