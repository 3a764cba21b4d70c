use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::common::error::FieldViolation;

/// Idempotency key of a lead; stable across client retries and queue redeliveries
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadId(String);

impl LeadId {
    const MAX_LENGTH: usize = 128;

    /// Validate a client-supplied identifier
    pub fn parse(raw: &str) -> Result<Self, FieldViolation> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(FieldViolation::new("leadId", "must not be empty"));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(FieldViolation::new(
                "leadId",
                format!("must be at most {} characters", Self::MAX_LENGTH),
            ));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(FieldViolation::new(
                "leadId",
                "may only contain letters, digits, '-', '_', '.' and ':'",
            ));
        }
        Ok(Self(id.to_string()))
    }

    /// Derive the identifier from the normalized payload so replays collapse to one lead
    pub fn derive(payload: &LeadPayload) -> Self {
        // BTreeMaps serialize in key order, so the encoding is canonical
        let canonical = serde_json::to_vec(payload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(b"lead-v1|");
        hasher.update(&canonical);
        Self(format!("lead-{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadStatus {
    Accepted,
    Processing,
    Stored,
    DeadLettered,
}

impl LeadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Stored | LeadStatus::DeadLettered)
    }
}

/// Ciphertext of one sensitive field plus everything needed to decrypt or re-key it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    /// base64(nonce || ciphertext || tag)
    pub ciphertext: String,
    /// base64 of the data key as wrapped by the key-management capability
    pub encrypted_data_key: String,
    pub encryption_context: BTreeMap<String, String>,
    pub key_id: String,
    pub key_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Encrypted(EncryptedField),
}

impl FieldValue {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, FieldValue::Encrypted(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Encrypted(_) => None,
        }
    }
}

/// Structured lead content: named fields (some sensitive) plus free-form attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadPayload {
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl LeadPayload {
    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields
            .insert(name.to_string(), FieldValue::Text(value.into()));
        self
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_text)
    }
}

/// A submission as it travels through the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub lead_id: LeadId,
    pub submitted_at: DateTime<Utc>,
    pub payload: LeadPayload,
    pub status: LeadStatus,
    pub correlation_id: String,
}

impl Lead {
    pub fn accepted(lead_id: LeadId, payload: LeadPayload, correlation_id: String) -> Self {
        Self {
            lead_id,
            submitted_at: Utc::now(),
            payload,
            status: LeadStatus::Accepted,
            correlation_id,
        }
    }
}

/// The durable record written by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLead {
    pub lead_id: LeadId,
    pub submitted_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
    pub payload: LeadPayload,
    pub status: LeadStatus,
    pub correlation_id: String,
}

impl StoredLead {
    pub fn from_lead(lead: &Lead, payload: LeadPayload) -> Self {
        Self {
            lead_id: lead.lead_id.clone(),
            submitted_at: lead.submitted_at,
            stored_at: Utc::now(),
            payload,
            status: LeadStatus::Stored,
            correlation_id: lead.correlation_id.clone(),
        }
    }
}

/// What the gateway hands back: accepted for processing, not yet stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptanceReceipt {
    pub lead_id: LeadId,
    pub message_id: String,
    pub correlation_id: String,
    pub status: LeadStatus,
    pub accepted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_id_is_deterministic() {
        let a = LeadPayload::default()
            .with_field("email", "a@b.com")
            .with_field("name", "Ana");
        let b = LeadPayload::default()
            .with_field("name", "Ana")
            .with_field("email", "a@b.com");
        assert_eq!(LeadId::derive(&a), LeadId::derive(&b));

        let c = a.clone().with_field("phone", "5511999998888");
        assert_ne!(LeadId::derive(&a), LeadId::derive(&c));
        assert!(LeadId::derive(&a).as_str().starts_with("lead-"));
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert!(LeadId::parse("L1").is_ok());
        assert_eq!(LeadId::parse("  L1 ").unwrap().as_str(), "L1");
        assert!(LeadId::parse("").is_err());
        assert!(LeadId::parse("has space").is_err());
        assert!(LeadId::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_field_value_untagged_serde() {
        let payload = LeadPayload::default().with_field("email", "a@b.com");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["fields"]["email"], "a@b.com");

        let enc = FieldValue::Encrypted(EncryptedField {
            ciphertext: "Y3Q=".into(),
            encrypted_data_key: "a2V5".into(),
            encryption_context: BTreeMap::new(),
            key_id: "leads".into(),
            key_version: "v1".into(),
        });
        let back: FieldValue = serde_json::from_value(serde_json::to_value(&enc).unwrap()).unwrap();
        assert_eq!(back, enc);
    }
}
