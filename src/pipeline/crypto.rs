//! Envelope encryption of sensitive lead fields.
//!
//! One data key is issued per operation by the key-management capability; each sensitive field
//! is sealed locally with AES-256-GCM under that key, with the field name as additional
//! authenticated data. The wrapped data key, encryption context and key version travel with every
//! ciphertext, so any holder of KMS access can decrypt or re-key a field on its own.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::app::ports::{EncryptionContext, KeyManagement, WrappedKey};
use crate::common::aead;
use crate::common::constants::{CONTEXT_LEAD_ID, CONTEXT_PURPOSE};
use crate::common::error::PipelineError;
use crate::domain::{EncryptedField, FieldValue, LeadId, LeadPayload};
use crate::pipeline::resilience::ResiliencePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Fields crossing the queue
    Transit,
    /// Fields at rest in lead storage
    Storage,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Transit => "transit",
            Purpose::Storage => "storage",
        }
    }
}

pub struct CryptoBoundary {
    kms: Arc<dyn KeyManagement>,
    policy: Arc<ResiliencePolicy>,
    sensitive_fields: BTreeSet<String>,
}

impl CryptoBoundary {
    pub fn new(
        kms: Arc<dyn KeyManagement>,
        policy: Arc<ResiliencePolicy>,
        sensitive_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            kms,
            policy,
            sensitive_fields: sensitive_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        self.sensitive_fields.contains(field)
    }

    fn context(lead_id: &LeadId, purpose: Purpose) -> EncryptionContext {
        BTreeMap::from([
            (CONTEXT_LEAD_ID.to_string(), lead_id.to_string()),
            (CONTEXT_PURPOSE.to_string(), purpose.as_str().to_string()),
        ])
    }

    /// Encrypt every plaintext sensitive field; already-encrypted fields are left alone
    pub async fn encrypt_sensitive(
        &self,
        lead_id: &LeadId,
        purpose: Purpose,
        payload: &LeadPayload,
    ) -> Result<LeadPayload, PipelineError> {
        let pending: Vec<&str> = payload
            .fields
            .iter()
            .filter(|(name, value)| self.is_sensitive(name) && !value.is_encrypted())
            .map(|(name, _)| name.as_str())
            .collect();
        if pending.is_empty() {
            return Ok(payload.clone());
        }

        let context = Self::context(lead_id, purpose);
        let data_key = self
            .policy
            .call("generate_data_key", || self.kms.generate_data_key(&context))
            .await?;
        let encrypted_data_key = STANDARD.encode(&data_key.wrapped.ciphertext);

        let mut out = payload.clone();
        for name in pending {
            let Some(plaintext) = payload.text(name) else {
                continue;
            };
            let sealed = aead::seal(&data_key.plaintext, plaintext.as_bytes(), name.as_bytes())
                .map_err(|e| PipelineError::Integrity(format!("sealing {name}: {e}")))?;
            out.fields.insert(
                name.to_string(),
                FieldValue::Encrypted(EncryptedField {
                    ciphertext: STANDARD.encode(sealed),
                    encrypted_data_key: encrypted_data_key.clone(),
                    encryption_context: context.clone(),
                    key_id: self.kms.key_id().to_string(),
                    key_version: data_key.wrapped.key_version.clone(),
                }),
            );
        }
        debug!(lead_id = %lead_id, purpose = purpose.as_str(), "Sensitive fields encrypted");
        Ok(out)
    }

    /// Decrypt every encrypted field back to text
    pub async fn decrypt_sensitive(
        &self,
        lead_id: &LeadId,
        payload: &LeadPayload,
    ) -> Result<LeadPayload, PipelineError> {
        let mut keys: HashMap<(String, String), Vec<u8>> = HashMap::new();
        let mut out = payload.clone();

        for (name, value) in &payload.fields {
            let FieldValue::Encrypted(field) = value else {
                continue;
            };
            check_context(lead_id, name, field)?;

            let cache_key = (field.encrypted_data_key.clone(), field.key_version.clone());
            if !keys.contains_key(&cache_key) {
                let plaintext = self.unwrap_data_key(name, field).await?;
                keys.insert(cache_key.clone(), plaintext);
            }
            let data_key = keys
                .get(&cache_key)
                .ok_or_else(|| PipelineError::Invariant("data key cache miss".into()))?;

            let sealed = STANDARD
                .decode(&field.ciphertext)
                .map_err(|e| PipelineError::Integrity(format!("{name}: ciphertext is not base64: {e}")))?;
            let plaintext = aead::open(data_key, &sealed, name.as_bytes())
                .map_err(|e| PipelineError::Integrity(format!("{name}: {e}")))?;
            let text = String::from_utf8(plaintext)
                .map_err(|e| PipelineError::Integrity(format!("{name}: not UTF-8: {e}")))?;
            out.fields.insert(name.clone(), FieldValue::Text(text));
        }
        Ok(out)
    }

    /// Refuse a payload that would put a sensitive field at rest in plaintext
    pub fn ensure_protected(&self, payload: &LeadPayload) -> Result<(), PipelineError> {
        for (name, value) in &payload.fields {
            if !self.is_sensitive(name) {
                continue;
            }
            match value {
                FieldValue::Encrypted(field) if !field.key_version.is_empty() => {}
                FieldValue::Encrypted(_) => {
                    return Err(PipelineError::Invariant(format!(
                        "sensitive field '{name}' has no key version"
                    )))
                }
                FieldValue::Text(_) => {
                    return Err(PipelineError::Invariant(format!(
                        "sensitive field '{name}' is not encrypted"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Re-wrap data keys that are not on the current key version. Ciphertexts are untouched.
    /// Returns whether anything changed.
    pub async fn rewrap(
        &self,
        lead_id: &LeadId,
        payload: &LeadPayload,
    ) -> Result<(LeadPayload, bool), PipelineError> {
        let current = self
            .policy
            .call("current_key_version", || self.kms.current_key_version())
            .await?;

        // Fields sharing a data key keep sharing the re-wrapped one
        let mut rewrapped: HashMap<String, WrappedKey> = HashMap::new();
        let mut out = payload.clone();
        let mut changed = false;

        for (name, value) in &payload.fields {
            let FieldValue::Encrypted(field) = value else {
                continue;
            };
            if field.key_version == current {
                continue;
            }
            check_context(lead_id, name, field)?;

            let wrapped = match rewrapped.get(&field.encrypted_data_key) {
                Some(wrapped) => wrapped.clone(),
                None => {
                    let plaintext = self.unwrap_data_key(name, field).await?;
                    let context = &field.encryption_context;
                    let wrapped = self
                        .policy
                        .call("encrypt_data_key", || {
                            self.kms.encrypt_data_key(&plaintext, context)
                        })
                        .await?;
                    rewrapped.insert(field.encrypted_data_key.clone(), wrapped.clone());
                    wrapped
                }
            };

            let mut updated = field.clone();
            updated.encrypted_data_key = STANDARD.encode(&wrapped.ciphertext);
            updated.key_version = wrapped.key_version;
            updated.key_id = self.kms.key_id().to_string();
            out.fields.insert(name.clone(), FieldValue::Encrypted(updated));
            changed = true;
        }
        Ok((out, changed))
    }

    async fn unwrap_data_key(
        &self,
        name: &str,
        field: &EncryptedField,
    ) -> Result<Vec<u8>, PipelineError> {
        let wrapped = WrappedKey {
            ciphertext: STANDARD.decode(&field.encrypted_data_key).map_err(|e| {
                PipelineError::Integrity(format!("{name}: data key is not base64: {e}"))
            })?,
            key_version: field.key_version.clone(),
        };
        let context = &field.encryption_context;
        Ok(self
            .policy
            .call("decrypt_data_key", || {
                self.kms.decrypt_data_key(&wrapped, context)
            })
            .await?)
    }
}

/// A field sealed for another lead must never be accepted as this lead's data
fn check_context(lead_id: &LeadId, name: &str, field: &EncryptedField) -> Result<(), PipelineError> {
    match field.encryption_context.get(CONTEXT_LEAD_ID) {
        Some(bound) if bound == lead_id.as_str() => Ok(()),
        Some(bound) => Err(PipelineError::Integrity(format!(
            "{name} is bound to lead {bound}, not {lead_id}"
        ))),
        None => Err(PipelineError::Integrity(format!(
            "{name} carries no lead binding"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::Dependency;
    use crate::infra::LocalKms;
    use crate::pipeline::resilience::PolicyConfig;

    fn boundary() -> (CryptoBoundary, Arc<LocalKms>) {
        let kms = Arc::new(LocalKms::ephemeral("local/test", "v1"));
        let policy = Arc::new(ResiliencePolicy::new(
            Dependency::KeyManagement,
            &PolicyConfig::default(),
        ));
        let boundary = CryptoBoundary::new(kms.clone(), policy, ["email", "cpf", "name"]);
        (boundary, kms)
    }

    fn payload() -> LeadPayload {
        let mut p = LeadPayload::default()
            .with_field("email", "ana@example.com")
            .with_field("cpf", "52998224725");
        p.attributes.insert("campaign".into(), "spring".into());
        p
    }

    fn id(s: &str) -> LeadId {
        LeadId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_encrypt_then_decrypt() {
        let (crypto, _) = boundary();
        let sealed = crypto
            .encrypt_sensitive(&id("L1"), Purpose::Storage, &payload())
            .await
            .unwrap();
        crypto.ensure_protected(&sealed).unwrap();

        let FieldValue::Encrypted(email) = &sealed.fields["email"] else {
            panic!("email must be encrypted");
        };
        assert_eq!(email.key_version, "v1");
        assert_eq!(email.encryption_context["purpose"], "storage");
        assert!(!email.ciphertext.contains("ana@example.com"));
        assert_eq!(sealed.attributes["campaign"], "spring");

        let opened = crypto.decrypt_sensitive(&id("L1"), &sealed).await.unwrap();
        assert_eq!(opened, payload());
    }

    #[tokio::test]
    async fn test_refuses_field_bound_to_another_lead() {
        let (crypto, _) = boundary();
        let other = crypto
            .encrypt_sensitive(&id("L2"), Purpose::Transit, &payload())
            .await
            .unwrap();
        let err = crypto.decrypt_sensitive(&id("L1"), &other).await.unwrap_err();
        assert!(matches!(err, PipelineError::Integrity(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_swapped_field_fails_authentication() {
        let (crypto, _) = boundary();
        let mut sealed = crypto
            .encrypt_sensitive(&id("L1"), Purpose::Storage, &payload())
            .await
            .unwrap();
        let cpf = sealed.fields["cpf"].clone();
        sealed.fields.insert("email".into(), cpf);
        let err = crypto.decrypt_sensitive(&id("L1"), &sealed).await.unwrap_err();
        assert!(matches!(err, PipelineError::Integrity(_)));
    }

    #[test]
    fn test_ensure_protected_flags_plaintext() {
        let (crypto, _) = boundary();
        let err = crypto.ensure_protected(&payload()).unwrap_err();
        assert!(matches!(err, PipelineError::Invariant(_)));
        // Non-sensitive fields may stay in plaintext
        crypto
            .ensure_protected(&LeadPayload::default().with_field("source", "web"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_rewrap_moves_old_fields_to_current_version() {
        let (crypto, kms) = boundary();
        let sealed = crypto
            .encrypt_sensitive(&id("L1"), Purpose::Storage, &payload())
            .await
            .unwrap();

        let (same, changed) = crypto.rewrap(&id("L1"), &sealed).await.unwrap();
        assert!(!changed);
        assert_eq!(same, sealed);

        kms.rotate("v2", aead::random_key());
        let (rotated, changed) = crypto.rewrap(&id("L1"), &sealed).await.unwrap();
        assert!(changed);
        for value in rotated.fields.values() {
            let FieldValue::Encrypted(f) = value else {
                panic!("field lost its encryption");
            };
            assert_eq!(f.key_version, "v2");
        }
        let FieldValue::Encrypted(before) = &sealed.fields["cpf"] else { unreachable!() };
        let FieldValue::Encrypted(after) = &rotated.fields["cpf"] else { unreachable!() };
        assert_eq!(before.ciphertext, after.ciphertext);

        let opened = crypto.decrypt_sensitive(&id("L1"), &rotated).await.unwrap();
        assert_eq!(opened, payload());
    }
}
