//! Local key-management capability: a versioned keyring of AES-256 master keys.
//!
//! Data keys are wrapped with AES-256-GCM under the current master key; the encryption context is
//! bound as additional authenticated data so a wrapped key only unwraps for the context it was
//! issued for. Rotation adds a version and makes it current; old versions keep unwrapping.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

use crate::app::ports::{DataKey, EncryptionContext, KeyManagement, WrappedKey};
use crate::common::aead::{self, KEY_LENGTH};
use crate::common::error::{ConfigError, Dependency, DependencyError};
use crate::config::KmsConfig;

#[derive(Debug)]
struct Keyring {
    current: String,
    keys: BTreeMap<String, [u8; KEY_LENGTH]>,
}

#[derive(Debug)]
pub struct LocalKms {
    key_id: String,
    keyring: RwLock<Keyring>,
}

fn kms_error(message: impl Into<String>) -> DependencyError {
    DependencyError::permanent(Dependency::KeyManagement, message)
}

impl LocalKms {
    pub fn new(
        key_id: impl Into<String>,
        current: impl Into<String>,
        keys: BTreeMap<String, [u8; KEY_LENGTH]>,
    ) -> Result<Self, ConfigError> {
        let current = current.into();
        if !keys.contains_key(&current) {
            return Err(ConfigError::Invalid {
                key: "kms.current_version".into(),
                message: format!("no master key for version '{current}'"),
            });
        }
        Ok(Self {
            key_id: key_id.into(),
            keyring: RwLock::new(Keyring { current, keys }),
        })
    }

    /// Single random master key; ciphertexts do not survive a restart
    pub fn ephemeral(key_id: impl Into<String>, version: impl Into<String>) -> Self {
        let version = version.into();
        let keys = BTreeMap::from([(version.clone(), aead::random_key())]);
        Self {
            key_id: key_id.into(),
            keyring: RwLock::new(Keyring {
                current: version,
                keys,
            }),
        }
    }

    pub fn from_config(config: &KmsConfig) -> Result<Self, ConfigError> {
        if config.master_keys.is_empty() {
            warn!(
                key_id = %config.key_id,
                "No master keys configured, using an ephemeral key; stored leads will not decrypt after restart"
            );
            return Ok(Self::ephemeral(&config.key_id, &config.current_version));
        }
        let mut keys = BTreeMap::new();
        for (version, encoded) in &config.master_keys {
            keys.insert(version.clone(), decode_master_key(version, encoded)?);
        }
        Self::new(&config.key_id, &config.current_version, keys)
    }

    /// Add `version` and make it current
    pub fn rotate(&self, version: impl Into<String>, key: [u8; KEY_LENGTH]) {
        let version = version.into();
        let mut ring = self.keyring.write().unwrap_or_else(PoisonError::into_inner);
        ring.keys.insert(version.clone(), key);
        info!(key_id = %self.key_id, version = %version, "Master key rotated");
        ring.current = version;
    }

    fn aad(&self, version: &str, context: &EncryptionContext) -> Result<Vec<u8>, DependencyError> {
        let ctx = serde_json::to_string(context).map_err(|e| kms_error(e.to_string()))?;
        Ok(format!("{}|{}|{}", self.key_id, version, ctx).into_bytes())
    }

    fn wrap(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<WrappedKey, DependencyError> {
        let ring = self.keyring.read().unwrap_or_else(PoisonError::into_inner);
        let version = ring.current.clone();
        let master = ring
            .keys
            .get(&version)
            .ok_or_else(|| kms_error(format!("current key version '{version}' missing")))?;
        let ciphertext = aead::seal(master, plaintext, &self.aad(&version, context)?)
            .map_err(|e| kms_error(format!("wrap failed: {e}")))?;
        Ok(WrappedKey {
            ciphertext,
            key_version: version,
        })
    }
}

fn decode_master_key(version: &str, encoded: &str) -> Result<[u8; KEY_LENGTH], ConfigError> {
    let invalid = |message: String| ConfigError::Invalid {
        key: format!("kms.master_keys.{version}"),
        message,
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| invalid(format!("invalid base64: {e}")))?;
    <[u8; KEY_LENGTH]>::try_from(bytes.as_slice())
        .map_err(|_| invalid(format!("key must be {KEY_LENGTH} bytes, got {}", bytes.len())))
}

#[async_trait]
impl KeyManagement for LocalKms {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn current_key_version(&self) -> Result<String, DependencyError> {
        Ok(self
            .keyring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone())
    }

    async fn generate_data_key(
        &self,
        context: &EncryptionContext,
    ) -> Result<DataKey, DependencyError> {
        let plaintext = aead::random_key().to_vec();
        let wrapped = self.wrap(&plaintext, context)?;
        Ok(DataKey { plaintext, wrapped })
    }

    async fn encrypt_data_key(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<WrappedKey, DependencyError> {
        self.wrap(plaintext, context)
    }

    async fn decrypt_data_key(
        &self,
        wrapped: &WrappedKey,
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, DependencyError> {
        let ring = self.keyring.read().unwrap_or_else(PoisonError::into_inner);
        let master = ring.keys.get(&wrapped.key_version).ok_or_else(|| {
            kms_error(format!("unknown key version '{}'", wrapped.key_version))
        })?;
        aead::open(
            master,
            &wrapped.ciphertext,
            &self.aad(&wrapped.key_version, context)?,
        )
        .map_err(|e| kms_error(format!("data key rejected (context mismatch or corrupt): {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(lead: &str) -> EncryptionContext {
        BTreeMap::from([
            ("lead_id".to_string(), lead.to_string()),
            ("purpose".to_string(), "storage".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_data_key_unwraps_only_under_its_context() {
        let kms = LocalKms::ephemeral("local/test", "v1");
        let key = kms.generate_data_key(&ctx("L1")).await.unwrap();
        assert_eq!(key.plaintext.len(), KEY_LENGTH);
        assert_eq!(key.wrapped.key_version, "v1");

        let unwrapped = kms.decrypt_data_key(&key.wrapped, &ctx("L1")).await.unwrap();
        assert_eq!(unwrapped, key.plaintext);

        let err = kms.decrypt_data_key(&key.wrapped, &ctx("L2")).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_rotation_keeps_old_versions_readable() {
        let kms = LocalKms::ephemeral("local/test", "v1");
        let old = kms.generate_data_key(&ctx("L1")).await.unwrap();

        kms.rotate("v2", aead::random_key());
        assert_eq!(kms.current_key_version().await.unwrap(), "v2");

        let rewrapped = kms.encrypt_data_key(&old.plaintext, &ctx("L1")).await.unwrap();
        assert_eq!(rewrapped.key_version, "v2");
        assert_eq!(
            kms.decrypt_data_key(&old.wrapped, &ctx("L1")).await.unwrap(),
            old.plaintext
        );
        assert_eq!(
            kms.decrypt_data_key(&rewrapped, &ctx("L1")).await.unwrap(),
            old.plaintext
        );
    }

    #[test]
    fn test_from_config_validates_keys() {
        let mut config = KmsConfig::default();
        config
            .master_keys
            .insert("v1".into(), STANDARD.encode([7u8; KEY_LENGTH]));
        let kms = LocalKms::from_config(&config).unwrap();
        assert_eq!(kms.key_id(), "local/lead-pipeline");

        config.master_keys.insert("v1".into(), STANDARD.encode([7u8; 16]));
        assert!(LocalKms::from_config(&config).is_err());

        config.master_keys.insert("v1".into(), "not base64!".into());
        assert!(LocalKms::from_config(&config).is_err());
    }
}
