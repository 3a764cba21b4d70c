//! AES-256-GCM sealing shared by field encryption and the local key wrapper.
//!
//! Sealed output is `nonce || ciphertext || tag`.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

pub const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AeadError {
    #[error("key must be {KEY_LENGTH} bytes, got {0}")]
    KeyLength(usize),
    #[error("sealed data too short")]
    Truncated,
    #[error("authentication failed")]
    Authentication,
}

/// Fresh random key material
pub fn random_key() -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut key);
    key
}

pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AeadError::KeyLength(key.len()))?;
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| AeadError::Authentication)?;

    let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(key: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, AeadError> {
    if sealed.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(AeadError::Truncated);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AeadError::KeyLength(key.len()))?;
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LENGTH);
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Authentication)
}
