//! Payload encryption with versioned keys.
//!
//! Dehydrated payloads can be wrapped in an AES-256-GCM envelope before
//! they reach storage or a queue. Keys are versioned (`key_id:base64`);
//! the primary key encrypts, every known key decrypts, so keys can be
//! rotated without rewriting persisted runs.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{DeserializationError, SerializationError};

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const PAYLOAD_VERSION: u8 = 1;
const ALGORITHM: &str = "AES-256-GCM";

/// Encrypted envelope around a dehydrated payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Envelope format version
    pub v: u8,
    /// Encryption algorithm identifier
    pub alg: String,
    /// Version id of the key that sealed this envelope
    pub key_id: String,
    /// Base64-encoded nonce
    pub nonce: String,
    /// Base64-encoded ciphertext (includes auth tag)
    pub ciphertext: String,
}

#[derive(Clone)]
struct VersionedKey {
    id: String,
    cipher: Aes256Gcm,
}

/// Versioned-key encryption for boundary payloads.
///
/// Thread-safe; construct once per deployment and share.
#[derive(Clone)]
pub struct PayloadEncryption {
    primary: Arc<VersionedKey>,
    keys: Arc<HashMap<String, Aes256Gcm>>,
}

impl PayloadEncryption {
    /// Build from versioned key strings (`key_id:base64_key`). The first
    /// key seals new envelopes; all keys open existing ones.
    pub fn new(primary_key: &str, previous_keys: &[&str]) -> anyhow::Result<Self> {
        let (primary_id, primary_cipher) = Self::parse_versioned_key(primary_key)?;

        let mut keys = HashMap::new();
        keys.insert(primary_id.clone(), primary_cipher.clone());
        for key_str in previous_keys {
            let (id, cipher) = Self::parse_versioned_key(key_str)?;
            if keys.contains_key(&id) {
                anyhow::bail!("duplicate key id: {id}");
            }
            keys.insert(id, cipher);
        }

        Ok(Self {
            primary: Arc::new(VersionedKey {
                id: primary_id,
                cipher: primary_cipher,
            }),
            keys: Arc::new(keys),
        })
    }

    /// Build from `WORKFLOW_ENCRYPTION_KEY` (required) and
    /// `WORKFLOW_ENCRYPTION_KEY_PREVIOUS` (optional).
    pub fn from_env() -> anyhow::Result<Self> {
        let primary = std::env::var("WORKFLOW_ENCRYPTION_KEY")
            .map_err(|_| anyhow::anyhow!("WORKFLOW_ENCRYPTION_KEY environment variable not set"))?;
        let previous = std::env::var("WORKFLOW_ENCRYPTION_KEY_PREVIOUS").ok();
        let previous_refs: Vec<&str> = previous.as_deref().into_iter().collect();
        Self::new(&primary, &previous_refs)
    }

    fn parse_versioned_key(key_str: &str) -> anyhow::Result<(String, Aes256Gcm)> {
        let (key_id, encoded) = key_str
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid key format, expected 'key_id:base64_key'"))?;

        let key_bytes = BASE64
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("failed to decode key '{key_id}': {e}"))?;
        if key_bytes.len() != KEY_SIZE {
            anyhow::bail!(
                "key '{key_id}' must be {KEY_SIZE} bytes, got {}",
                key_bytes.len()
            );
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow::anyhow!("failed to create cipher for '{key_id}': {e}"))?;
        Ok((key_id.to_string(), cipher))
    }

    /// Seal a dehydrated payload.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SerializationError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .primary
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SerializationError::Encryption(e.to_string()))?;

        let envelope = EncryptedEnvelope {
            v: PAYLOAD_VERSION,
            alg: ALGORITHM.to_string(),
            key_id: self.primary.id.clone(),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(&ciphertext),
        };

        serde_json::to_vec(&envelope).map_err(|e| SerializationError::Encryption(e.to_string()))
    }

    /// Open an envelope produced by any known key version.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, DeserializationError> {
        let envelope: EncryptedEnvelope = serde_json::from_slice(data)
            .map_err(|e| DeserializationError::Decryption(e.to_string()))?;

        if envelope.v != PAYLOAD_VERSION {
            return Err(DeserializationError::Decryption(format!(
                "unsupported envelope version {}",
                envelope.v
            )));
        }
        if envelope.alg != ALGORITHM {
            return Err(DeserializationError::Decryption(format!(
                "unsupported algorithm {}",
                envelope.alg
            )));
        }

        let cipher = self.keys.get(&envelope.key_id).ok_or_else(|| {
            DeserializationError::Decryption(format!("unknown key id '{}'", envelope.key_id))
        })?;

        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| DeserializationError::Decryption(e.to_string()))?;
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| DeserializationError::Decryption(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| DeserializationError::Decryption(e.to_string()))
    }

    /// True when the data was sealed by the current primary key; callers
    /// re-seal stale envelopes opportunistically on write.
    pub fn is_current_key(&self, data: &[u8]) -> bool {
        serde_json::from_slice::<EncryptedEnvelope>(data)
            .map(|env| env.key_id == self.primary.id)
            .unwrap_or(false)
    }

    pub fn primary_key_id(&self) -> &str {
        &self.primary.id
    }
}

/// Generate a random versioned key string (`key_id:base64_key`)
pub fn generate_encryption_key(key_id: &str) -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    format!("{key_id}:{}", BASE64.encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let key = generate_encryption_key("kek-v1");
        let enc = PayloadEncryption::new(&key, &[]).unwrap();

        let sealed = enc.seal(b"devl[42]").unwrap();
        assert_ne!(sealed, b"devl[42]");
        assert_eq!(enc.open(&sealed).unwrap(), b"devl[42]");
    }

    #[test]
    fn test_key_rotation_opens_old_envelopes() {
        let key_v1 = generate_encryption_key("kek-v1");
        let key_v2 = generate_encryption_key("kek-v2");

        let old = PayloadEncryption::new(&key_v1, &[]).unwrap();
        let sealed = old.seal(b"payload").unwrap();

        let rotated = PayloadEncryption::new(&key_v2, &[&key_v1]).unwrap();
        assert_eq!(rotated.open(&sealed).unwrap(), b"payload");
        assert!(!rotated.is_current_key(&sealed));
        assert_eq!(rotated.primary_key_id(), "kek-v2");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let key_v1 = generate_encryption_key("kek-v1");
        let key_v2 = generate_encryption_key("kek-v2");

        let old = PayloadEncryption::new(&key_v1, &[]).unwrap();
        let sealed = old.seal(b"payload").unwrap();

        let other = PayloadEncryption::new(&key_v2, &[]).unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_invalid_key_strings_rejected() {
        assert!(PayloadEncryption::new("no-colon", &[]).is_err());
        assert!(PayloadEncryption::new("kek:not-base64!!!", &[]).is_err());
        let short = format!("kek:{}", BASE64.encode([0u8; 16]));
        assert!(PayloadEncryption::new(&short, &[]).is_err());
    }
}
