//! Payload encryption for stored documents
//!
//! Application-level encrypt/decrypt consumed by storage providers when the
//! `encryption_enabled` policy toggle is set. Supports key rotation via key
//! IDs: encryption always uses the active key, decryption accepts any
//! registered key.

use crate::error::{Result, RuntimeError};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Encrypted envelope stored in place of the plaintext payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Identifies which key was used for encryption
    pub key_id: String,

    /// Base64-encoded nonce (96-bit for AES-256-GCM)
    pub nonce: String,

    /// Base64-encoded ciphertext
    pub ciphertext: String,

    /// Marker to identify encrypted payloads
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
}

fn default_encrypted() -> bool {
    true
}

impl EncryptedPayload {
    /// Check if a JSON value is an encrypted envelope
    pub fn is_encrypted(value: &serde_json::Value) -> bool {
        value
            .get("encrypted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Trait for encrypting and decrypting JSON payloads
pub trait PayloadEncryptor: Send + Sync {
    /// Encrypt a JSON payload, returning an encrypted envelope as JSON
    fn encrypt(&self, payload: &serde_json::Value) -> Result<serde_json::Value>;

    /// Decrypt an encrypted envelope back to the original JSON payload
    fn decrypt(&self, encrypted: &serde_json::Value) -> Result<serde_json::Value>;

    /// The current active key ID used for encryption
    fn active_key_id(&self) -> &str;
}

/// AES-256-GCM encryptor with key rotation support
pub struct Aes256GcmEncryptor {
    active_key_id: String,
    /// All registered keys (key_id → cipher)
    keys: RwLock<HashMap<String, Aes256Gcm>>,
}

impl Aes256GcmEncryptor {
    /// Create a new encryptor with a single 32-byte key
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        let key_id = key_id.into();
        let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), cipher);

        Self {
            active_key_id: key_id,
            keys: RwLock::new(keys),
        }
    }

    /// Create an encryptor from a base64-encoded 32-byte key
    /// (the `LIGHTNING_ENCRYPTION_KEY` format)
    pub fn from_base64(key_id: impl Into<String>, encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| RuntimeError::Config(format!("Invalid encryption key encoding: {}", e)))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            RuntimeError::Config("Encryption key must be exactly 32 bytes".to_string())
        })?;
        Ok(Self::new(key_id, &key))
    }

    /// Register an additional key for decryption (key rotation)
    pub fn add_key(&self, key_id: impl Into<String>, key: &[u8; 32]) -> Result<()> {
        let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
        let mut keys = self
            .keys
            .write()
            .map_err(|e| RuntimeError::Provider(format!("Key table lock poisoned: {}", e)))?;
        keys.insert(key_id.into(), cipher);
        Ok(())
    }

    /// Rotate to a new active key; the key must already be registered
    pub fn rotate_to(&mut self, key_id: &str) -> Result<()> {
        let keys = self
            .keys
            .read()
            .map_err(|e| RuntimeError::Provider(format!("Key table lock poisoned: {}", e)))?;
        if !keys.contains_key(key_id) {
            return Err(RuntimeError::Config(format!(
                "Key '{}' not registered, add it first",
                key_id
            )));
        }
        drop(keys);
        self.active_key_id = key_id.to_string();
        Ok(())
    }

    /// List all registered key IDs
    pub fn key_ids(&self) -> Vec<String> {
        self.keys
            .read()
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl PayloadEncryptor for Aes256GcmEncryptor {
    fn encrypt(&self, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let plaintext = serde_json::to_vec(payload)?;

        let keys = self
            .keys
            .read()
            .map_err(|e| RuntimeError::Provider(format!("Key table lock poisoned: {}", e)))?;
        let cipher = keys.get(&self.active_key_id).ok_or_else(|| {
            RuntimeError::Config(format!("Active key '{}' not found", self.active_key_id))
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| RuntimeError::Storage(format!("Encryption failed: {}", e)))?;

        let envelope = EncryptedPayload {
            key_id: self.active_key_id.clone(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            encrypted: true,
        };

        serde_json::to_value(envelope).map_err(Into::into)
    }

    fn decrypt(&self, encrypted: &serde_json::Value) -> Result<serde_json::Value> {
        let envelope: EncryptedPayload = serde_json::from_value(encrypted.clone())?;

        let keys = self
            .keys
            .read()
            .map_err(|e| RuntimeError::Provider(format!("Key table lock poisoned: {}", e)))?;
        let cipher = keys.get(&envelope.key_id).ok_or_else(|| {
            RuntimeError::Config(format!(
                "Decryption key '{}' not registered",
                envelope.key_id
            ))
        })?;

        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| RuntimeError::Storage(format!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(RuntimeError::Storage(format!(
                "Invalid nonce length: {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| RuntimeError::Storage(format!("Invalid ciphertext encoding: {}", e)))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| RuntimeError::Storage(format!("Decryption failed: {}", e)))?;

        serde_json::from_slice(&plaintext).map_err(Into::into)
    }

    fn active_key_id(&self) -> &str {
        &self.active_key_id
    }
}
