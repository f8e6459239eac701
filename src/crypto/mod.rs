//! Object encryption
//!
//! Objects are encrypted with a server data key using AES-256-GCM. The data
//! key itself is stored on every drive in `sys/encryption-key`, wrapped
//! (encrypted) with the master key from the configuration.
//!
//! Ciphertext layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;

/// AES-256 key length
pub const KEY_LEN: usize = 32;

/// Stream transform applied to object payloads
pub trait EncryptionService: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

// =============================================================================
// AES-256-GCM
// =============================================================================

pub struct AesGcmEncryption {
    cipher: Aes256Gcm,
}

impl AesGcmEncryption {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Crypto(format!("key must be {} bytes", KEY_LEN)))?;
        Ok(Self { cipher })
    }

    /// Fresh random 256-bit key
    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }
}

impl EncryptionService for AesGcmEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::Crypto("ciphertext shorter than nonce".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Crypto(format!("decryption failed: {}", e)))
    }
}

// =============================================================================
// Master Key
// =============================================================================

/// Key wrapping the data key persisted on the drives
pub struct MasterKey {
    cipher: AesGcmEncryption,
}

impl MasterKey {
    /// Parse the hex encoded master key from the configuration
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| Error::Config(format!("master key is not valid hex: {}", e)))?;
        if bytes.len() != KEY_LEN {
            return Err(Error::Config(format!(
                "master key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            cipher: AesGcmEncryption::new(&bytes)?,
        })
    }

    pub fn wrap(&self, data_key: &[u8]) -> Result<Vec<u8>> {
        self.cipher.encrypt(data_key)
    }

    /// Recover the data key from its wrapped form
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        let key = self.cipher.decrypt(wrapped)?;
        if key.len() != KEY_LEN {
            return Err(Error::Crypto("unwrapped data key has wrong length".to_string()));
        }
        Ok(key)
    }
}
