//! AES-256-GCM encryption for sensitive store columns.
//!
//! Ciphertext is `hex(nonce || ct || tag)` with a random 96-bit nonce.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{FlowforgeError, Result};

pub const MASTER_KEY_ENV: &str = "FLOWFORGE_MASTER_KEY";
const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct FieldCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    /// Parses a 64-character hex key.
    pub fn from_hex(raw: &str) -> Result<Self> {
        let bytes = hex::decode(raw.trim()).map_err(|err| {
            FlowforgeError::Crypto(format!("{} must be hex: {}", MASTER_KEY_ENV, err))
        })?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            FlowforgeError::Crypto(format!(
                "{} must be 64 hex characters (32 bytes)",
                MASTER_KEY_ENV
            ))
        })?;
        Ok(Self { key })
    }

    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(MASTER_KEY_ENV)
            .map_err(|_| FlowforgeError::Config(format!("{} is required", MASTER_KEY_ENV)))?;
        Self::from_hex(&raw)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|err| FlowforgeError::Crypto(format!("AES-GCM encryption failed: {err}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = hex::decode(encoded.trim())
            .map_err(|err| FlowforgeError::Crypto(format!("ciphertext is not hex: {err}")))?;
        if raw.len() < NONCE_LEN + 16 {
            return Err(FlowforgeError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|err| FlowforgeError::Crypto(format!("AES-GCM decryption failed: {err}")))?;
        String::from_utf8(plain)
            .map_err(|err| FlowforgeError::Crypto(format!("plaintext is not UTF-8: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn encrypt_decrypt_with_fresh_nonces() {
        let cipher = FieldCipher::from_hex(KEY).expect("key");
        let first = cipher.encrypt("python agent.py --loop").expect("encrypt");
        let second = cipher.encrypt("python agent.py --loop").expect("encrypt");
        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first).expect("decrypt"), "python agent.py --loop");
    }

    #[test]
    fn rejects_short_or_malformed_keys() {
        assert!(FieldCipher::from_hex("abcd").is_err());
        assert!(FieldCipher::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = FieldCipher::from_hex(KEY).expect("key");
        let mut sealed = cipher.encrypt("secret").expect("encrypt");
        let last = sealed.pop().expect("non-empty");
        sealed.push(if last == '0' { '1' } else { '0' });
        assert!(cipher.decrypt(&sealed).is_err());
    }
}
