//! Payload ciphers for the broadcast exchange.

use crate::error::{OverlayError, OverlayResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypts and decrypts broadcast payloads.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> OverlayResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> OverlayResult<Vec<u8>>;
}

/// AES-256-GCM keyed by the SHA-256 of a passphrase.
///
/// Output layout: `nonce(12) ‖ ciphertext ‖ tag(16)`.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn from_passphrase(passphrase: &str) -> OverlayResult<Self> {
        if passphrase.is_empty() {
            return Err(OverlayError::Cipher("Passphrase must not be empty".into()));
        }
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| OverlayError::Cipher(format!("Invalid key: {}", e)))?;
        Ok(Self { cipher })
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> OverlayResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| OverlayError::Cipher("Encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> OverlayResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(OverlayError::Cipher(format!(
                "Ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| OverlayError::Cipher("Decryption failed".into()))
    }
}

/// Passes payloads through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCipher;

impl Cipher for PlainCipher {
    fn encrypt(&self, plaintext: &[u8]) -> OverlayResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> OverlayResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_gcm_layout() {
        let cipher = AesGcmCipher::from_passphrase("edge").unwrap();
        let sealed = cipher.encrypt(b"{}").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 2 + TAG_LEN);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"{}");
    }

    #[test]
    fn test_aes_gcm_fresh_nonce_per_message() {
        let cipher = AesGcmCipher::from_passphrase("edge").unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_aes_gcm_wrong_passphrase() {
        let sealed = AesGcmCipher::from_passphrase("one")
            .unwrap()
            .encrypt(b"payload")
            .unwrap();
        let other = AesGcmCipher::from_passphrase("two").unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(OverlayError::Cipher(_))));
    }

    #[test]
    fn test_aes_gcm_rejects_short_input() {
        let cipher = AesGcmCipher::from_passphrase("edge").unwrap();
        assert!(cipher.decrypt(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(AesGcmCipher::from_passphrase("").is_err());
    }

    #[test]
    fn test_plain_cipher_passthrough() {
        assert_eq!(PlainCipher.encrypt(b"abc").unwrap(), b"abc");
        assert_eq!(PlainCipher.decrypt(b"abc").unwrap(), b"abc");
    }
}
