//! AES-256-GCM authenticated encryption.
//!
//! Wraps the RustCrypto `aes-gcm` implementation for sealing vault file
//! payloads and wrapped keys.
//!
//! # Security Properties
//! - 256-bit key strength
//! - 96-bit nonces (must never be reused with the same key)
//! - 128-bit authentication tag (prevents tampering)
//! - Associated Data (AAD) support for context binding
//!
//! # Example
//! ```
//! use vaulthalla_crypto::aead::Aes256GcmCipher;
//!
//! let key = [42u8; 32];
//! let cipher = Aes256GcmCipher::new(&key).unwrap();
//!
//! let (iv, ciphertext) = cipher.encrypt(b"vault payload", b"").unwrap();
//! let plaintext = cipher.decrypt(&iv, &ciphertext, b"").unwrap();
//! assert_eq!(&plaintext[..], b"vault payload");
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use vaulthalla_core::{Error, Result};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size in bytes (96 bits)
pub const IV_SIZE: usize = 12;

/// Authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Data key size in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// A zeroizing wrapper for AES-256-GCM keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// # Errors
    /// Fails `Corrupt` if the input is not exactly 32 bytes — a wrong-size
    /// key can only come from a damaged key row.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::Corrupt(format!(
                "invalid data key length: expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes: array })
    }

    /// Generates a new random key from OS randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// AES-256-GCM cipher with per-call random IVs.
pub struct Aes256GcmCipher {
    key: EncryptionKey,
}

impl Aes256GcmCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        Ok(Self {
            key: EncryptionKey::from_bytes(key)?,
        })
    }

    pub fn from_key(key: EncryptionKey) -> Self {
        Self { key }
    }

    pub fn new_random() -> Self {
        Self {
            key: EncryptionKey::generate(),
        }
    }

    /// Encrypts plaintext with optional associated data.
    ///
    /// Returns the fresh random IV and the ciphertext (authentication tag
    /// appended). The AAD is authenticated but not encrypted; decryption
    /// with a different AAD fails.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<([u8; IV_SIZE], Vec<u8>)> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let cipher = Aes256Gcm::new(self.key.as_bytes().into());
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| Error::Internal(format!("encryption failed: {e}")))?;

        Ok((iv, ciphertext))
    }

    /// Decrypts ciphertext, verifying the authentication tag first.
    ///
    /// # Errors
    /// - `Corrupt` on a wrong-size IV or tag mismatch (tampering, wrong
    ///   key, or wrong AAD). Never retried.
    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != IV_SIZE {
            return Err(Error::Corrupt(format!(
                "invalid IV length: expected {IV_SIZE} bytes, got {}",
                iv.len()
            )));
        }
        let nonce = Nonce::from_slice(iv);

        let cipher = Aes256Gcm::new(self.key.as_bytes().into());
        cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| Error::Corrupt("authentication tag mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = Aes256GcmCipher::new(&[42u8; 32]).unwrap();
        let plaintext = b"hello vaulthalla";

        let (iv, ciphertext) = cipher.encrypt(plaintext, b"").unwrap();
        assert_ne!(&ciphertext[..plaintext.len()], plaintext);
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);

        let decrypted = cipher.decrypt(&iv, &ciphertext, b"").unwrap();
        assert_eq!(plaintext, &decrypted[..]);
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let cipher = Aes256GcmCipher::new_random();
        let (iv1, ct1) = cipher.encrypt(b"same input", b"").unwrap();
        let (iv2, ct2) = cipher.encrypt(b"same input", b"").unwrap();
        assert_ne!(iv1, iv2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_tampered_ciphertext_is_corrupt() {
        let cipher = Aes256GcmCipher::new_random();
        let (iv, mut ciphertext) = cipher.encrypt(b"secret", b"").unwrap();
        ciphertext[0] ^= 0xFF;

        let err = cipher.decrypt(&iv, &ciphertext, b"").unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_wrong_aad_rejected() {
        let cipher = Aes256GcmCipher::new_random();
        let (iv, ciphertext) = cipher.encrypt(b"secret", b"jwt-secret").unwrap();

        assert!(cipher.decrypt(&iv, &ciphertext, b"other").is_err());
        assert!(cipher.decrypt(&iv, &ciphertext, b"jwt-secret").is_ok());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let cipher = Aes256GcmCipher::new(&[1u8; 32]).unwrap();
        let other = Aes256GcmCipher::new(&[2u8; 32]).unwrap();

        let (iv, ciphertext) = cipher.encrypt(b"secret", b"").unwrap();
        assert!(matches!(
            other.decrypt(&iv, &ciphertext, b"").unwrap_err(),
            Error::Corrupt(_)
        ));
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = Aes256GcmCipher::new_random();
        let (iv, ciphertext) = cipher.encrypt(b"", b"").unwrap();
        assert_eq!(ciphertext.len(), TAG_SIZE);
        assert_eq!(cipher.decrypt(&iv, &ciphertext, b"").unwrap().len(), 0);
    }

    #[test]
    fn test_invalid_key_and_iv_lengths() {
        assert!(Aes256GcmCipher::new(&[0u8; 31]).is_err());
        assert!(Aes256GcmCipher::new(&[0u8; 33]).is_err());

        let cipher = Aes256GcmCipher::new_random();
        let err = cipher.decrypt(&[0u8; 11], &[0u8; 32], b"").unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = EncryptionKey::generate();
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
