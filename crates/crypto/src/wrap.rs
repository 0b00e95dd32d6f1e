//! Key wrapping under the master key
//!
//! Vault data keys, API-key secrets and internal secrets are stored as
//! AES-256-GCM ciphertext under the sealed master key, each with a fresh
//! wrap IV persisted alongside.

use vaulthalla_core::Result;
use vaulthalla_sealed_key::MasterKey;

use crate::aead::Aes256GcmCipher;

/// Wrap secret bytes under the master key. Returns `(wrapped, iv)`.
pub fn wrap(master: &MasterKey, plain: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cipher = Aes256GcmCipher::new(master.as_bytes())?;
    let (iv, wrapped) = cipher.encrypt(plain, aad)?;
    Ok((wrapped, iv.to_vec()))
}

/// Unwrap previously wrapped bytes.
///
/// # Errors
/// `Corrupt` when the blob or IV was damaged or the master key changed
/// without a re-wrap pass.
pub fn unwrap(master: &MasterKey, wrapped: &[u8], iv: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256GcmCipher::new(master.as_bytes())?;
    cipher.decrypt(iv, wrapped, aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let master = MasterKey::from_bytes([3u8; 32]);
        let (wrapped, iv) = wrap(&master, b"data key material", b"").unwrap();
        assert_ne!(&wrapped[..17], b"data key material");

        let plain = unwrap(&master, &wrapped, &iv, b"").unwrap();
        assert_eq!(&plain[..], b"data key material");
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let master = MasterKey::from_bytes([3u8; 32]);
        let other = MasterKey::from_bytes([4u8; 32]);

        let (wrapped, iv) = wrap(&master, b"data key material", b"").unwrap();
        assert!(unwrap(&other, &wrapped, &iv, b"").is_err());
    }

    #[test]
    fn test_aad_binds_context() {
        let master = MasterKey::from_bytes([3u8; 32]);
        let (wrapped, iv) = wrap(&master, b"secret", b"jwt-secret").unwrap();

        assert!(unwrap(&master, &wrapped, &iv, b"jwt-secret").is_ok());
        assert!(unwrap(&master, &wrapped, &iv, b"api-key").is_err());
    }
}
