//! Per-vault encryption engine
//!
//! Owns the current data key for one vault, seals and opens file payloads,
//! and drives online key rotation. The rotation flag is atomic and the key
//! slots swap under a single lock, so observers see either the
//! pre-rotation or the post-rotation key pair, never a torn state.
//!
//! Rotation protocol:
//! 1. `prepare_key_rotation` — the store moves the active wrapped key to
//!    the trashed table and installs a fresh `version + 1` key in one
//!    transaction; the engine then swaps its slots. Encrypts from that
//!    point on stamp the new version while decrypts of `version - 1`
//!    payloads are served from the old key.
//! 2. The sync worker rewrites every old-version object via
//!    `rotate_decrypt_encrypt`.
//! 3. `finish_key_rotation` — stamps the trashed row complete and drops
//!    the old key from memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use vaulthalla_core::types::{KeyVersion, VaultId};
use vaulthalla_core::{Error, Result};
use vaulthalla_sealed_key::SealedKeyProvider;
use vaulthalla_store::model::VaultKey;
use vaulthalla_store::VaultKeyStore;

use crate::aead::{Aes256GcmCipher, EncryptionKey};
use crate::wrap;

struct KeySlots {
    version: KeyVersion,
    key: Option<EncryptionKey>,
    /// Present iff a rotation is in progress
    old_key: Option<EncryptionKey>,
}

/// Encryption engine for a single vault.
pub struct VaultEncryptionManager {
    vault_id: VaultId,
    store: Arc<dyn VaultKeyStore>,
    provider: Arc<dyn SealedKeyProvider>,
    slots: RwLock<KeySlots>,
    rotation_in_progress: AtomicBool,
}

impl VaultEncryptionManager {
    pub fn new(
        vault_id: VaultId,
        store: Arc<dyn VaultKeyStore>,
        provider: Arc<dyn SealedKeyProvider>,
    ) -> Self {
        Self {
            vault_id,
            store,
            provider,
            slots: RwLock::new(KeySlots {
                version: 0,
                key: None,
                old_key: None,
            }),
            rotation_in_progress: AtomicBool::new(false),
        }
    }

    pub fn vault_id(&self) -> VaultId {
        self.vault_id
    }

    fn master_key(&self) -> Result<vaulthalla_sealed_key::MasterKey> {
        self.provider
            .master_key()
            .map_err(|e| Error::Internal(format!("master key unavailable: {e}")))
    }

    /// Load the active wrapped key from the store and unwrap it. Resumes an
    /// interrupted rotation by also unwrapping the superseded key.
    ///
    /// # Errors
    /// - `KeyMissing` when no active key row exists
    /// - `Corrupt` when unwrapping fails
    pub async fn load_key(&self) -> Result<()> {
        let master = self.master_key()?;

        let row = self
            .store
            .active_key(self.vault_id)
            .await?
            .ok_or(Error::KeyMissing(self.vault_id))?;
        let key = EncryptionKey::from_bytes(&wrap::unwrap(&master, &row.wrapped_key, &row.iv, b"")?)?;

        let (old_key, rotating) = if self.store.rotation_in_progress(self.vault_id).await? {
            let old_row = self
                .store
                .rotation_old_key(self.vault_id)
                .await?
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "vault {} rotation in progress but old key row is gone",
                        self.vault_id
                    ))
                })?;
            let old = EncryptionKey::from_bytes(&wrap::unwrap(
                &master,
                &old_row.wrapped_key,
                &old_row.iv,
                b"",
            )?)?;
            (Some(old), true)
        } else {
            (None, false)
        };

        let mut slots = self.slots.write().expect("key slots lock poisoned");
        slots.version = row.version;
        slots.key = Some(key);
        slots.old_key = old_key;
        self.rotation_in_progress.store(rotating, Ordering::SeqCst);

        tracing::debug!(vault_id = self.vault_id, version = row.version, rotating, "vault key loaded");
        Ok(())
    }

    /// Load the active key, installing a fresh version-1 key for a vault
    /// that has never had one.
    pub async fn load_or_init_key(&self) -> Result<()> {
        match self.load_key().await {
            Err(Error::KeyMissing(_)) => {
                let master = self.master_key()?;
                let key = EncryptionKey::generate();
                let (wrapped_key, iv) = wrap::wrap(&master, key.as_bytes(), b"")?;
                self.store
                    .insert_initial_key(VaultKey {
                        vault_id: self.vault_id,
                        version: 1,
                        wrapped_key,
                        iv,
                        created_at: chrono::Utc::now(),
                    })
                    .await?;

                let mut slots = self.slots.write().expect("key slots lock poisoned");
                slots.version = 1;
                slots.key = Some(key);
                slots.old_key = None;
                self.rotation_in_progress.store(false, Ordering::SeqCst);

                tracing::info!(vault_id = self.vault_id, "installed initial vault key");
                Ok(())
            }
            other => other,
        }
    }

    pub fn key_version(&self) -> KeyVersion {
        self.slots.read().expect("key slots lock poisoned").version
    }

    pub fn rotation_in_progress(&self) -> bool {
        self.rotation_in_progress.load(Ordering::SeqCst)
    }

    /// Seal a payload under the current key. Returns the ciphertext, the
    /// base64-encoded IV for persisting next to the file row, and the key
    /// version current at call time.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, String, KeyVersion)> {
        let slots = self.slots.read().expect("key slots lock poisoned");
        let key = slots.key.as_ref().ok_or(Error::KeyMissing(self.vault_id))?;

        let cipher = Aes256GcmCipher::from_key(key.clone());
        let (iv, ciphertext) = cipher.encrypt(plaintext, b"")?;
        Ok((ciphertext, BASE64.encode(iv), slots.version))
    }

    /// Open a payload sealed at `version`.
    ///
    /// Selects the current key for the current version; during a rotation
    /// the immediately-prior version is served from the old key. Anything
    /// else fails `UnknownKeyVersion`.
    pub fn decrypt(&self, ciphertext: &[u8], b64_iv: &str, version: KeyVersion) -> Result<Vec<u8>> {
        let iv = BASE64
            .decode(b64_iv)
            .map_err(|_| Error::Corrupt("stored IV is not valid base64".into()))?;

        let slots = self.slots.read().expect("key slots lock poisoned");
        let key = if version == slots.version {
            slots.key.as_ref()
        } else if self.rotation_in_progress()
            && version + 1 == slots.version
            && slots.old_key.is_some()
        {
            slots.old_key.as_ref()
        } else {
            None
        };

        let key = key.ok_or(Error::UnknownKeyVersion {
            vault_id: self.vault_id,
            version,
        })?;
        Aes256GcmCipher::from_key(key.clone()).decrypt(&iv, ciphertext, b"")
    }

    /// Begin an online rotation: one store transaction trashes the current
    /// wrapped key and installs a fresh `version + 1` key, then the
    /// in-memory slots swap. Encrypts after this returns use the new
    /// version; decrypts of the prior version keep working until
    /// [`finish_key_rotation`](Self::finish_key_rotation).
    pub async fn prepare_key_rotation(&self) -> Result<KeyVersion> {
        let master = self.master_key()?;
        let new_key = EncryptionKey::generate();
        let (wrapped_key, iv) = wrap::wrap(&master, new_key.as_bytes(), b"")?;

        let new_version = self
            .store
            .rotate_vault_key(self.vault_id, wrapped_key, iv)
            .await?;

        {
            let mut slots = self.slots.write().expect("key slots lock poisoned");
            slots.old_key = slots.key.take();
            slots.key = Some(new_key);
            slots.version = new_version;
        }
        self.rotation_in_progress.store(true, Ordering::SeqCst);

        tracing::info!(vault_id = self.vault_id, version = new_version, "key rotation prepared");
        Ok(new_version)
    }

    /// Complete a rotation after every old-version object was rewritten.
    pub async fn finish_key_rotation(&self) -> Result<()> {
        self.store.finish_vault_key_rotation(self.vault_id).await?;

        {
            let mut slots = self.slots.write().expect("key slots lock poisoned");
            slots.old_key = None;
        }
        self.rotation_in_progress.store(false, Ordering::SeqCst);

        tracing::info!(vault_id = self.vault_id, version = self.key_version(), "key rotation finished");
        Ok(())
    }

    /// Re-seal an object bound to the superseded version under the current
    /// key. Passes input through unchanged when no rotation is in progress.
    pub fn rotate_decrypt_encrypt(
        &self,
        ciphertext: &[u8],
        b64_iv: &str,
    ) -> Result<(Vec<u8>, String)> {
        if !self.rotation_in_progress() {
            return Ok((ciphertext.to_vec(), b64_iv.to_string()));
        }

        let prior = self.key_version() - 1;
        let plaintext = self.decrypt(ciphertext, b64_iv, prior)?;
        let (new_ciphertext, new_iv, _) = self.encrypt(&plaintext)?;
        Ok((new_ciphertext, new_iv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_sealed_key::{FileSealedKeyProvider, SealedKeyProvider};
    use vaulthalla_store::MemoryStore;

    async fn engine() -> (VaultEncryptionManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileSealedKeyProvider::new("master", dir.path()).unwrap();
        provider.init(None).unwrap();

        let engine = VaultEncryptionManager::new(
            7,
            Arc::new(MemoryStore::new()),
            Arc::new(provider),
        );
        engine.load_or_init_key().await.unwrap();
        (engine, dir)
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let (engine, _dir) = engine().await;

        let (ciphertext, iv, version) = engine.encrypt(b"hello").unwrap();
        assert_eq!(version, 1);
        assert_eq!(engine.decrypt(&ciphertext, &iv, version).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_load_before_init_is_key_missing() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileSealedKeyProvider::new("master", dir.path()).unwrap();
        provider.init(None).unwrap();
        let engine =
            VaultEncryptionManager::new(7, Arc::new(MemoryStore::new()), Arc::new(provider));

        assert!(matches!(engine.load_key().await.unwrap_err(), Error::KeyMissing(7)));
    }

    #[tokio::test]
    async fn test_rotation_keeps_old_version_decryptable_until_finish() {
        let (engine, _dir) = engine().await;
        let (ciphertext, iv, v1) = engine.encrypt(b"hello").unwrap();

        let v2 = engine.prepare_key_rotation().await.unwrap();
        assert_eq!(v2, 2);
        assert!(engine.rotation_in_progress());

        // Old-version payload still opens mid-rotation.
        assert_eq!(engine.decrypt(&ciphertext, &iv, v1).unwrap(), b"hello");

        // New encrypts stamp the new version.
        let (ct2, iv2, stamped) = engine.encrypt(b"world").unwrap();
        assert_eq!(stamped, 2);
        assert_eq!(engine.decrypt(&ct2, &iv2, 2).unwrap(), b"world");

        // The rewrite path binds the payload to the new key.
        let (rewritten, new_iv) = engine.rotate_decrypt_encrypt(&ciphertext, &iv).unwrap();
        assert_eq!(engine.decrypt(&rewritten, &new_iv, 2).unwrap(), b"hello");

        engine.finish_key_rotation().await.unwrap();
        assert!(!engine.rotation_in_progress());

        // After finish the superseded version is gone.
        let err = engine.decrypt(&ciphertext, &iv, v1).unwrap_err();
        assert!(matches!(err, Error::UnknownKeyVersion { vault_id: 7, version: 1 }));

        // The rewritten copy still round-trips.
        assert_eq!(engine.decrypt(&rewritten, &new_iv, 2).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_rotate_decrypt_encrypt_is_noop_outside_rotation() {
        let (engine, _dir) = engine().await;
        let (ciphertext, iv, _) = engine.encrypt(b"hello").unwrap();

        let (same_ct, same_iv) = engine.rotate_decrypt_encrypt(&ciphertext, &iv).unwrap();
        assert_eq!(same_ct, ciphertext);
        assert_eq!(same_iv, iv);
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let (engine, _dir) = engine().await;
        let mut last = engine.key_version();
        for _ in 0..4 {
            let v = engine.prepare_key_rotation().await.unwrap();
            assert_eq!(v, last + 1);
            engine.finish_key_rotation().await.unwrap();
            last = v;
        }
    }

    #[tokio::test]
    async fn test_unknown_future_version_rejected() {
        let (engine, _dir) = engine().await;
        let (ciphertext, iv, _) = engine.encrypt(b"hello").unwrap();

        let err = engine.decrypt(&ciphertext, &iv, 9).unwrap_err();
        assert!(matches!(err, Error::UnknownKeyVersion { version: 9, .. }));
    }

    #[tokio::test]
    async fn test_engine_reload_resumes_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileSealedKeyProvider::new("master", dir.path()).unwrap();
        provider.init(None).unwrap();
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryStore::new());

        let engine = VaultEncryptionManager::new(
            7,
            Arc::clone(&store) as Arc<dyn VaultKeyStore>,
            Arc::clone(&provider) as Arc<dyn SealedKeyProvider>,
        );
        engine.load_or_init_key().await.unwrap();
        let (ciphertext, iv, v1) = engine.encrypt(b"hello").unwrap();
        engine.prepare_key_rotation().await.unwrap();

        // A fresh engine (daemon restart) picks the rotation back up.
        let reloaded = VaultEncryptionManager::new(
            7,
            Arc::clone(&store) as Arc<dyn VaultKeyStore>,
            provider as Arc<dyn SealedKeyProvider>,
        );
        reloaded.load_key().await.unwrap();
        assert!(reloaded.rotation_in_progress());
        assert_eq!(reloaded.key_version(), 2);
        assert_eq!(reloaded.decrypt(&ciphertext, &iv, v1).unwrap(), b"hello");
    }
}
