//! Online re-encryption walk
//!
//! While a rotation is in progress, every object still sealed under the
//! superseded key version is rewritten through `rotate_decrypt_encrypt`.
//! When a walk finishes with nothing left on the old version, the rotation
//! completes.

use vaulthalla_core::types::VaultType;
use vaulthalla_core::{Error, Result};
use vaulthalla_storage::StorageEngine;
use vaulthalla_store::FsStore;

use crate::task::SyncTask;

/// Rewrite old-version objects; returns true when the rotation finished.
pub async fn rewrite_old_versions(task: &SyncTask) -> Result<bool> {
    let engine = &task.engine;
    let encryption = engine.encryption();
    if !encryption.rotation_in_progress() {
        return Ok(false);
    }

    let vault_id = engine.vault_id();
    let old_version = encryption.key_version() - 1;
    let store = engine.store();

    for entry in store.entries_with_key_version(vault_id, old_version).await? {
        if task.is_interrupted() {
            return Ok(false);
        }
        let Some(meta) = entry.file.clone() else { continue };
        if meta.quarantined {
            continue;
        }

        let ciphertext = match read_ciphertext(engine, &entry.base32_alias, &entry.path).await? {
            Some(data) => data,
            None => {
                tracing::warn!(vault_id, path = %entry.path, "no backing object for rotation rewrite");
                continue;
            }
        };

        match encryption.rotate_decrypt_encrypt(&ciphertext, &meta.encryption_iv) {
            Ok((new_ciphertext, new_iv)) => {
                write_ciphertext(engine, &entry.base32_alias, &entry.path, &new_ciphertext).await?;
                let mut meta = meta;
                meta.encryption_iv = new_iv;
                meta.encrypted_with_key_version = encryption.key_version();
                store
                    .update_file_meta(entry.id, meta, entry.last_modified_by)
                    .await?;
            }
            Err(Error::Corrupt(msg)) => {
                // Undecryptable under the old key: quarantine and move on
                // so one bad object cannot wedge the rotation.
                store.set_quarantined(entry.id, true).await?;
                tracing::error!(
                    target: "audit",
                    vault_id,
                    path = %entry.path,
                    error = %msg,
                    "quarantined during rotation rewrite"
                );
            }
            Err(e) => return Err(e),
        }
    }

    let remaining = store
        .entries_with_key_version(vault_id, old_version)
        .await?
        .into_iter()
        .filter(|e| e.file.as_ref().map(|f| !f.quarantined).unwrap_or(false))
        .count();

    if remaining == 0 && !task.is_interrupted() {
        encryption.finish_key_rotation().await?;
        tracing::info!(vault_id, "rotation rewrite complete");
        return Ok(true);
    }
    Ok(false)
}

async fn read_ciphertext(
    engine: &StorageEngine,
    alias: &str,
    path: &str,
) -> Result<Option<Vec<u8>>> {
    match engine.vault().vault_type {
        VaultType::Local => match engine.backend().get(alias).await {
            Ok(data) => Ok(Some(data)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        },
        VaultType::S3 => {
            if let Some(cache) = engine.cache() {
                if let Some(data) = cache.read(alias, path).await? {
                    return Ok(Some(data));
                }
            }
            let encrypted_upstream = engine
                .vault()
                .s3
                .as_ref()
                .map(|s| s.encrypt_upstream)
                .unwrap_or(false);
            if !encrypted_upstream {
                // Plaintext upstream carries no old-version ciphertext.
                return Ok(None);
            }
            match engine.backend().get(&StorageEngine::remote_key(path)).await {
                Ok(data) => Ok(Some(data)),
                Err(Error::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        }
    }
}

async fn write_ciphertext(
    engine: &StorageEngine,
    alias: &str,
    path: &str,
    ciphertext: &[u8],
) -> Result<()> {
    match engine.vault().vault_type {
        VaultType::Local => engine.backend().put(alias, ciphertext).await,
        VaultType::S3 => {
            if let Some(cache) = engine.cache() {
                cache.write(alias, path, ciphertext).await?;
            }
            let encrypted_upstream = engine
                .vault()
                .s3
                .as_ref()
                .map(|s| s.encrypt_upstream)
                .unwrap_or(false);
            if encrypted_upstream {
                engine
                    .backend()
                    .put(&StorageEngine::remote_key(path), ciphertext)
                    .await?;
            }
            Ok(())
        }
    }
}
