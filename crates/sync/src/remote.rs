//! S3-vault worker
//!
//! Diffs the logical tree against the remote listing and applies the
//! vault's strategy: `Cache` pushes local changes only, `Sync` reconciles
//! both directions under the conflict policy, `Mirror` force-pushes and
//! deletes remote-only objects. An active rotation re-encrypts
//! old-version objects before anything is uploaded.

use vaulthalla_core::types::{RsConflictPolicy, SyncOutcome, SyncStrategy, VaultId};
use vaulthalla_core::{Error, Result};
use vaulthalla_crypto::aead::TAG_SIZE;
use vaulthalla_store::model::{
    EntryKind, FileMeta, FsEntry, NewEntry, RsSyncPolicy, SyncPolicy,
};
use vaulthalla_store::{paths, FsStore, Store};
use vaulthalla_storage::{ObjectMeta, StorageEngine};

use crate::diff::{diff_remote, RemoteDiff};
use crate::rotation;
use crate::task::SyncTask;

pub async fn run(task: &SyncTask) -> Result<SyncOutcome> {
    let engine = &task.engine;
    let policy = match engine.sync_policy().await {
        SyncPolicy::Rs(policy) => policy,
        SyncPolicy::Fs(_) => {
            return Err(Error::Internal(format!(
                "vault {} carries a local policy but an S3 backend",
                engine.vault_id()
            )))
        }
    };

    rotation::rewrite_old_versions(task).await?;
    if task.is_interrupted() {
        return Ok(SyncOutcome::Interrupted);
    }

    let store = engine.store();
    let files: Vec<FsEntry> = store
        .subtree(engine.vault_id(), "/")
        .await?
        .into_iter()
        .filter(|e| e.kind == EntryKind::File)
        .collect();
    let remote = engine.backend().list("").await?;

    let encrypted_upstream = encrypt_upstream(engine);
    let diff = diff_remote(&files, &remote, |entry| {
        let size = entry.file.as_ref().map(|f| f.size_bytes).unwrap_or(0);
        if encrypted_upstream {
            size + TAG_SIZE as u64
        } else {
            size
        }
    });

    match policy.strategy {
        SyncStrategy::Cache => apply_cache(task, &diff).await,
        SyncStrategy::Sync => apply_bidirectional(task, &policy, &diff).await,
        SyncStrategy::Mirror => apply_mirror(task, &diff).await,
    }
}

fn encrypt_upstream(engine: &StorageEngine) -> bool {
    engine
        .vault()
        .s3
        .as_ref()
        .map(|s| s.encrypt_upstream)
        .unwrap_or(false)
}

/// `Cache`: uploads are the only sync direction; reads pull on access.
async fn apply_cache(task: &SyncTask, diff: &RemoteDiff) -> Result<SyncOutcome> {
    for entry in diff.local_only.iter().chain(diff.modified.iter().map(|(e, _)| e)) {
        if task.is_interrupted() {
            return Ok(SyncOutcome::Interrupted);
        }
        upload(task, entry).await?;
    }
    Ok(SyncOutcome::Success)
}

/// `Sync`: bidirectional with conflict policy.
async fn apply_bidirectional(
    task: &SyncTask,
    policy: &RsSyncPolicy,
    diff: &RemoteDiff,
) -> Result<SyncOutcome> {
    if !diff.modified.is_empty() && policy.conflict_policy == RsConflictPolicy::Ask {
        tracing::warn!(
            vault_id = task.vault_id,
            conflicts = diff.modified.len(),
            "sync conflicts pending operator decision"
        );
        return Ok(SyncOutcome::Suspended);
    }

    for entry in &diff.local_only {
        if task.is_interrupted() {
            return Ok(SyncOutcome::Interrupted);
        }
        upload(task, entry).await?;
    }

    for object in &diff.remote_only {
        if task.is_interrupted() {
            return Ok(SyncOutcome::Interrupted);
        }
        download_new(task, object).await?;
    }

    for (entry, _object) in &diff.modified {
        if task.is_interrupted() {
            return Ok(SyncOutcome::Interrupted);
        }
        match policy.conflict_policy {
            RsConflictPolicy::KeepLocal => upload(task, entry).await?,
            RsConflictPolicy::KeepRemote => download_over(task, entry).await?,
            RsConflictPolicy::Ask => unreachable!("handled before apply"),
        }
    }

    Ok(SyncOutcome::Success)
}

/// `Mirror`: one-way push; remote-only objects are deleted.
async fn apply_mirror(task: &SyncTask, diff: &RemoteDiff) -> Result<SyncOutcome> {
    for object in &diff.remote_only {
        if task.is_interrupted() {
            return Ok(SyncOutcome::Interrupted);
        }
        task.engine.backend().delete(&object.key).await?;
        tracing::debug!(vault_id = task.vault_id, key = %object.key, "mirror deleted remote-only object");
    }

    for entry in diff.local_only.iter().chain(diff.modified.iter().map(|(e, _)| e)) {
        if task.is_interrupted() {
            return Ok(SyncOutcome::Interrupted);
        }
        upload(task, entry).await?;
    }

    Ok(SyncOutcome::Success)
}

/// Push one entry's payload upstream from the local cache.
async fn upload(task: &SyncTask, entry: &FsEntry) -> Result<()> {
    let engine = &task.engine;
    let Some(meta) = entry.file.as_ref() else { return Ok(()) };
    if meta.quarantined {
        return Ok(());
    }

    let Some(cache) = engine.cache() else {
        return Err(Error::Internal(format!(
            "S3 vault {} has no local cache",
            engine.vault_id()
        )));
    };
    let Some(ciphertext) = cache.read(&entry.base32_alias, &entry.path).await? else {
        tracing::warn!(
            vault_id = task.vault_id,
            path = %entry.path,
            "no cached payload to upload; will refill on next access"
        );
        return Ok(());
    };

    let remote = StorageEngine::remote_key(&entry.path);
    if encrypt_upstream(engine) {
        engine.backend().put(&remote, &ciphertext).await?;
    } else {
        let plaintext = engine.encryption().decrypt(
            &ciphertext,
            &meta.encryption_iv,
            meta.encrypted_with_key_version,
        )?;
        engine.backend().put(&remote, &plaintext).await?;
    }
    tracing::debug!(vault_id = task.vault_id, path = %entry.path, "uploaded payload");
    Ok(())
}

/// Materialise a remote-only object as a new local entry.
///
/// With an encrypted upstream the payload's IV lives only in the metadata
/// of whichever instance uploaded it, so a foreign object cannot be
/// adopted; it is left untouched and logged.
async fn download_new(task: &SyncTask, object: &ObjectMeta) -> Result<()> {
    let engine = &task.engine;
    if encrypt_upstream(engine) {
        tracing::warn!(
            vault_id = task.vault_id,
            key = %object.key,
            "remote-only object on an encrypted upstream cannot be adopted"
        );
        return Ok(());
    }

    let path = paths::normalize(&format!("/{}", object.key))?;
    let plaintext = engine.backend().get(&object.key).await?;

    let store = engine.store();
    let owner = engine.vault().owner_id;
    let parent = ensure_dirs(store, task.vault_id, &path, owner).await?;

    let (ciphertext, iv, version) = engine.encryption().encrypt(&plaintext)?;
    let meta = FileMeta {
        size_bytes: plaintext.len() as u64,
        mime_type: "application/octet-stream".to_string(),
        content_hash: String::new(),
        encryption_iv: iv,
        encrypted_with_key_version: version,
        quarantined: false,
    };

    let name = paths::file_name(&path)
        .ok_or_else(|| Error::Validation(format!("bad remote key '{}'", object.key)))?
        .to_string();
    let entry = store
        .insert_entry(NewEntry {
            vault_id: task.vault_id,
            parent_id: Some(parent),
            name,
            path: path.clone(),
            mode: 0o640,
            owner_uid: 0,
            group_gid: 0,
            kind: EntryKind::File,
            created_by: owner,
            file: Some(meta),
        })
        .await?;

    if let Some(cache) = engine.cache() {
        cache.write(&entry.base32_alias, &path, &ciphertext).await?;
    }
    tracing::debug!(vault_id = task.vault_id, path = %path, "adopted remote object");
    Ok(())
}

/// Replace a conflicting local payload with the remote copy.
async fn download_over(task: &SyncTask, entry: &FsEntry) -> Result<()> {
    let engine = &task.engine;
    if encrypt_upstream(engine) {
        // A foreign writer's ciphertext has no recoverable IV here; keep
        // the local copy rather than destroy it.
        tracing::warn!(
            vault_id = task.vault_id,
            path = %entry.path,
            "keep-remote skipped on encrypted upstream"
        );
        return Ok(());
    }

    let remote = StorageEngine::remote_key(&entry.path);
    let plaintext = engine.backend().get(&remote).await?;

    let (ciphertext, iv, version) = engine.encryption().encrypt(&plaintext)?;
    if let Some(cache) = engine.cache() {
        cache.write(&entry.base32_alias, &entry.path, &ciphertext).await?;
    }

    let mut meta = entry
        .file
        .clone()
        .ok_or_else(|| Error::Internal(format!("'{}' lost its file metadata", entry.path)))?;
    meta.size_bytes = plaintext.len() as u64;
    meta.encryption_iv = iv;
    meta.encrypted_with_key_version = version;
    engine
        .store()
        .update_file_meta(entry.id, meta, engine.vault().owner_id)
        .await?;

    tracing::debug!(vault_id = task.vault_id, path = %entry.path, "downloaded remote copy");
    Ok(())
}

/// Walk down from the root creating missing directories; returns the
/// parent entry id for `path`.
async fn ensure_dirs(
    store: &std::sync::Arc<dyn Store>,
    vault_id: VaultId,
    path: &str,
    actor: u32,
) -> Result<u64> {
    let parent_path = paths::parent(path)
        .ok_or_else(|| Error::Validation(format!("'{path}' has no parent")))?;

    let mut current = store.ensure_root(vault_id, actor).await?;
    if parent_path == "/" {
        return Ok(current.id);
    }

    let mut walked = String::new();
    for segment in parent_path.split('/').filter(|s| !s.is_empty()) {
        walked = paths::join(if walked.is_empty() { "/" } else { &walked }, segment);
        current = match store.entry_by_path(vault_id, &walked).await? {
            Some(entry) if entry.kind == EntryKind::Directory => entry,
            Some(entry) => {
                return Err(Error::Conflict(format!(
                    "'{}' exists but is not a directory",
                    entry.path
                )))
            }
            None => {
                store
                    .insert_entry(NewEntry {
                        vault_id,
                        parent_id: Some(current.id),
                        name: segment.to_string(),
                        path: walked.clone(),
                        mode: 0o750,
                        owner_uid: 0,
                        group_gid: 0,
                        kind: EntryKind::Directory,
                        created_by: actor,
                        file: None,
                    })
                    .await?
            }
        };
    }
    Ok(current.id)
}
