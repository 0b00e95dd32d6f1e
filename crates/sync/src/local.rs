//! Local-vault worker
//!
//! Reconciles the logical tree against the backing object set: orphan
//! objects are deleted, entries whose backing object vanished resolve by
//! the configured conflict policy, and an active rotation gets its
//! re-encryption walk. Changes apply in deterministic order (deletes
//! before writes before renames within each directory).

use std::collections::HashSet;

use vaulthalla_core::types::{FsConflictPolicy, SyncOutcome};
use vaulthalla_core::{Error, Result};
use vaulthalla_store::model::{EntryKind, SyncPolicy};
use vaulthalla_store::{FsStore, TrashStore};

use crate::diff::{order_changes, Change, ChangeKind};
use crate::rotation;
use crate::task::SyncTask;

pub async fn run(task: &SyncTask) -> Result<SyncOutcome> {
    let engine = &task.engine;
    let policy = match engine.sync_policy().await {
        SyncPolicy::Fs(policy) => policy,
        SyncPolicy::Rs(_) => {
            return Err(Error::Internal(format!(
                "vault {} carries a remote policy but a local backend",
                engine.vault_id()
            )))
        }
    };

    rotation::rewrite_old_versions(task).await?;
    if task.is_interrupted() {
        return Ok(SyncOutcome::Interrupted);
    }

    let vault_id = engine.vault_id();
    let store = engine.store();

    let entries = store.subtree(vault_id, "/").await?;
    let files: Vec<_> = entries
        .into_iter()
        .filter(|e| e.kind == EntryKind::File)
        .collect();
    let objects = engine.backend().list("").await?;

    // Aliases with a legitimate claim on a backing object: live files plus
    // trash that the janitor has not reclaimed yet.
    let mut referenced: HashSet<String> =
        files.iter().map(|e| e.base32_alias.clone()).collect();
    for trashed in store.trashed_files(vault_id).await? {
        if trashed.deleted_at.is_none() {
            referenced.insert(trashed.base32_alias);
        }
    }

    let object_keys: HashSet<&str> = objects.iter().map(|o| o.key.as_str()).collect();

    let mut changes = Vec::new();
    for object in &objects {
        if !referenced.contains(&object.key) {
            changes.push(Change::new(ChangeKind::Delete, format!("/{}", object.key)));
        }
    }
    let missing: Vec<_> = files
        .iter()
        .filter(|e| !object_keys.contains(e.base32_alias.as_str()))
        .collect();
    for entry in &missing {
        changes.push(Change::new(ChangeKind::Write, entry.path.clone()));
    }

    if !missing.is_empty() && policy.conflict_policy == FsConflictPolicy::Ask {
        tracing::warn!(
            vault_id,
            missing = missing.len(),
            "backing objects missing; suspending for operator decision"
        );
        return Ok(SyncOutcome::Suspended);
    }

    for change in order_changes(changes) {
        if task.is_interrupted() {
            return Ok(SyncOutcome::Interrupted);
        }
        match change.kind {
            ChangeKind::Delete => {
                let key = change.path.trim_start_matches('/');
                engine.backend().delete(key).await?;
                tracing::debug!(vault_id, key, "deleted orphan object");
            }
            ChangeKind::Write => {
                let Some(entry) = store.entry_by_path(vault_id, &change.path).await? else {
                    continue;
                };
                match policy.conflict_policy {
                    FsConflictPolicy::Overwrite => {
                        // Accept the backing store's state: the metadata
                        // row loses.
                        store.remove_entry(entry.id).await?;
                        tracing::warn!(vault_id, path = %change.path, "dropped entry with missing backing object");
                    }
                    FsConflictPolicy::KeepBoth => {
                        store.set_quarantined(entry.id, true).await?;
                        tracing::warn!(vault_id, path = %change.path, "quarantined entry with missing backing object");
                    }
                    FsConflictPolicy::Ask => unreachable!("handled before apply"),
                }
            }
            ChangeKind::Rename => {}
        }
    }

    Ok(SyncOutcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use vaulthalla_core::types::VaultType;
    use vaulthalla_crypto::VaultEncryptionManager;
    use vaulthalla_sealed_key::{FileSealedKeyProvider, SealedKeyProvider};
    use vaulthalla_storage::{LocalBackend, RetryPolicy, StorageEngine};
    use vaulthalla_store::model::{NewUser, NewVault, User};
    use vaulthalla_store::{MemoryStore, Store, UserStore, VaultStore};

    struct Fixture {
        task: SyncTask,
        owner: User,
        store: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(policy: FsConflictPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FileSealedKeyProvider::new("master", dir.path()).unwrap());
        provider.init(None).unwrap();

        let owner = store
            .create_user(NewUser {
                name: "o".into(),
                email: "o@ex.com".into(),
                password_hash: "h".into(),
                role_id: 1,
            })
            .await
            .unwrap();
        let vault = store
            .create_vault(NewVault {
                name: "docs".into(),
                owner_id: owner.id,
                vault_type: VaultType::Local,
                mount_point: dir.path().join("mount").to_string_lossy().into_owned(),
                quota_bytes: 0,
                description: String::new(),
                s3: None,
            })
            .await
            .unwrap();
        store.ensure_root(vault.id, owner.id).await.unwrap();

        let encryption = Arc::new(VaultEncryptionManager::new(
            vault.id,
            Arc::clone(&store) as _,
            provider as _,
        ));
        encryption.load_or_init_key().await.unwrap();
        let backend = Arc::new(LocalBackend::new(&vault.mount_point).await.unwrap());

        let engine = Arc::new(StorageEngine::new(
            vault,
            SyncPolicy::Fs(vaulthalla_store::model::FsSyncPolicy {
                interval_secs: 60,
                conflict_policy: policy,
            }),
            backend,
            encryption,
            Arc::clone(&store) as Arc<dyn Store>,
            None,
            RetryPolicy::backend_default(),
        ));

        Fixture {
            task: SyncTask::new(engine, Duration::seconds(60), None),
            owner,
            store,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_clean_tree_syncs_successfully() {
        let fx = fixture(FsConflictPolicy::Overwrite).await;
        fx.task.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();

        assert_eq!(run(&fx.task).await.unwrap(), SyncOutcome::Success);
        assert_eq!(fx.task.engine.get("/a.txt", &fx.owner).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_orphan_objects_deleted() {
        let fx = fixture(FsConflictPolicy::Overwrite).await;
        fx.task.engine.backend().put("ORPHAN", b"junk").await.unwrap();

        run(&fx.task).await.unwrap();
        assert!(!fx.task.engine.backend().exists("ORPHAN").await.unwrap());
    }

    #[tokio::test]
    async fn test_trashed_objects_survive_sweep() {
        let fx = fixture(FsConflictPolicy::Overwrite).await;
        let entry = fx.task.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();
        fx.task.engine.remove("/a.txt", &fx.owner).await.unwrap();

        run(&fx.task).await.unwrap();
        // Still reclaimable by the janitor, not an orphan.
        assert!(fx.task.engine.backend().exists(&entry.base32_alias).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_backing_overwrite_drops_entry() {
        let fx = fixture(FsConflictPolicy::Overwrite).await;
        let entry = fx.task.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();
        fx.task.engine.backend().delete(&entry.base32_alias).await.unwrap();

        assert_eq!(run(&fx.task).await.unwrap(), SyncOutcome::Success);
        assert!(fx
            .store
            .entry_by_path(fx.task.vault_id, "/a.txt")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_backing_ask_suspends() {
        let fx = fixture(FsConflictPolicy::Ask).await;
        let entry = fx.task.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();
        fx.task.engine.backend().delete(&entry.base32_alias).await.unwrap();

        assert_eq!(run(&fx.task).await.unwrap(), SyncOutcome::Suspended);
        // Nothing was destroyed while waiting for the operator.
        assert!(fx
            .store
            .entry_by_path(fx.task.vault_id, "/a.txt")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_rotation_rewrite_during_sync() {
        let fx = fixture(FsConflictPolicy::Overwrite).await;
        fx.task.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();

        fx.task.engine.encryption().prepare_key_rotation().await.unwrap();
        assert_eq!(run(&fx.task).await.unwrap(), SyncOutcome::Success);

        // The walk rewrote the object and finished the rotation.
        assert!(!fx.task.engine.encryption().rotation_in_progress());
        let entry = fx
            .store
            .entry_by_path(fx.task.vault_id, "/a.txt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.file.unwrap().encrypted_with_key_version, 2);
        assert_eq!(fx.task.engine.get("/a.txt", &fx.owner).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_interrupt_short_circuits() {
        let fx = fixture(FsConflictPolicy::Overwrite).await;
        fx.task.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();
        fx.task.interrupt();

        assert_eq!(run(&fx.task).await.unwrap(), SyncOutcome::Interrupted);
    }
}
