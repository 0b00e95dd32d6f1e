//! Per-vault storage engine
//!
//! The aggregate handle combining backend transport, encryption manager,
//! sync policy and the vault record. Every operation authorises through
//! the permission evaluator first, then encrypts/decrypts through the
//! vault's key, and serialises mutations on a single per-vault lock.
//!
//! Backing layout: payload objects are flat, keyed by the entry's base32
//! alias. S3 vaults additionally mirror objects upstream under their
//! logical path (encrypted or plaintext per `encrypt_upstream`) and keep a
//! content-addressed local cache with LRU eviction.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use vaulthalla_core::types::{VaultId, VaultType};
use vaulthalla_core::{Error, Result};
use vaulthalla_crypto::VaultEncryptionManager;
use vaulthalla_rbac::{build_snapshot, evaluate, Operation};
use vaulthalla_store::model::{EntryKind, FileMeta, FsEntry, NewEntry, SyncPolicy, User, Vault};
use vaulthalla_store::{paths, FsStore, Store, TrashStore, VaultStore};

use crate::backend::VaultBackend;
use crate::cache::LocalCache;
use crate::retry::RetryPolicy;

pub struct StorageEngine {
    vault: Vault,
    policy: RwLock<SyncPolicy>,
    backend: Arc<dyn VaultBackend>,
    encryption: Arc<VaultEncryptionManager>,
    store: Arc<dyn Store>,
    cache: Option<LocalCache>,
    retry: RetryPolicy,
    /// Serialises storage mutations within this vault; cross-vault
    /// operations run in parallel without coordination.
    op_lock: Mutex<()>,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("vault", &self.vault.id)
            .finish_non_exhaustive()
    }
}

impl StorageEngine {
    pub fn new(
        vault: Vault,
        policy: SyncPolicy,
        backend: Arc<dyn VaultBackend>,
        encryption: Arc<VaultEncryptionManager>,
        store: Arc<dyn Store>,
        cache: Option<LocalCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            vault,
            policy: RwLock::new(policy),
            backend,
            encryption,
            store,
            cache,
            retry,
            op_lock: Mutex::new(()),
        }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn vault_id(&self) -> VaultId {
        self.vault.id
    }

    pub fn encryption(&self) -> &Arc<VaultEncryptionManager> {
        &self.encryption
    }

    pub fn backend(&self) -> &Arc<dyn VaultBackend> {
        &self.backend
    }

    pub fn cache(&self) -> Option<&LocalCache> {
        self.cache.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn sync_policy(&self) -> SyncPolicy {
        self.policy.read().await.clone()
    }

    pub async fn set_sync_policy(&self, policy: SyncPolicy) -> Result<()> {
        self.store
            .update_sync_policy(self.vault.id, policy.clone())
            .await?;
        *self.policy.write().await = policy;
        Ok(())
    }

    /// Remote object key for an S3 vault: the logical path without the
    /// leading slash, so foreign tooling sees real names in the bucket.
    pub fn remote_key(path: &str) -> String {
        path.trim_start_matches('/').to_string()
    }

    fn encrypt_upstream(&self) -> bool {
        self.vault.s3.as_ref().map(|s| s.encrypt_upstream).unwrap_or(false)
    }

    /// Owner access is implicit; everyone else goes through the evaluator
    /// with a snapshot taken from the store.
    async fn authorize(&self, actor: &User, operation: Operation, path: &str) -> Result<()> {
        if actor.id == self.vault.owner_id {
            return Ok(());
        }
        let snapshot = build_snapshot(self.store.as_ref(), actor, Some(self.vault.id)).await?;
        if evaluate(&snapshot, operation, path).is_allowed() {
            Ok(())
        } else {
            tracing::info!(
                target: "audit",
                vault_id = self.vault.id,
                user_id = actor.id,
                operation = ?operation,
                path,
                "permission denied"
            );
            Err(Error::Forbidden(format!(
                "user {} may not {operation:?} '{path}' in vault '{}'",
                actor.name, self.vault.name
            )))
        }
    }

    fn audit(&self, actor: &User, operation: &str, path: &str) {
        tracing::info!(
            target: "audit",
            vault_id = self.vault.id,
            user_id = actor.id,
            operation,
            path,
            "storage operation"
        );
    }

    async fn parent_dir(&self, path: &str) -> Result<FsEntry> {
        let parent_path = paths::parent(path)
            .ok_or_else(|| Error::Validation("the vault root cannot be a target".into()))?;
        let parent = self
            .store
            .entry_by_path(self.vault.id, &parent_path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("directory '{parent_path}'")))?;
        if parent.kind != EntryKind::Directory {
            return Err(Error::Validation(format!("'{parent_path}' is not a directory")));
        }
        Ok(parent)
    }

    /// Encrypt and write a file, upserting its metadata and updating the
    /// parent directory stats.
    pub async fn put(&self, path: &str, plaintext: &[u8], actor: &User) -> Result<FsEntry> {
        let path = paths::normalize(path)?;
        self.authorize(actor, Operation::Upload, &path).await?;
        let _guard = self.op_lock.lock().await;

        let parent = self.parent_dir(&path).await?;
        let existing = self.store.entry_by_path(self.vault.id, &path).await?;
        if let Some(entry) = &existing {
            if entry.kind != EntryKind::File {
                return Err(Error::Validation(format!("'{path}' is a directory")));
            }
        }

        if self.vault.quota_bytes > 0 {
            let used = self.store.vault_size(self.vault.id).await?;
            let replaced = existing
                .as_ref()
                .and_then(|e| e.file.as_ref())
                .map(|f| f.size_bytes)
                .unwrap_or(0);
            if used - replaced + plaintext.len() as u64 > self.vault.quota_bytes {
                return Err(Error::Validation(format!(
                    "vault quota of {} bytes exceeded",
                    self.vault.quota_bytes
                )));
            }
        }

        let (ciphertext, iv, version) = self.encryption.encrypt(plaintext)?;
        let meta = FileMeta {
            size_bytes: plaintext.len() as u64,
            mime_type: guess_mime(&path).to_string(),
            content_hash: hex::encode(Sha256::digest(plaintext)),
            encryption_iv: iv,
            encrypted_with_key_version: version,
            quarantined: false,
        };

        let entry = match existing {
            Some(entry) => {
                self.store
                    .update_file_meta(entry.id, meta, actor.id)
                    .await?;
                entry
            }
            None => {
                let name = paths::file_name(&path)
                    .ok_or_else(|| Error::Validation("missing file name".into()))?
                    .to_string();
                self.store
                    .insert_entry(NewEntry {
                        vault_id: self.vault.id,
                        parent_id: Some(parent.id),
                        name,
                        path: path.clone(),
                        mode: 0o640,
                        owner_uid: 0,
                        group_gid: 0,
                        kind: EntryKind::File,
                        created_by: actor.id,
                        file: Some(meta),
                    })
                    .await?
            }
        };

        self.write_backing(&entry.base32_alias, &path, &ciphertext, plaintext)
            .await?;

        self.store.touch(parent.id, actor.id).await?;
        self.audit(actor, "put", &path);

        self.store
            .entry_by_id(entry.id)
            .await?
            .ok_or_else(|| Error::Internal(format!("entry for '{path}' vanished mid-write")))
    }

    async fn write_backing(
        &self,
        alias: &str,
        path: &str,
        ciphertext: &[u8],
        plaintext: &[u8],
    ) -> Result<()> {
        match self.vault.vault_type {
            VaultType::Local => {
                self.retry
                    .execute(false, || self.backend.put(alias, ciphertext))
                    .await
            }
            VaultType::S3 => {
                if let Some(cache) = &self.cache {
                    cache.write(alias, path, ciphertext).await?;
                }
                let remote = Self::remote_key(path);
                let body = if self.encrypt_upstream() { ciphertext } else { plaintext };
                self.retry
                    .execute(false, || self.backend.put(&remote, body))
                    .await
            }
        }
    }

    /// Read and decrypt a file payload.
    pub async fn get(&self, path: &str, actor: &User) -> Result<Vec<u8>> {
        let path = paths::normalize(path)?;
        self.authorize(actor, Operation::Download, &path).await?;

        let entry = self
            .store
            .entry_by_path(self.vault.id, &path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file '{path}'")))?;
        let meta = entry
            .file
            .as_ref()
            .ok_or_else(|| Error::Validation(format!("'{path}' is a directory")))?;
        if meta.quarantined {
            return Err(Error::Corrupt(format!("file '{path}' is quarantined")));
        }

        let ciphertext = match self.vault.vault_type {
            VaultType::Local => {
                self.retry
                    .execute(true, || self.backend.get(&entry.base32_alias))
                    .await?
            }
            VaultType::S3 => match self.cached_or_remote(&entry, &path).await? {
                Fetched::Ciphertext(data) => data,
                Fetched::Plaintext(data) => {
                    self.audit(actor, "get", &path);
                    return Ok(data);
                }
            },
        };

        match self
            .encryption
            .decrypt(&ciphertext, &meta.encryption_iv, meta.encrypted_with_key_version)
        {
            Ok(plaintext) => {
                self.audit(actor, "get", &path);
                Ok(plaintext)
            }
            Err(err @ Error::UnknownKeyVersion { .. }) => {
                self.store.set_quarantined(entry.id, true).await?;
                tracing::error!(
                    target: "audit",
                    vault_id = self.vault.id,
                    path = %path,
                    version = meta.encrypted_with_key_version,
                    "file quarantined: key version unknown"
                );
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn cached_or_remote(&self, entry: &FsEntry, path: &str) -> Result<Fetched> {
        if let Some(cache) = &self.cache {
            if let Some(data) = cache.read(&entry.base32_alias, path).await? {
                return Ok(Fetched::Ciphertext(data));
            }
        }

        let remote = Self::remote_key(path);
        let body = self
            .retry
            .execute(true, || self.backend.get(&remote))
            .await?;

        if self.encrypt_upstream() {
            if let Some(cache) = &self.cache {
                cache.write(&entry.base32_alias, path, &body).await?;
            }
            Ok(Fetched::Ciphertext(body))
        } else {
            // Upstream holds plaintext; refill the cache encrypted under
            // the current key.
            let (ciphertext, iv, version) = self.encryption.encrypt(&body)?;
            if let Some(cache) = &self.cache {
                cache.write(&entry.base32_alias, path, &ciphertext).await?;
            }
            let mut meta = entry
                .file
                .clone()
                .ok_or_else(|| Error::Internal(format!("'{path}' lost its file metadata")))?;
            meta.encryption_iv = iv;
            meta.encrypted_with_key_version = version;
            self.store
                .update_file_meta(entry.id, meta, entry.last_modified_by)
                .await?;
            Ok(Fetched::Plaintext(body))
        }
    }

    /// List a directory, optionally the whole subtree.
    pub async fn list(&self, path: &str, recursive: bool, actor: &User) -> Result<Vec<FsEntry>> {
        let path = paths::normalize(path)?;
        self.authorize(actor, Operation::List, &path).await?;

        let dir = self
            .store
            .entry_by_path(self.vault.id, &path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("directory '{path}'")))?;
        if dir.kind != EntryKind::Directory {
            return Err(Error::Validation(format!("'{path}' is not a directory")));
        }

        if recursive {
            self.store.subtree(self.vault.id, &path).await
        } else {
            self.store.children(dir.id).await
        }
    }

    /// Atomic move-to-trash. The backing object stays on disk/bucket; the
    /// janitor reclaims the space after the retention window.
    pub async fn remove(&self, path: &str, actor: &User) -> Result<()> {
        let path = paths::normalize(path)?;
        self.authorize(actor, Operation::Delete, &path).await?;
        let _guard = self.op_lock.lock().await;

        let entry = self
            .store
            .entry_by_path(self.vault.id, &path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("entry '{path}'")))?;
        if entry.is_root() {
            return Err(Error::Validation("cannot remove the vault root".into()));
        }

        let mut files = Vec::new();
        if entry.kind == EntryKind::File {
            files.push(entry.clone());
        } else {
            files.extend(
                self.store
                    .subtree(self.vault.id, &path)
                    .await?
                    .into_iter()
                    .filter(|e| e.kind == EntryKind::File),
            );
        }

        for file in &files {
            let backing = match self.vault.vault_type {
                VaultType::Local => file.base32_alias.clone(),
                VaultType::S3 => Self::remote_key(&file.path),
            };
            self.store
                .trash_file(self.vault.id, &file.base32_alias, &backing, actor.id)
                .await?;
            if let Some(cache) = &self.cache {
                cache.remove(&file.base32_alias, &file.path).await?;
            }
        }

        self.store.remove_entry(entry.id).await?;
        if let Some(parent_id) = entry.parent_id {
            self.store.touch(parent_id, actor.id).await?;
        }
        self.audit(actor, "remove", &path);
        Ok(())
    }

    /// Move an entry to a new path (different parent and/or name).
    pub async fn move_to(&self, src: &str, dst: &str, actor: &User) -> Result<FsEntry> {
        let src = paths::normalize(src)?;
        let dst = paths::normalize(dst)?;
        self.authorize(actor, Operation::Move, &src).await?;
        let _guard = self.op_lock.lock().await;

        let entry = self
            .store
            .entry_by_path(self.vault.id, &src)
            .await?
            .ok_or_else(|| Error::NotFound(format!("entry '{src}'")))?;
        let new_parent = self.parent_dir(&dst).await?;
        let new_name = paths::file_name(&dst)
            .ok_or_else(|| Error::Validation("missing destination name".into()))?;

        let moved = self
            .store
            .move_entry(entry.id, new_parent.id, new_name, actor.id)
            .await?;

        // Alias-keyed local objects do not move; S3 mirrors logical paths
        // upstream, so the remote object follows the rename.
        if self.vault.vault_type == VaultType::S3 && entry.kind == EntryKind::File {
            let from = Self::remote_key(&src);
            let to = Self::remote_key(&moved.path);
            self.retry
                .execute(true, || self.backend.copy(&from, &to))
                .await?;
            self.retry
                .execute(true, || self.backend.delete(&from))
                .await?;
        }

        self.audit(actor, "move", &format!("{src} -> {}", moved.path));
        Ok(moved)
    }

    /// Rename an entry within its parent directory.
    pub async fn rename(&self, path: &str, new_name: &str, actor: &User) -> Result<FsEntry> {
        let path = paths::normalize(path)?;
        paths::validate_name(new_name)?;
        self.authorize(actor, Operation::Rename, &path).await?;

        let parent_path = paths::parent(&path)
            .ok_or_else(|| Error::Validation("cannot rename the vault root".into()))?;
        let dst = paths::join(&parent_path, new_name);
        self.move_to(&path, &dst, actor).await
    }

    /// Copy a file to a new path, duplicating the backing object.
    pub async fn copy(&self, src: &str, dst: &str, actor: &User) -> Result<FsEntry> {
        let src = paths::normalize(src)?;
        let dst = paths::normalize(dst)?;
        self.authorize(actor, Operation::Copy, &src).await?;
        let _guard = self.op_lock.lock().await;

        let source = self
            .store
            .entry_by_path(self.vault.id, &src)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file '{src}'")))?;
        let meta = source
            .file
            .clone()
            .ok_or_else(|| Error::Validation("only files can be copied".into()))?;

        let parent = self.parent_dir(&dst).await?;
        let name = paths::file_name(&dst)
            .ok_or_else(|| Error::Validation("missing destination name".into()))?
            .to_string();

        let copy = self
            .store
            .insert_entry(NewEntry {
                vault_id: self.vault.id,
                parent_id: Some(parent.id),
                name,
                path: dst.clone(),
                mode: source.mode,
                owner_uid: source.owner_uid,
                group_gid: source.group_gid,
                kind: EntryKind::File,
                created_by: actor.id,
                file: Some(meta),
            })
            .await?;

        match self.vault.vault_type {
            VaultType::Local => {
                self.retry
                    .execute(true, || {
                        self.backend.copy(&source.base32_alias, &copy.base32_alias)
                    })
                    .await?;
            }
            VaultType::S3 => {
                if let Some(cache) = &self.cache {
                    if let Some(data) = cache.read(&source.base32_alias, &src).await? {
                        cache.write(&copy.base32_alias, &dst, &data).await?;
                    }
                }
                let from = Self::remote_key(&src);
                let to = Self::remote_key(&dst);
                self.retry
                    .execute(true, || self.backend.copy(&from, &to))
                    .await?;
            }
        }

        self.audit(actor, "copy", &format!("{src} -> {dst}"));
        Ok(copy)
    }

    /// Create a directory entry.
    pub async fn mkdir(&self, path: &str, actor: &User) -> Result<FsEntry> {
        let path = paths::normalize(path)?;
        self.authorize(actor, Operation::Mkdir, &path).await?;
        let _guard = self.op_lock.lock().await;

        let parent = self.parent_dir(&path).await?;
        let name = paths::file_name(&path)
            .ok_or_else(|| Error::Validation("missing directory name".into()))?
            .to_string();

        let dir = self
            .store
            .insert_entry(NewEntry {
                vault_id: self.vault.id,
                parent_id: Some(parent.id),
                name,
                path: path.clone(),
                mode: 0o750,
                owner_uid: 0,
                group_gid: 0,
                kind: EntryKind::Directory,
                created_by: actor.id,
                file: None,
            })
            .await?;

        self.audit(actor, "mkdir", &path);
        Ok(dir)
    }

    /// Remaining space: quota accounting when a quota is set, otherwise
    /// whatever the backend can report (unlimited when neither knows).
    pub async fn free_space(&self) -> Result<u64> {
        if self.vault.quota_bytes > 0 {
            let used = self.store.vault_size(self.vault.id).await?;
            return Ok(self.vault.quota_bytes.saturating_sub(used));
        }
        Ok(self.backend.free_space().await?.unwrap_or(u64::MAX))
    }

    /// Local cache footprint; zero for local vaults.
    pub async fn cache_size(&self) -> Result<u64> {
        match &self.cache {
            Some(cache) => cache.size().await,
            None => Ok(0),
        }
    }

    pub async fn vault_size(&self) -> Result<u64> {
        self.store.vault_size(self.vault.id).await
    }
}

enum Fetched {
    Ciphertext(Vec<u8>),
    Plaintext(Vec<u8>),
}

fn guess_mime(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("txt") | Some("md") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBackend;
    use vaulthalla_rbac::Capability;
    use vaulthalla_sealed_key::{FileSealedKeyProvider, SealedKeyProvider};
    use vaulthalla_store::model::{NewOverride, NewUser, NewVault, OverrideEffect, RoleType, Subject};
    use vaulthalla_store::{MemoryStore, RbacStore, UserStore};

    struct Fixture {
        engine: StorageEngine,
        owner: User,
        store: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FileSealedKeyProvider::new("master", dir.path()).unwrap());
        provider.init(None).unwrap();

        let owner_role = store.create_role("user", RoleType::User, 0).await.unwrap();
        let owner = store
            .create_user(NewUser {
                name: "alice".into(),
                email: "a@ex.com".into(),
                password_hash: "h".into(),
                role_id: owner_role.id,
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
            Arc::clone(&provider) as _,
        ));
        encryption.load_or_init_key().await.unwrap();

        let backend = Arc::new(LocalBackend::new(&vault.mount_point).await.unwrap());
        let engine = StorageEngine::new(
            vault,
            SyncPolicy::default_fs(60),
            backend,
            encryption,
            Arc::clone(&store) as Arc<dyn Store>,
            None,
            RetryPolicy::backend_default(),
        );

        Fixture { engine, owner, store, _dir: dir }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let fx = fixture().await;
        let entry = fx.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();
        let meta = entry.file.as_ref().unwrap();
        assert_eq!(meta.size_bytes, 5);
        assert_eq!(meta.encrypted_with_key_version, 1);
        assert_eq!(meta.mime_type, "text/plain");

        assert_eq!(fx.engine.get("/a.txt", &fx.owner).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_backing_object_is_encrypted_at_rest() {
        let fx = fixture().await;
        let entry = fx.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();

        let raw = fx.engine.backend().get(&entry.base32_alias).await.unwrap();
        assert_ne!(raw, b"hello");
        assert!(raw.len() > 5);
    }

    #[tokio::test]
    async fn test_get_survives_rotation() {
        let fx = fixture().await;
        fx.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();

        fx.engine.encryption().prepare_key_rotation().await.unwrap();
        assert_eq!(fx.engine.get("/a.txt", &fx.owner).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_put_requires_parent_dir() {
        let fx = fixture().await;
        let err = fx.engine.put("/missing/a.txt", b"x", &fx.owner).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        fx.engine.mkdir("/docs", &fx.owner).await.unwrap();
        fx.engine.put("/docs/a.txt", b"x", &fx.owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let mut fx = fixture().await;
        fx.engine.vault.quota_bytes = 8;

        fx.engine.put("/a.txt", b"12345", &fx.owner).await.unwrap();
        let err = fx.engine.put("/b.txt", b"12345", &fx.owner).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // Overwriting the same file within quota is fine.
        fx.engine.put("/a.txt", b"1234567", &fx.owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_trashes_and_hides() {
        let fx = fixture().await;
        let entry = fx.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();
        fx.engine.remove("/a.txt", &fx.owner).await.unwrap();

        assert!(matches!(
            fx.engine.get("/a.txt", &fx.owner).await.unwrap_err(),
            Error::NotFound(_)
        ));
        // Backing object survives for the janitor.
        assert!(fx.engine.backend().exists(&entry.base32_alias).await.unwrap());
        let trash = fx.store.trashed_files(fx.engine.vault_id()).await.unwrap();
        assert_eq!(trash.len(), 1);
        assert_eq!(trash[0].base32_alias, entry.base32_alias);
    }

    #[tokio::test]
    async fn test_move_rename_copy() {
        let fx = fixture().await;
        fx.engine.mkdir("/sub", &fx.owner).await.unwrap();
        fx.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();

        let moved = fx.engine.move_to("/a.txt", "/sub/a.txt", &fx.owner).await.unwrap();
        assert_eq!(moved.path, "/sub/a.txt");
        assert_eq!(fx.engine.get("/sub/a.txt", &fx.owner).await.unwrap(), b"hello");

        let renamed = fx.engine.rename("/sub/a.txt", "b.txt", &fx.owner).await.unwrap();
        assert_eq!(renamed.path, "/sub/b.txt");

        let copied = fx.engine.copy("/sub/b.txt", "/c.txt", &fx.owner).await.unwrap();
        assert_ne!(copied.base32_alias, renamed.base32_alias);
        assert_eq!(fx.engine.get("/c.txt", &fx.owner).await.unwrap(), b"hello");
        assert_eq!(fx.engine.get("/sub/b.txt", &fx.owner).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_list_recursive() {
        let fx = fixture().await;
        fx.engine.mkdir("/sub", &fx.owner).await.unwrap();
        fx.engine.put("/sub/a.txt", b"1", &fx.owner).await.unwrap();
        fx.engine.put("/top.txt", b"2", &fx.owner).await.unwrap();

        let shallow = fx.engine.list("/", false, &fx.owner).await.unwrap();
        assert_eq!(shallow.len(), 2);

        let deep = fx.engine.list("/", true, &fx.owner).await.unwrap();
        assert_eq!(deep.len(), 3);
    }

    #[tokio::test]
    async fn test_override_denies_secret_subtree_for_non_owner() {
        let fx = fixture().await;
        fx.engine.mkdir("/secret", &fx.owner).await.unwrap();
        fx.engine.mkdir("/public", &fx.owner).await.unwrap();
        fx.engine.put("/secret/x.txt", b"hidden", &fx.owner).await.unwrap();
        fx.engine.put("/public/x.txt", b"open", &fx.owner).await.unwrap();

        // Second user with a full read-write vault role, then a Deny
        // override on Download beneath /secret/.
        let reader = fx
            .store
            .create_user(NewUser {
                name: "u".into(),
                email: "u@ex.com".into(),
                password_hash: "h".into(),
                role_id: 1,
            })
            .await
            .unwrap();
        let rw = fx
            .store
            .create_role("read-write", RoleType::Vault, vaulthalla_rbac::CapabilitySet::all_vault().bits())
            .await
            .unwrap();
        let assignment = fx
            .store
            .create_assignment(Subject::user(reader.id), rw.id, Some(fx.engine.vault_id()))
            .await
            .unwrap();
        fx.store
            .create_override(NewOverride {
                assignment_id: assignment.id,
                capability_bit: Capability::Download.bit(),
                pattern: "^/secret/".into(),
                effect: OverrideEffect::Deny,
            })
            .await
            .unwrap();

        let err = fx.engine.get("/secret/x.txt", &reader).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(fx.engine.get("/public/x.txt", &reader).await.unwrap(), b"open");
    }

    #[tokio::test]
    async fn test_no_grant_means_forbidden() {
        let fx = fixture().await;
        fx.engine.put("/a.txt", b"hello", &fx.owner).await.unwrap();

        let stranger = fx
            .store
            .create_user(NewUser {
                name: "s".into(),
                email: "s@ex.com".into(),
                password_hash: "h".into(),
                role_id: 1,
            })
            .await
            .unwrap();
        assert!(matches!(
            fx.engine.get("/a.txt", &stranger).await.unwrap_err(),
            Error::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn test_free_space_with_quota() {
        let mut fx = fixture().await;
        fx.engine.vault.quota_bytes = 100;
        fx.engine.put("/a.txt", b"0123456789", &fx.owner).await.unwrap();
        assert_eq!(fx.engine.free_space().await.unwrap(), 90);
        assert_eq!(fx.engine.vault_size().await.unwrap(), 10);
    }
}
