//! In-memory store
//!
//! Backs every unit test and TEST_MODE runs. Enforces the same invariants
//! the relational schema does (unique constraints, one active key per
//! vault, strictly monotonic key versions) so tests exercise the real
//! contracts.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use vaulthalla_core::types::{
    ApiKeyId, EntryId, GroupId, KeyVersion, RoleId, SyncOutcome, SyncTrigger, UserId, VaultId,
};
use vaulthalla_core::{Error, Result};

use crate::alias;
use crate::model::*;
use crate::paths;
use crate::traits::*;

#[derive(Default)]
struct Counters {
    user: u32,
    vault: u32,
    api_key: u32,
    entry: u64,
    inode: u64,
    trash: u64,
    role: u32,
    group: u32,
    assignment: u32,
    permission_override: u32,
    sync_event: u64,
    waiver: u64,
}

#[derive(Default)]
struct Inner {
    counters: Counters,
    users: HashMap<UserId, User>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    vaults: HashMap<VaultId, Vault>,
    sync_policies: HashMap<VaultId, SyncPolicy>,
    active_keys: HashMap<VaultId, VaultKey>,
    trashed_keys: HashMap<VaultId, Vec<TrashedVaultKey>>,
    api_keys: HashMap<ApiKeyId, ApiKey>,
    entries: HashMap<EntryId, FsEntry>,
    trash: HashMap<u64, TrashedFile>,
    cache: HashMap<(VaultId, String, EntryKind), CacheEntry>,
    roles: HashMap<RoleId, Role>,
    groups: HashMap<GroupId, Group>,
    group_members: HashMap<GroupId, HashSet<UserId>>,
    assignments: HashMap<u32, RoleAssignment>,
    overrides: HashMap<u32, PermissionOverride>,
    sync_events: Vec<SyncEvent>,
    secrets: HashMap<String, InternalSecret>,
    waivers: Vec<Waiver>,
}

/// Thread-safe in-memory implementation of the whole Store trait family.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: every refresh-token row for a user, in jti order.
    pub async fn refresh_tokens_for_user(&self, user_id: UserId) -> Vec<RefreshTokenRecord> {
        let mut tokens: Vec<_> = self
            .inner
            .read()
            .await
            .refresh_tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.jti.cmp(&b.jti));
        tokens
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, draft: NewUser) -> Result<User> {
        let mut inner = self.inner.write().await;
        if inner
            .users
            .values()
            .any(|u| u.name == draft.name || u.email == draft.email)
        {
            return Err(Error::Conflict(format!(
                "user with name '{}' or email '{}' already exists",
                draft.name, draft.email
            )));
        }

        inner.counters.user += 1;
        let user = User {
            id: inner.counters.user,
            name: draft.name,
            email: draft.email,
            password_hash: draft.password_hash,
            role_id: draft.role_id,
            is_active: true,
            created_at: Utc::now(),
            last_login_at: None,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_by_id(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("user {}", user.id))),
        }
    }

    async fn update_password_hash(&self, id: UserId, hash: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        user.password_hash = hash.to_string();
        Ok(())
    }

    async fn update_last_login(&self, id: UserId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        user.last_login_at = Some(Utc::now());
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<_> = self.inner.read().await.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn add_refresh_token(&self, record: RefreshTokenRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.refresh_tokens.insert(record.jti.clone(), record);
        Ok(())
    }

    async fn refresh_token(&self, jti: &str) -> Result<Option<RefreshTokenRecord>> {
        Ok(self.inner.read().await.refresh_tokens.get(jti).cloned())
    }

    async fn revoke_all_refresh_tokens(&self, user_id: UserId) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut revoked = 0;
        for token in inner.refresh_tokens.values_mut() {
            if token.user_id == user_id && !token.revoked {
                token.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_refresh_token(&self, jti: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.refresh_tokens.get_mut(jti) {
            Some(token) => {
                token.revoked = true;
                Ok(())
            }
            None => Err(Error::NotFound(format!("refresh token {jti}"))),
        }
    }

    async fn purge_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.refresh_tokens.len();
        inner
            .refresh_tokens
            .retain(|_, t| !t.revoked && !t.is_expired(now));
        Ok((before - inner.refresh_tokens.len()) as u64)
    }
}

#[async_trait]
impl VaultStore for MemoryStore {
    async fn create_vault(&self, draft: NewVault) -> Result<Vault> {
        let mut inner = self.inner.write().await;
        if inner
            .vaults
            .values()
            .any(|v| v.name == draft.name && v.owner_id == draft.owner_id)
        {
            return Err(Error::Conflict(format!(
                "vault '{}' already exists for owner {}",
                draft.name, draft.owner_id
            )));
        }

        inner.counters.vault += 1;
        let now = Utc::now();
        let vault = Vault {
            id: inner.counters.vault,
            name: draft.name,
            owner_id: draft.owner_id,
            vault_type: draft.vault_type,
            mount_point: draft.mount_point,
            quota_bytes: draft.quota_bytes,
            description: draft.description,
            is_active: true,
            created_at: now,
            updated_at: now,
            s3: draft.s3,
        };
        inner.vaults.insert(vault.id, vault.clone());
        Ok(vault)
    }

    async fn vault(&self, id: VaultId) -> Result<Option<Vault>> {
        Ok(self.inner.read().await.vaults.get(&id).cloned())
    }

    async fn vault_by_name(&self, owner_id: UserId, name: &str) -> Result<Option<Vault>> {
        Ok(self
            .inner
            .read()
            .await
            .vaults
            .values()
            .find(|v| v.owner_id == owner_id && v.name == name)
            .cloned())
    }

    async fn list_vaults(&self) -> Result<Vec<Vault>> {
        let mut vaults: Vec<_> = self.inner.read().await.vaults.values().cloned().collect();
        vaults.sort_by_key(|v| v.id);
        Ok(vaults)
    }

    async fn list_active_vaults(&self) -> Result<Vec<Vault>> {
        let mut vaults: Vec<_> = self
            .inner
            .read()
            .await
            .vaults
            .values()
            .filter(|v| v.is_active)
            .cloned()
            .collect();
        vaults.sort_by_key(|v| v.id);
        Ok(vaults)
    }

    async fn update_vault(&self, vault: &Vault) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.vaults.get_mut(&vault.id) {
            Some(existing) => {
                *existing = vault.clone();
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(Error::NotFound(format!("vault {}", vault.id))),
        }
    }

    async fn set_vault_active(&self, id: VaultId, active: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let vault = inner
            .vaults
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("vault {id}")))?;
        vault.is_active = active;
        vault.updated_at = Utc::now();
        Ok(())
    }

    async fn sync_policy(&self, vault_id: VaultId) -> Result<Option<SyncPolicy>> {
        Ok(self.inner.read().await.sync_policies.get(&vault_id).cloned())
    }

    async fn update_sync_policy(&self, vault_id: VaultId, policy: SyncPolicy) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.vaults.contains_key(&vault_id) {
            return Err(Error::NotFound(format!("vault {vault_id}")));
        }
        inner.sync_policies.insert(vault_id, policy);
        Ok(())
    }
}

#[async_trait]
impl VaultKeyStore for MemoryStore {
    async fn insert_initial_key(&self, key: VaultKey) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.active_keys.contains_key(&key.vault_id) {
            return Err(Error::Conflict(format!(
                "vault {} already has an active key",
                key.vault_id
            )));
        }
        inner.active_keys.insert(key.vault_id, key);
        Ok(())
    }

    async fn active_key(&self, vault_id: VaultId) -> Result<Option<VaultKey>> {
        Ok(self.inner.read().await.active_keys.get(&vault_id).cloned())
    }

    async fn rotate_vault_key(
        &self,
        vault_id: VaultId,
        wrapped_key: Vec<u8>,
        iv: Vec<u8>,
    ) -> Result<KeyVersion> {
        let mut inner = self.inner.write().await;

        let unfinished = inner
            .trashed_keys
            .get(&vault_id)
            .map(|keys| keys.iter().any(|k| k.rotation_completed_at.is_none()))
            .unwrap_or(false);
        if unfinished {
            return Err(Error::Conflict(format!(
                "vault {vault_id} already has a rotation in progress"
            )));
        }

        let current = inner
            .active_keys
            .remove(&vault_id)
            .ok_or(Error::KeyMissing(vault_id))?;
        let new_version = current.version + 1;
        let now = Utc::now();

        inner
            .trashed_keys
            .entry(vault_id)
            .or_default()
            .push(TrashedVaultKey {
                vault_id,
                version: current.version,
                wrapped_key: current.wrapped_key,
                iv: current.iv,
                created_at: current.created_at,
                trashed_at: now,
                rotation_completed_at: None,
            });
        inner.active_keys.insert(
            vault_id,
            VaultKey {
                vault_id,
                version: new_version,
                wrapped_key,
                iv,
                created_at: now,
            },
        );
        Ok(new_version)
    }

    async fn finish_vault_key_rotation(&self, vault_id: VaultId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(keys) = inner.trashed_keys.get_mut(&vault_id) {
            if let Some(key) = keys
                .iter_mut()
                .filter(|k| k.rotation_completed_at.is_none())
                .max_by_key(|k| k.version)
            {
                key.rotation_completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn rotation_in_progress(&self, vault_id: VaultId) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .trashed_keys
            .get(&vault_id)
            .map(|keys| keys.iter().any(|k| k.rotation_completed_at.is_none()))
            .unwrap_or(false))
    }

    async fn rotation_old_key(&self, vault_id: VaultId) -> Result<Option<TrashedVaultKey>> {
        Ok(self
            .inner
            .read()
            .await
            .trashed_keys
            .get(&vault_id)
            .and_then(|keys| {
                keys.iter()
                    .filter(|k| k.rotation_completed_at.is_none())
                    .max_by_key(|k| k.version)
                    .cloned()
            }))
    }

    async fn trashed_keys(&self, vault_id: VaultId) -> Result<Vec<TrashedVaultKey>> {
        Ok(self
            .inner
            .read()
            .await
            .trashed_keys
            .get(&vault_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn purge_trashed_key(&self, vault_id: VaultId, version: KeyVersion) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(keys) = inner.trashed_keys.get_mut(&vault_id) {
            keys.retain(|k| k.version != version);
        }
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn create_api_key(&self, draft: NewApiKey) -> Result<ApiKey> {
        let mut inner = self.inner.write().await;
        inner.counters.api_key += 1;
        let key = ApiKey {
            id: inner.counters.api_key,
            user_id: draft.user_id,
            name: draft.name,
            provider: draft.provider,
            access_key: draft.access_key,
            wrapped_secret: draft.wrapped_secret,
            iv: draft.iv,
            region: draft.region,
            endpoint: draft.endpoint,
        };
        inner.api_keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn api_key(&self, id: ApiKeyId) -> Result<Option<ApiKey>> {
        Ok(self.inner.read().await.api_keys.get(&id).cloned())
    }

    async fn api_keys_for_user(&self, user_id: UserId) -> Result<Vec<ApiKey>> {
        let mut keys: Vec<_> = self
            .inner
            .read()
            .await
            .api_keys
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.id);
        Ok(keys)
    }

    async fn delete_api_key(&self, id: ApiKeyId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .api_keys
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("api key {id}")))
    }
}

impl Inner {
    fn insert_entry_locked(&mut self, draft: NewEntry) -> Result<FsEntry> {
        if let Some(parent_id) = draft.parent_id {
            let parent = self
                .entries
                .get(&parent_id)
                .ok_or_else(|| Error::NotFound(format!("parent entry {parent_id}")))?;
            if parent.kind != EntryKind::Directory {
                return Err(Error::Validation(format!(
                    "parent '{}' is not a directory",
                    parent.path
                )));
            }
            if parent.vault_id != draft.vault_id {
                return Err(Error::Validation("parent belongs to another vault".into()));
            }
        }

        let clash = self.entries.values().any(|e| {
            e.vault_id == draft.vault_id && e.parent_id == draft.parent_id && e.name == draft.name
        });
        if clash {
            return Err(Error::Conflict(format!(
                "entry '{}' already exists in its parent",
                draft.name
            )));
        }

        self.counters.entry += 1;
        self.counters.inode += 1;
        let now = Utc::now();
        let entry = FsEntry {
            id: self.counters.entry,
            vault_id: draft.vault_id,
            parent_id: draft.parent_id,
            name: draft.name,
            path: draft.path,
            inode: self.counters.inode,
            mode: draft.mode,
            owner_uid: draft.owner_uid,
            group_gid: draft.group_gid,
            base32_alias: alias::generate(),
            kind: draft.kind,
            created_by: draft.created_by,
            last_modified_by: draft.created_by,
            created_at: now,
            updated_at: now,
            file: draft.file,
        };
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }
}

#[async_trait]
impl FsStore for MemoryStore {
    async fn ensure_root(&self, vault_id: VaultId, actor: UserId) -> Result<FsEntry> {
        let mut inner = self.inner.write().await;
        if let Some(root) = inner
            .entries
            .values()
            .find(|e| e.vault_id == vault_id && e.parent_id.is_none())
        {
            return Ok(root.clone());
        }
        inner.insert_entry_locked(NewEntry {
            vault_id,
            parent_id: None,
            name: String::new(),
            path: "/".to_string(),
            mode: 0o755,
            owner_uid: 0,
            group_gid: 0,
            kind: EntryKind::Directory,
            created_by: actor,
            file: None,
        })
    }

    async fn entry_by_path(&self, vault_id: VaultId, path: &str) -> Result<Option<FsEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .values()
            .find(|e| e.vault_id == vault_id && e.path == path)
            .cloned())
    }

    async fn entry_by_id(&self, id: EntryId) -> Result<Option<FsEntry>> {
        Ok(self.inner.read().await.entries.get(&id).cloned())
    }

    async fn children(&self, parent_id: EntryId) -> Result<Vec<FsEntry>> {
        let mut children: Vec<_> = self
            .inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn subtree(&self, vault_id: VaultId, prefix: &str) -> Result<Vec<FsEntry>> {
        let mut entries: Vec<_> = self
            .inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| {
                e.vault_id == vault_id && e.path != prefix && paths::is_within(prefix, &e.path)
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn insert_entry(&self, draft: NewEntry) -> Result<FsEntry> {
        self.inner.write().await.insert_entry_locked(draft)
    }

    async fn update_file_meta(
        &self,
        id: EntryId,
        meta: FileMeta,
        modified_by: UserId,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;
        if entry.kind != EntryKind::File {
            return Err(Error::Validation(format!("entry '{}' is not a file", entry.path)));
        }
        entry.file = Some(meta);
        entry.last_modified_by = modified_by;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn move_entry(
        &self,
        id: EntryId,
        new_parent: EntryId,
        new_name: &str,
        actor: UserId,
    ) -> Result<FsEntry> {
        paths::validate_name(new_name)?;
        let mut inner = self.inner.write().await;

        let parent = inner
            .entries
            .get(&new_parent)
            .ok_or_else(|| Error::NotFound(format!("parent entry {new_parent}")))?
            .clone();
        if parent.kind != EntryKind::Directory {
            return Err(Error::Validation(format!(
                "'{}' is not a directory",
                parent.path
            )));
        }

        let entry = inner
            .entries
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?
            .clone();
        if entry.parent_id.is_none() {
            return Err(Error::Validation("cannot move the vault root".into()));
        }
        if paths::is_within(&entry.path, &parent.path) {
            return Err(Error::Validation(format!(
                "cannot move '{}' beneath itself",
                entry.path
            )));
        }

        let clash = inner.entries.values().any(|e| {
            e.id != id
                && e.vault_id == entry.vault_id
                && e.parent_id == Some(new_parent)
                && e.name == new_name
        });
        if clash {
            return Err(Error::Conflict(format!(
                "entry '{new_name}' already exists in '{}'",
                parent.path
            )));
        }

        let old_path = entry.path.clone();
        let new_path = paths::join(&parent.path, new_name);

        // Rewrite the entry and every descendant path in one critical
        // section, the transactional contract of move_entry.
        let descendant_ids: Vec<EntryId> = inner
            .entries
            .values()
            .filter(|e| e.vault_id == entry.vault_id && paths::is_within(&old_path, &e.path))
            .map(|e| e.id)
            .collect();
        for did in descendant_ids {
            let e = inner.entries.get_mut(&did).expect("descendant exists");
            e.path = format!("{new_path}{}", &e.path[old_path.len()..]);
            if did == id {
                e.parent_id = Some(new_parent);
                e.name = new_name.to_string();
                e.last_modified_by = actor;
            }
            e.updated_at = Utc::now();
        }

        Ok(inner.entries.get(&id).expect("moved entry exists").clone())
    }

    async fn remove_entry(&self, id: EntryId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?
            .clone();
        inner
            .entries
            .retain(|_, e| !(e.vault_id == entry.vault_id && paths::is_within(&entry.path, &e.path)));
        Ok(())
    }

    async fn touch(&self, id: EntryId, actor: UserId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;
        entry.last_modified_by = actor;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn vault_size(&self, vault_id: VaultId) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.vault_id == vault_id)
            .filter_map(|e| e.file.as_ref())
            .map(|f| f.size_bytes)
            .sum())
    }

    async fn entries_with_key_version(
        &self,
        vault_id: VaultId,
        version: KeyVersion,
    ) -> Result<Vec<FsEntry>> {
        let mut entries: Vec<_> = self
            .inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| {
                e.vault_id == vault_id
                    && e.file
                        .as_ref()
                        .map(|f| f.encrypted_with_key_version == version)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn set_quarantined(&self, id: EntryId, quarantined: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;
        match entry.file.as_mut() {
            Some(file) => {
                file.quarantined = quarantined;
                Ok(())
            }
            None => Err(Error::Validation(format!(
                "entry '{}' is not a file",
                entry.path
            ))),
        }
    }
}

#[async_trait]
impl TrashStore for MemoryStore {
    async fn trash_file(
        &self,
        vault_id: VaultId,
        base32_alias: &str,
        backing_path: &str,
        trashed_by: UserId,
    ) -> Result<TrashedFile> {
        let mut inner = self.inner.write().await;
        inner.counters.trash += 1;
        let trashed = TrashedFile {
            id: inner.counters.trash,
            vault_id,
            base32_alias: base32_alias.to_string(),
            backing_path: backing_path.to_string(),
            trashed_at: Utc::now(),
            trashed_by,
            deleted_at: None,
        };
        inner.trash.insert(trashed.id, trashed.clone());
        Ok(trashed)
    }

    async fn trashed_files(&self, vault_id: VaultId) -> Result<Vec<TrashedFile>> {
        let mut files: Vec<_> = self
            .inner
            .read()
            .await
            .trash
            .values()
            .filter(|t| t.vault_id == vault_id)
            .cloned()
            .collect();
        files.sort_by_key(|t| t.id);
        Ok(files)
    }

    async fn trashed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TrashedFile>> {
        let mut files: Vec<_> = self
            .inner
            .read()
            .await
            .trash
            .values()
            .filter(|t| t.deleted_at.is_none() && t.trashed_at < cutoff)
            .cloned()
            .collect();
        files.sort_by_key(|t| t.id);
        Ok(files)
    }

    async fn mark_trash_deleted(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.trash.get_mut(&id) {
            Some(t) => {
                t.deleted_at = Some(Utc::now());
                Ok(())
            }
            None => Err(Error::NotFound(format!("trashed file {id}"))),
        }
    }
}

#[async_trait]
impl CacheIndexStore for MemoryStore {
    async fn upsert_cache_entry(&self, entry: CacheEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .cache
            .insert((entry.vault_id, entry.path.clone(), entry.kind), entry);
        Ok(())
    }

    async fn cache_entry(
        &self,
        vault_id: VaultId,
        path: &str,
        kind: EntryKind,
    ) -> Result<Option<CacheEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .cache
            .get(&(vault_id, path.to_string(), kind))
            .cloned())
    }

    async fn touch_cache_entry(
        &self,
        vault_id: VaultId,
        path: &str,
        kind: EntryKind,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.cache.get_mut(&(vault_id, path.to_string(), kind)) {
            entry.last_accessed = Utc::now();
        }
        Ok(())
    }

    async fn cache_size(&self, vault_id: VaultId) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .await
            .cache
            .values()
            .filter(|e| e.vault_id == vault_id)
            .map(|e| e.size_bytes)
            .sum())
    }

    async fn cache_lru(&self, vault_id: VaultId, limit: usize) -> Result<Vec<CacheEntry>> {
        let mut entries: Vec<_> = self
            .inner
            .read()
            .await
            .cache
            .values()
            .filter(|e| e.vault_id == vault_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.last_accessed);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn cache_entries(&self, vault_id: VaultId) -> Result<Vec<CacheEntry>> {
        let mut entries: Vec<_> = self
            .inner
            .read()
            .await
            .cache
            .values()
            .filter(|e| e.vault_id == vault_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn remove_cache_entry(
        &self,
        vault_id: VaultId,
        path: &str,
        kind: EntryKind,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.cache.remove(&(vault_id, path.to_string(), kind));
        Ok(())
    }
}

#[async_trait]
impl RbacStore for MemoryStore {
    async fn create_role(&self, name: &str, role_type: RoleType, permissions: u64) -> Result<Role> {
        let mut inner = self.inner.write().await;
        if inner.roles.values().any(|r| r.name == name) {
            return Err(Error::Conflict(format!("role '{name}' already exists")));
        }
        inner.counters.role += 1;
        let role = Role {
            id: inner.counters.role,
            name: name.to_string(),
            role_type,
            permissions,
        };
        inner.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn role(&self, id: RoleId) -> Result<Option<Role>> {
        Ok(self.inner.read().await.roles.get(&id).cloned())
    }

    async fn role_by_name(&self, name: &str) -> Result<Option<Role>> {
        Ok(self
            .inner
            .read()
            .await
            .roles
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let mut roles: Vec<_> = self.inner.read().await.roles.values().cloned().collect();
        roles.sort_by_key(|r| r.id);
        Ok(roles)
    }

    async fn update_role_permissions(&self, id: RoleId, permissions: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let role = inner
            .roles
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("role {id}")))?;
        role.permissions = permissions;
        Ok(())
    }

    async fn delete_role(&self, id: RoleId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .roles
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("role {id}")))?;
        inner.assignments.retain(|_, a| a.role_id != id);
        Ok(())
    }

    async fn create_group(&self, name: &str) -> Result<Group> {
        let mut inner = self.inner.write().await;
        if inner.groups.values().any(|g| g.name == name) {
            return Err(Error::Conflict(format!("group '{name}' already exists")));
        }
        inner.counters.group += 1;
        let group = Group {
            id: inner.counters.group,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        inner.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn add_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.groups.contains_key(&group_id) {
            return Err(Error::NotFound(format!("group {group_id}")));
        }
        inner.group_members.entry(group_id).or_default().insert(user_id);
        Ok(())
    }

    async fn remove_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.group_members.get_mut(&group_id) {
            members.remove(&user_id);
        }
        Ok(())
    }

    async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<GroupId>> {
        let mut groups: Vec<_> = self
            .inner
            .read()
            .await
            .group_members
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .map(|(gid, _)| *gid)
            .collect();
        groups.sort_unstable();
        Ok(groups)
    }

    async fn create_assignment(
        &self,
        subject: Subject,
        role_id: RoleId,
        vault_id: Option<VaultId>,
    ) -> Result<RoleAssignment> {
        let mut inner = self.inner.write().await;
        if !inner.roles.contains_key(&role_id) {
            return Err(Error::NotFound(format!("role {role_id}")));
        }
        inner.counters.assignment += 1;
        let assignment = RoleAssignment {
            id: inner.counters.assignment,
            subject,
            role_id,
            vault_id,
        };
        inner.assignments.insert(assignment.id, assignment.clone());
        Ok(assignment)
    }

    async fn delete_assignment(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .assignments
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("role assignment {id}")))?;
        inner.overrides.retain(|_, o| o.assignment_id != id);
        Ok(())
    }

    async fn assignments_for_subject(&self, subject: Subject) -> Result<Vec<RoleAssignment>> {
        let mut assignments: Vec<_> = self
            .inner
            .read()
            .await
            .assignments
            .values()
            .filter(|a| a.subject == subject)
            .cloned()
            .collect();
        assignments.sort_by_key(|a| a.id);
        Ok(assignments)
    }

    async fn create_override(&self, draft: NewOverride) -> Result<PermissionOverride> {
        let mut inner = self.inner.write().await;
        if !inner.assignments.contains_key(&draft.assignment_id) {
            return Err(Error::NotFound(format!(
                "role assignment {}",
                draft.assignment_id
            )));
        }
        inner.counters.permission_override += 1;
        let over = PermissionOverride {
            id: inner.counters.permission_override,
            assignment_id: draft.assignment_id,
            capability_bit: draft.capability_bit,
            pattern: draft.pattern,
            effect: draft.effect,
            enabled: true,
        };
        inner.overrides.insert(over.id, over.clone());
        Ok(over)
    }

    async fn overrides_for_assignment(
        &self,
        assignment_id: u32,
    ) -> Result<Vec<PermissionOverride>> {
        let mut overrides: Vec<_> = self
            .inner
            .read()
            .await
            .overrides
            .values()
            .filter(|o| o.assignment_id == assignment_id)
            .cloned()
            .collect();
        overrides.sort_by_key(|o| o.id);
        Ok(overrides)
    }

    async fn set_override_enabled(&self, id: u32, enabled: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let over = inner
            .overrides
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("permission override {id}")))?;
        over.enabled = enabled;
        Ok(())
    }

    async fn delete_override(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .overrides
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("permission override {id}")))
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn start_sync_event(&self, vault_id: VaultId, trigger: SyncTrigger) -> Result<SyncEvent> {
        let mut inner = self.inner.write().await;
        inner.counters.sync_event += 1;
        let event = SyncEvent {
            id: inner.counters.sync_event,
            vault_id,
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            error: None,
        };
        inner.sync_events.push(event.clone());
        Ok(event)
    }

    async fn finish_sync_event(
        &self,
        id: u64,
        outcome: SyncOutcome,
        error: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let event = inner
            .sync_events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("sync event {id}")))?;
        event.finished_at = Some(Utc::now());
        event.outcome = Some(outcome);
        event.error = error;
        Ok(())
    }

    async fn sync_events(&self, vault_id: VaultId, limit: usize) -> Result<Vec<SyncEvent>> {
        let inner = self.inner.read().await;
        let mut events: Vec<_> = inner
            .sync_events
            .iter()
            .filter(|e| e.vault_id == vault_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        events.truncate(limit);
        Ok(events)
    }

    async fn last_success_at(&self, vault_id: VaultId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .read()
            .await
            .sync_events
            .iter()
            .filter(|e| e.vault_id == vault_id && e.outcome == Some(SyncOutcome::Success))
            .filter_map(|e| e.finished_at)
            .max())
    }

    async fn prune_sync_events(&self, cutoff: DateTime<Utc>, max_keep: usize) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.sync_events.len();
        inner.sync_events.retain(|e| e.started_at >= cutoff);

        // Cap per vault, newest kept.
        let mut per_vault: HashMap<VaultId, Vec<u64>> = HashMap::new();
        for e in &inner.sync_events {
            per_vault.entry(e.vault_id).or_default().push(e.id);
        }
        let mut drop_ids = HashSet::new();
        for ids in per_vault.values_mut() {
            ids.sort_by(|a, b| b.cmp(a));
            for id in ids.iter().skip(max_keep) {
                drop_ids.insert(*id);
            }
        }
        inner.sync_events.retain(|e| !drop_ids.contains(&e.id));

        Ok((before - inner.sync_events.len()) as u64)
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn secret(&self, key: &str) -> Result<Option<InternalSecret>> {
        Ok(self.inner.read().await.secrets.get(key).cloned())
    }

    async fn put_secret(&self, secret: InternalSecret) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.secrets.insert(secret.key.clone(), secret);
        Ok(())
    }
}

#[async_trait]
impl WaiverStore for MemoryStore {
    async fn append_waiver(&self, mut waiver: Waiver) -> Result<Waiver> {
        let mut inner = self.inner.write().await;
        inner.counters.waiver += 1;
        waiver.id = inner.counters.waiver;
        waiver.created_at = Utc::now();
        inner.waivers.push(waiver.clone());
        Ok(waiver)
    }

    async fn waivers_for_vault(&self, vault_id: VaultId) -> Result<Vec<Waiver>> {
        Ok(self
            .inner
            .read()
            .await
            .waivers
            .iter()
            .filter(|w| w.vault_id == vault_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_core::types::VaultType;

    fn vault_draft(name: &str, owner: UserId) -> NewVault {
        NewVault {
            name: name.to_string(),
            owner_id: owner,
            vault_type: VaultType::Local,
            mount_point: "/tmp/v".to_string(),
            quota_bytes: 0,
            description: String::new(),
            s3: None,
        }
    }

    fn key(vault_id: VaultId, version: KeyVersion) -> VaultKey {
        VaultKey {
            vault_id,
            version,
            wrapped_key: vec![0u8; 48],
            iv: vec![0u8; 12],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_vault_name_per_owner_conflicts() {
        let store = MemoryStore::new();
        store.create_vault(vault_draft("docs", 1)).await.unwrap();
        let err = store.create_vault(vault_draft("docs", 1)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // Same name under a different owner is fine.
        store.create_vault(vault_draft("docs", 2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exactly_one_active_key_through_rotations() {
        let store = MemoryStore::new();
        let vault = store.create_vault(vault_draft("docs", 1)).await.unwrap();
        store.insert_initial_key(key(vault.id, 1)).await.unwrap();
        assert!(matches!(
            store.insert_initial_key(key(vault.id, 1)).await.unwrap_err(),
            Error::Conflict(_)
        ));

        for expected in 2..=5u32 {
            let v = store
                .rotate_vault_key(vault.id, vec![1u8; 48], vec![1u8; 12])
                .await
                .unwrap();
            assert_eq!(v, expected);
            assert!(store.rotation_in_progress(vault.id).await.unwrap());
            store.finish_vault_key_rotation(vault.id).await.unwrap();
            assert!(!store.rotation_in_progress(vault.id).await.unwrap());

            let active = store.active_key(vault.id).await.unwrap().unwrap();
            assert_eq!(active.version, expected);
        }

        // Versions in the trash are strictly increasing and all finished.
        let trashed = store.trashed_keys(vault.id).await.unwrap();
        let versions: Vec<_> = trashed.iter().map(|k| k.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
        assert!(trashed.iter().all(|k| k.rotation_completed_at.is_some()));
    }

    #[tokio::test]
    async fn test_second_rotation_without_finish_conflicts() {
        let store = MemoryStore::new();
        let vault = store.create_vault(vault_draft("docs", 1)).await.unwrap();
        store.insert_initial_key(key(vault.id, 1)).await.unwrap();

        store
            .rotate_vault_key(vault.id, vec![1u8; 48], vec![1u8; 12])
            .await
            .unwrap();
        let err = store
            .rotate_vault_key(vault.id, vec![2u8; 48], vec![2u8; 12])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_revoke_all_counts_each_token_once() {
        let store = MemoryStore::new();
        for jti in ["a", "b"] {
            store
                .add_refresh_token(RefreshTokenRecord {
                    jti: jti.to_string(),
                    user_id: 1,
                    hashed_token: "h".into(),
                    ip: "127.0.0.1".into(),
                    user_agent: "test".into(),
                    issued_at: Utc::now(),
                    expires_at: Utc::now() + chrono::Duration::days(7),
                    revoked: false,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.revoke_all_refresh_tokens(1).await.unwrap(), 2);
        // Already-revoked tokens are not counted again.
        assert_eq!(store.revoke_all_refresh_tokens(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_move_entry_rewrites_descendant_paths() {
        let store = MemoryStore::new();
        let vault = store.create_vault(vault_draft("docs", 1)).await.unwrap();
        let root = store.ensure_root(vault.id, 1).await.unwrap();

        let dir = |parent: &FsEntry, name: &str| NewEntry {
            vault_id: vault.id,
            parent_id: Some(parent.id),
            name: name.to_string(),
            path: paths::join(&parent.path, name),
            mode: 0o755,
            owner_uid: 0,
            group_gid: 0,
            kind: EntryKind::Directory,
            created_by: 1,
            file: None,
        };

        let a = store.insert_entry(dir(&root, "a")).await.unwrap();
        let b = store.insert_entry(dir(&a, "b")).await.unwrap();
        let _c = store.insert_entry(dir(&b, "c")).await.unwrap();
        let dest = store.insert_entry(dir(&root, "dest")).await.unwrap();

        store.move_entry(a.id, dest.id, "a2", 1).await.unwrap();

        let moved_c = store
            .entry_by_path(vault.id, "/dest/a2/b/c")
            .await
            .unwrap()
            .expect("descendant path rewritten");
        assert_eq!(moved_c.kind, EntryKind::Directory);
        assert!(store.entry_by_path(vault.id, "/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_sibling_name_conflicts() {
        let store = MemoryStore::new();
        let vault = store.create_vault(vault_draft("docs", 1)).await.unwrap();
        let root = store.ensure_root(vault.id, 1).await.unwrap();

        let draft = NewEntry {
            vault_id: vault.id,
            parent_id: Some(root.id),
            name: "x".to_string(),
            path: "/x".to_string(),
            mode: 0o644,
            owner_uid: 0,
            group_gid: 0,
            kind: EntryKind::Directory,
            created_by: 1,
            file: None,
        };
        store.insert_entry(draft.clone()).await.unwrap();
        assert!(matches!(
            store.insert_entry(draft).await.unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_sync_event_retention_cap() {
        let store = MemoryStore::new();
        let vault = store.create_vault(vault_draft("docs", 1)).await.unwrap();
        for _ in 0..10 {
            let e = store
                .start_sync_event(vault.id, SyncTrigger::Schedule)
                .await
                .unwrap();
            store
                .finish_sync_event(e.id, SyncOutcome::Success, None)
                .await
                .unwrap();
        }

        let pruned = store
            .prune_sync_events(Utc::now() - chrono::Duration::days(30), 4)
            .await
            .unwrap();
        assert_eq!(pruned, 6);

        let events = store.sync_events(vault.id, 100).await.unwrap();
        assert_eq!(events.len(), 4);
        // Newest events survive.
        assert!(events[0].id > events[3].id);
    }
}
