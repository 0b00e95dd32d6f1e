//! Store query contracts
//!
//! One trait per aggregate; implementations provide atomicity where a
//! method's contract demands it (noted per method). The umbrella [`Store`]
//! trait is what the daemon wires through the subsystems.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vaulthalla_core::types::{
    ApiKeyId, EntryId, GroupId, KeyVersion, RoleId, SyncOutcome, SyncTrigger, UserId, VaultId,
};
use vaulthalla_core::Result;

use crate::model::{
    ApiKey, CacheEntry, EntryKind, FileMeta, FsEntry, Group, NewApiKey, NewEntry, NewOverride,
    NewUser, NewVault, PermissionOverride, RefreshTokenRecord, Role, RoleAssignment, RoleType,
    Subject, SyncEvent, SyncPolicy, TrashedFile, TrashedVaultKey, User, Vault, VaultKey,
    InternalSecret, Waiver,
};

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails `Conflict` when name or email is already taken.
    async fn create_user(&self, draft: NewUser) -> Result<User>;
    async fn user_by_id(&self, id: UserId) -> Result<Option<User>>;
    async fn user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn update_user(&self, user: &User) -> Result<()>;
    async fn update_password_hash(&self, id: UserId, hash: &str) -> Result<()>;
    async fn update_last_login(&self, id: UserId) -> Result<()>;
    async fn list_users(&self) -> Result<Vec<User>>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn add_refresh_token(&self, record: RefreshTokenRecord) -> Result<()>;
    async fn refresh_token(&self, jti: &str) -> Result<Option<RefreshTokenRecord>>;
    /// Marks every live token for the user revoked; returns how many were
    /// flipped (each token is revoked exactly once).
    async fn revoke_all_refresh_tokens(&self, user_id: UserId) -> Result<u64>;
    async fn revoke_refresh_token(&self, jti: &str) -> Result<()>;
    /// Drops revoked and expired rows; returns the purge count.
    async fn purge_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait VaultStore: Send + Sync {
    /// Fails `Conflict` when `(name, owner_id)` already exists.
    async fn create_vault(&self, draft: NewVault) -> Result<Vault>;
    async fn vault(&self, id: VaultId) -> Result<Option<Vault>>;
    async fn vault_by_name(&self, owner_id: UserId, name: &str) -> Result<Option<Vault>>;
    async fn list_vaults(&self) -> Result<Vec<Vault>>;
    async fn list_active_vaults(&self) -> Result<Vec<Vault>>;
    async fn update_vault(&self, vault: &Vault) -> Result<()>;
    async fn set_vault_active(&self, id: VaultId, active: bool) -> Result<()>;
    async fn sync_policy(&self, vault_id: VaultId) -> Result<Option<SyncPolicy>>;
    async fn update_sync_policy(&self, vault_id: VaultId, policy: SyncPolicy) -> Result<()>;
}

#[async_trait]
pub trait VaultKeyStore: Send + Sync {
    /// Installs version 1 for a fresh vault. Fails `Conflict` when an
    /// active key already exists.
    async fn insert_initial_key(&self, key: VaultKey) -> Result<()>;
    async fn active_key(&self, vault_id: VaultId) -> Result<Option<VaultKey>>;
    /// Atomic rotation step: moves the current active row to the trashed
    /// table (retaining its version) and installs the supplied wrapped key
    /// as `version = prev + 1`, all in one transaction. Returns the new
    /// version.
    async fn rotate_vault_key(
        &self,
        vault_id: VaultId,
        wrapped_key: Vec<u8>,
        iv: Vec<u8>,
    ) -> Result<KeyVersion>;
    /// Stamps `rotation_completed_at` on the most recent trashed key.
    async fn finish_vault_key_rotation(&self, vault_id: VaultId) -> Result<()>;
    /// True while a trashed key with `rotation_completed_at IS NULL` exists.
    async fn rotation_in_progress(&self, vault_id: VaultId) -> Result<bool>;
    /// The superseded key for an unfinished rotation.
    async fn rotation_old_key(&self, vault_id: VaultId) -> Result<Option<TrashedVaultKey>>;
    async fn trashed_keys(&self, vault_id: VaultId) -> Result<Vec<TrashedVaultKey>>;
    async fn purge_trashed_key(&self, vault_id: VaultId, version: KeyVersion) -> Result<()>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn create_api_key(&self, draft: NewApiKey) -> Result<ApiKey>;
    async fn api_key(&self, id: ApiKeyId) -> Result<Option<ApiKey>>;
    async fn api_keys_for_user(&self, user_id: UserId) -> Result<Vec<ApiKey>>;
    async fn delete_api_key(&self, id: ApiKeyId) -> Result<()>;
}

#[async_trait]
pub trait FsStore: Send + Sync {
    /// Returns the vault root, creating it on first call.
    async fn ensure_root(&self, vault_id: VaultId, actor: UserId) -> Result<FsEntry>;
    async fn entry_by_path(&self, vault_id: VaultId, path: &str) -> Result<Option<FsEntry>>;
    async fn entry_by_id(&self, id: EntryId) -> Result<Option<FsEntry>>;
    async fn children(&self, parent_id: EntryId) -> Result<Vec<FsEntry>>;
    /// Entries whose path sits under `prefix`, the prefix entry excluded.
    async fn subtree(&self, vault_id: VaultId, prefix: &str) -> Result<Vec<FsEntry>>;
    /// Fails `Conflict` when `(parent_id, name)` already exists.
    async fn insert_entry(&self, draft: NewEntry) -> Result<FsEntry>;
    async fn update_file_meta(
        &self,
        id: EntryId,
        meta: FileMeta,
        modified_by: UserId,
    ) -> Result<()>;
    /// Re-parents or renames an entry, rewriting descendant paths in the
    /// same transaction. Fails `Conflict` on a `(parent, name)` clash.
    async fn move_entry(
        &self,
        id: EntryId,
        new_parent: EntryId,
        new_name: &str,
        actor: UserId,
    ) -> Result<FsEntry>;
    /// Removes the entry and, for directories, its whole subtree.
    async fn remove_entry(&self, id: EntryId) -> Result<()>;
    /// Bumps timestamps and `last_modified_by` (parent-directory stats).
    async fn touch(&self, id: EntryId, actor: UserId) -> Result<()>;
    async fn vault_size(&self, vault_id: VaultId) -> Result<u64>;
    /// Files still sealed under the given key version (rotation walk input).
    async fn entries_with_key_version(
        &self,
        vault_id: VaultId,
        version: KeyVersion,
    ) -> Result<Vec<FsEntry>>;
    async fn set_quarantined(&self, id: EntryId, quarantined: bool) -> Result<()>;
}

#[async_trait]
pub trait TrashStore: Send + Sync {
    /// Records the trashed file; the backing object stays put until the
    /// janitor reclaims it. Callers pair this with `FsStore::remove_entry`
    /// inside one transaction.
    async fn trash_file(
        &self,
        vault_id: VaultId,
        base32_alias: &str,
        backing_path: &str,
        trashed_by: UserId,
    ) -> Result<TrashedFile>;
    async fn trashed_files(&self, vault_id: VaultId) -> Result<Vec<TrashedFile>>;
    /// Rows trashed before `cutoff` and not yet reclaimed.
    async fn trashed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TrashedFile>>;
    async fn mark_trash_deleted(&self, id: u64) -> Result<()>;
}

#[async_trait]
pub trait CacheIndexStore: Send + Sync {
    async fn upsert_cache_entry(&self, entry: CacheEntry) -> Result<()>;
    async fn cache_entry(
        &self,
        vault_id: VaultId,
        path: &str,
        kind: EntryKind,
    ) -> Result<Option<CacheEntry>>;
    async fn touch_cache_entry(
        &self,
        vault_id: VaultId,
        path: &str,
        kind: EntryKind,
    ) -> Result<()>;
    async fn cache_size(&self, vault_id: VaultId) -> Result<u64>;
    /// Oldest-accessed entries first, up to `limit`.
    async fn cache_lru(&self, vault_id: VaultId, limit: usize) -> Result<Vec<CacheEntry>>;
    async fn cache_entries(&self, vault_id: VaultId) -> Result<Vec<CacheEntry>>;
    async fn remove_cache_entry(
        &self,
        vault_id: VaultId,
        path: &str,
        kind: EntryKind,
    ) -> Result<()>;
}

#[async_trait]
pub trait RbacStore: Send + Sync {
    async fn create_role(&self, name: &str, role_type: RoleType, permissions: u64) -> Result<Role>;
    async fn role(&self, id: RoleId) -> Result<Option<Role>>;
    async fn role_by_name(&self, name: &str) -> Result<Option<Role>>;
    async fn list_roles(&self) -> Result<Vec<Role>>;
    async fn update_role_permissions(&self, id: RoleId, permissions: u64) -> Result<()>;
    async fn delete_role(&self, id: RoleId) -> Result<()>;

    async fn create_group(&self, name: &str) -> Result<Group>;
    async fn add_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()>;
    async fn remove_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()>;
    async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<GroupId>>;

    async fn create_assignment(
        &self,
        subject: Subject,
        role_id: RoleId,
        vault_id: Option<VaultId>,
    ) -> Result<RoleAssignment>;
    async fn delete_assignment(&self, id: u32) -> Result<()>;
    async fn assignments_for_subject(&self, subject: Subject) -> Result<Vec<RoleAssignment>>;

    /// Pattern validity is the caller's responsibility (rejected at
    /// insertion by the rbac layer, not at evaluation).
    async fn create_override(&self, draft: NewOverride) -> Result<PermissionOverride>;
    async fn overrides_for_assignment(&self, assignment_id: u32)
        -> Result<Vec<PermissionOverride>>;
    async fn set_override_enabled(&self, id: u32, enabled: bool) -> Result<()>;
    async fn delete_override(&self, id: u32) -> Result<()>;
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn start_sync_event(&self, vault_id: VaultId, trigger: SyncTrigger) -> Result<SyncEvent>;
    async fn finish_sync_event(
        &self,
        id: u64,
        outcome: SyncOutcome,
        error: Option<String>,
    ) -> Result<()>;
    /// Most recent first.
    async fn sync_events(&self, vault_id: VaultId, limit: usize) -> Result<Vec<SyncEvent>>;
    async fn last_success_at(&self, vault_id: VaultId) -> Result<Option<DateTime<Utc>>>;
    /// Enforces the retention contract: drops events older than `cutoff`
    /// and keeps at most `max_keep` per vault, whichever bites first.
    async fn prune_sync_events(&self, cutoff: DateTime<Utc>, max_keep: usize) -> Result<u64>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn secret(&self, key: &str) -> Result<Option<InternalSecret>>;
    /// Upsert keyed by the unique secret name.
    async fn put_secret(&self, secret: InternalSecret) -> Result<()>;
}

#[async_trait]
pub trait WaiverStore: Send + Sync {
    /// Append-only; waivers are never updated or deleted.
    async fn append_waiver(&self, waiver: Waiver) -> Result<Waiver>;
    async fn waivers_for_vault(&self, vault_id: VaultId) -> Result<Vec<Waiver>>;
}

/// The full persistence surface the daemon wires through the subsystems.
pub trait Store:
    UserStore
    + TokenStore
    + VaultStore
    + VaultKeyStore
    + ApiKeyStore
    + FsStore
    + TrashStore
    + CacheIndexStore
    + RbacStore
    + SyncStore
    + SecretStore
    + WaiverStore
{
}

impl<T> Store for T where
    T: UserStore
        + TokenStore
        + VaultStore
        + VaultKeyStore
        + ApiKeyStore
        + FsStore
        + TrashStore
        + CacheIndexStore
        + RbacStore
        + SyncStore
        + SecretStore
        + WaiverStore
{
}
