//! Filesystem metadata records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vaulthalla_core::types::{EntryId, KeyVersion, UserId, VaultId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

/// Directory or file metadata.
///
/// `(parent_id, name)` is unique within a vault; every vault has exactly
/// one root entry with `path = "/"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsEntry {
    pub id: EntryId,
    pub vault_id: VaultId,
    pub parent_id: Option<EntryId>,
    pub name: String,
    /// Absolute logical path within the vault, `/`-rooted
    pub path: String,
    pub inode: u64,
    pub mode: u32,
    pub owner_uid: u32,
    pub group_gid: u32,
    /// Content-addressed backing name, also the cache filename for S3
    pub base32_alias: String,
    pub kind: EntryKind,
    pub created_by: UserId,
    pub last_modified_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Present iff `kind == File`
    pub file: Option<FileMeta>,
}

impl FsEntry {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// File payload metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub size_bytes: u64,
    pub mime_type: String,
    /// SHA-256 of the plaintext, hex
    pub content_hash: String,
    /// Base64-encoded AEAD IV the payload was sealed with
    pub encryption_iv: String,
    pub encrypted_with_key_version: KeyVersion,
    /// Set when decryption hit an unknown key version; excluded from reads
    /// until an operator intervenes.
    pub quarantined: bool,
}

/// Draft for inserting an entry
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub vault_id: VaultId,
    pub parent_id: Option<EntryId>,
    pub name: String,
    pub path: String,
    pub mode: u32,
    pub owner_uid: u32,
    pub group_gid: u32,
    pub kind: EntryKind,
    pub created_by: UserId,
    pub file: Option<FileMeta>,
}

/// A deleted file awaiting janitor reclamation. Moved here atomically on
/// delete while the object stays on disk or in the bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashedFile {
    pub id: u64,
    pub vault_id: VaultId,
    pub base32_alias: String,
    pub backing_path: String,
    pub trashed_at: DateTime<Utc>,
    pub trashed_by: UserId,
    /// Set once the janitor has reclaimed the backing object
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Local cache index row for S3 vaults, keyed `(vault_id, path, kind)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub vault_id: VaultId,
    pub path: String,
    pub kind: EntryKind,
    pub base32_alias: String,
    pub size_bytes: u64,
    pub last_accessed: DateTime<Utc>,
}
