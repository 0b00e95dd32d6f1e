//! Vault records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vaulthalla_core::types::{ApiKeyId, KeyVersion, UserId, VaultId, VaultType};

/// A named, per-owner storage domain.
///
/// `(name, owner_id)` is unique. A vault has exactly one active data key at
/// all times after creation and at most one rotation in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub name: String,
    pub owner_id: UserId,
    pub vault_type: VaultType,
    pub mount_point: String,
    /// 0 = unlimited
    pub quota_bytes: u64,
    pub description: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Present iff `vault_type == S3`
    pub s3: Option<S3Settings>,
}

/// S3 variant payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    pub api_key_id: ApiKeyId,
    pub bucket: String,
    /// Whether uploads to the upstream bucket stay encrypted
    pub encrypt_upstream: bool,
}

/// Draft for vault creation
#[derive(Debug, Clone)]
pub struct NewVault {
    pub name: String,
    pub owner_id: UserId,
    pub vault_type: VaultType,
    pub mount_point: String,
    pub quota_bytes: u64,
    pub description: String,
    pub s3: Option<S3Settings>,
}

/// Active data key row for a vault. The wrapped key is AES-256-GCM
/// ciphertext under the master key, stored with its wrap IV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultKey {
    pub vault_id: VaultId,
    pub version: KeyVersion,
    pub wrapped_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// A superseded data key. `rotation_completed_at` stays null until the
/// re-encryption walk finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashedVaultKey {
    pub vault_id: VaultId,
    pub version: KeyVersion,
    pub wrapped_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub trashed_at: DateTime<Utc>,
    pub rotation_completed_at: Option<DateTime<Utc>>,
}
