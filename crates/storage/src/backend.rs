//! The backend seam
//!
//! Higher layers dispatch through [`VaultBackend`] instead of matching on
//! the vault type: the engine is identical for local-disk and S3 vaults,
//! only the object transport differs. Object keys are flat backing names
//! (for payloads, the entry's base32 alias).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vaulthalla_core::Result;

/// One object in a backing store listing.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Transport for a vault's backing objects.
#[async_trait]
pub trait VaultBackend: Send + Sync {
    /// Fails `NotFound` when the object does not exist, `Transient` on
    /// retryable I/O trouble, `Unauthorized` on credential failure.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    /// Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    async fn copy(&self, from: &str, to: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Every object whose key starts with `prefix` (empty = all).
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
    /// Bytes available to the backing store, when the transport can tell.
    async fn free_space(&self) -> Result<Option<u64>>;
}
