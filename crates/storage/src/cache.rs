//! Content-addressed local cache for S3 vaults
//!
//! Cached objects live at `<cache_dir>/<vault_id>/<alias>`; the index rows
//! (`CacheIndexStore`) carry `last_accessed` for LRU eviction once the
//! cache grows past its cap.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use vaulthalla_core::types::VaultId;
use vaulthalla_core::{Error, Result};
use vaulthalla_store::model::{CacheEntry, EntryKind};
use vaulthalla_store::CacheIndexStore;

pub struct LocalCache {
    vault_id: VaultId,
    dir: PathBuf,
    cap_bytes: u64,
    index: Arc<dyn CacheIndexStore>,
}

impl LocalCache {
    pub async fn new(
        vault_id: VaultId,
        cache_root: impl Into<PathBuf>,
        cap_bytes: u64,
        index: Arc<dyn CacheIndexStore>,
    ) -> Result<Self> {
        let dir = cache_root.into().join(vault_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Configuration(format!("cannot create cache dir {dir:?}: {e}")))?;
        Ok(Self {
            vault_id,
            dir,
            cap_bytes,
            index,
        })
    }

    fn object_path(&self, alias: &str) -> PathBuf {
        self.dir.join(alias)
    }

    pub async fn size(&self) -> Result<u64> {
        self.index.cache_size(self.vault_id).await
    }

    /// Cached read; refreshes `last_accessed` on hit.
    pub async fn read(&self, alias: &str, path: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.object_path(alias)).await {
            Ok(data) => {
                self.index
                    .touch_cache_entry(self.vault_id, path, EntryKind::File)
                    .await?;
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Transient(format!("cache read '{alias}': {e}"))),
        }
    }

    /// Insert or refresh a cached object, then evict LRU entries until the
    /// cache fits the cap again.
    pub async fn write(&self, alias: &str, path: &str, data: &[u8]) -> Result<()> {
        let object_path = self.object_path(alias);
        let tmp = object_path.with_extension("part");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Transient(format!("cache write '{alias}': {e}")))?;
        tokio::fs::rename(&tmp, &object_path)
            .await
            .map_err(|e| Error::Transient(format!("cache commit '{alias}': {e}")))?;

        self.index
            .upsert_cache_entry(CacheEntry {
                vault_id: self.vault_id,
                path: path.to_string(),
                kind: EntryKind::File,
                base32_alias: alias.to_string(),
                size_bytes: data.len() as u64,
                last_accessed: Utc::now(),
            })
            .await?;

        self.evict_to_cap(path).await
    }

    pub async fn remove(&self, alias: &str, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(alias)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Transient(format!("cache remove '{alias}': {e}"))),
        }
        self.index
            .remove_cache_entry(self.vault_id, path, EntryKind::File)
            .await
    }

    /// Drop least-recently-used entries until `size <= cap`. The entry at
    /// `protect_path` (the one just written) is never evicted.
    async fn evict_to_cap(&self, protect_path: &str) -> Result<()> {
        if self.cap_bytes == 0 {
            return Ok(());
        }

        let mut size = self.index.cache_size(self.vault_id).await?;
        if size <= self.cap_bytes {
            return Ok(());
        }

        for victim in self.index.cache_lru(self.vault_id, usize::MAX).await? {
            if size <= self.cap_bytes {
                break;
            }
            if victim.path == protect_path {
                continue;
            }
            self.remove(&victim.base32_alias, &victim.path).await?;
            size = size.saturating_sub(victim.size_bytes);
            tracing::debug!(
                vault_id = self.vault_id,
                path = %victim.path,
                freed = victim.size_bytes,
                "evicted cache entry"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_store::MemoryStore;

    async fn cache(cap: u64) -> (LocalCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(1, dir.path(), cap, Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        (cache, dir)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (cache, _dir) = cache(0).await;
        cache.write("AAAA", "/a.txt", b"payload").await.unwrap();
        assert_eq!(cache.read("AAAA", "/a.txt").await.unwrap().unwrap(), b"payload");
        assert_eq!(cache.size().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        let (cache, _dir) = cache(0).await;
        assert!(cache.read("NOPE", "/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_at_cap() {
        let (cache, _dir) = cache(10).await;

        cache.write("A1", "/a", &[0u8; 6]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.write("B2", "/b", &[0u8; 6]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // Touch /a so /b becomes the LRU victim.
        cache.read("A1", "/a").await.unwrap();

        cache.write("C3", "/c", &[0u8; 6]).await.unwrap();

        assert!(cache.read("C3", "/c").await.unwrap().is_some());
        assert!(cache.read("B2", "/b").await.unwrap().is_none());
        assert!(cache.size().await.unwrap() <= 12);
    }

    #[tokio::test]
    async fn test_remove_clears_index() {
        let (cache, _dir) = cache(0).await;
        cache.write("A1", "/a", b"x").await.unwrap();
        cache.remove("A1", "/a").await.unwrap();
        assert!(cache.read("A1", "/a").await.unwrap().is_none());
        assert_eq!(cache.size().await.unwrap(), 0);
    }
}
