//! Local-disk backend
//!
//! Objects live flat beneath the vault mount point, named by their backing
//! key. Writes go through a temp file + rename so readers never observe a
//! torn object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vaulthalla_core::{Error, Result};

use crate::backend::{ObjectMeta, VaultBackend};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::Configuration(format!("cannot create mount point {root:?}: {e}")))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(Error::Validation(format!("invalid backing key '{key}'")));
        }
        Ok(self.root.join(key))
    }

    fn io_err(context: &str, err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(context.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Error::Unauthorized(format!("{context}: permission denied"))
            }
            _ => Error::Transient(format!("{context}: {err}")),
        }
    }
}

#[async_trait]
impl VaultBackend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::io_err(&format!("read object '{key}'"), e))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(key)?;
        let tmp = path.with_extension("part");

        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Self::io_err(&format!("write object '{key}'"), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_err(&format!("commit object '{key}'"), e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&format!("delete object '{key}'"), e)),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = self.object_path(from)?;
        let dst = self.object_path(to)?;
        tokio::fs::copy(&src, &dst)
            .await
            .map(|_| ())
            .map_err(|e| Self::io_err(&format!("copy object '{from}' -> '{to}'"), e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| Self::io_err("list objects", e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Self::io_err("list objects", e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(prefix) || name.ends_with(".part") {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| Self::io_err(&format!("stat object '{name}'"), e))?;
            if !meta.is_file() {
                continue;
            }
            entries.push(ObjectMeta {
                key: name,
                size: meta.len(),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn free_space(&self) -> Result<Option<u64>> {
        // The filesystem does not expose this portably through std; the
        // engine falls back to quota accounting.
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> (LocalBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("vault")).await.unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (backend, _dir) = backend().await;
        backend.put("ABCD1234", b"payload").await.unwrap();
        assert_eq!(backend.get("ABCD1234").await.unwrap(), b"payload");
        assert!(backend.exists("ABCD1234").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (backend, _dir) = backend().await;
        assert!(matches!(
            backend.get("MISSING").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(!backend.exists("MISSING").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (backend, _dir) = backend().await;
        backend.put("X", b"1").await.unwrap();
        backend.delete("X").await.unwrap();
        backend.delete("X").await.unwrap();
        assert!(!backend.exists("X").await.unwrap());
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let (backend, _dir) = backend().await;
        assert!(backend.get("../etc/passwd").await.is_err());
        assert!(backend.put("a/b", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_list_skips_partial_writes() {
        let (backend, _dir) = backend().await;
        backend.put("AAA", b"1").await.unwrap();
        backend.put("AAB", b"22").await.unwrap();
        tokio::fs::write(backend.root().join("AAC.part"), b"torn")
            .await
            .unwrap();

        let listed = backend.list("AA").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["AAA", "AAB"]);
        assert_eq!(listed[1].size, 2);
    }

    #[tokio::test]
    async fn test_copy_duplicates_object() {
        let (backend, _dir) = backend().await;
        backend.put("SRC", b"data").await.unwrap();
        backend.copy("SRC", "DST").await.unwrap();
        assert_eq!(backend.get("DST").await.unwrap(), b"data");
        assert_eq!(backend.get("SRC").await.unwrap(), b"data");
    }
}
