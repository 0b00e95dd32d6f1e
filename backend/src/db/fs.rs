// Filesystem metadata, trash and cache-index persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vaulthalla_core::types::{EntryId, KeyVersion, UserId, VaultId};
use vaulthalla_core::{Error, Result};
use vaulthalla_store::model::{
    CacheEntry, EntryKind, FileMeta, FsEntry, NewEntry, TrashedFile,
};
use vaulthalla_store::{alias, paths, CacheIndexStore, FsStore, TrashStore};

use super::{db_err, PgStore};

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: i64,
    vault_id: i32,
    parent_id: Option<i64>,
    name: String,
    path: String,
    inode: i64,
    mode: i32,
    owner_uid: i32,
    group_gid: i32,
    base32_alias: String,
    kind: String,
    created_by: i32,
    last_modified_by: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    size_bytes: Option<i64>,
    mime_type: Option<String>,
    content_hash: Option<String>,
    encryption_iv: Option<String>,
    encrypted_with_key_version: Option<i32>,
    quarantined: Option<bool>,
}

impl EntryRow {
    fn into_model(self) -> Result<FsEntry> {
        let kind = match self.kind.as_str() {
            "directory" => EntryKind::Directory,
            "file" => EntryKind::File,
            other => {
                return Err(Error::Corrupt(format!(
                    "fs entry {} carries unknown kind '{other}'",
                    self.id
                )))
            }
        };
        let file = match (kind, self.size_bytes) {
            (EntryKind::File, Some(size_bytes)) => Some(FileMeta {
                size_bytes: size_bytes as u64,
                mime_type: self.mime_type.unwrap_or_default(),
                content_hash: self.content_hash.unwrap_or_default(),
                encryption_iv: self.encryption_iv.unwrap_or_default(),
                encrypted_with_key_version: self.encrypted_with_key_version.unwrap_or(0) as u32,
                quarantined: self.quarantined.unwrap_or(false),
            }),
            _ => None,
        };
        Ok(FsEntry {
            id: self.id as u64,
            vault_id: self.vault_id as u32,
            parent_id: self.parent_id.map(|p| p as u64),
            name: self.name,
            path: self.path,
            inode: self.inode as u64,
            mode: self.mode as u32,
            owner_uid: self.owner_uid as u32,
            group_gid: self.group_gid as u32,
            base32_alias: self.base32_alias,
            kind,
            created_by: self.created_by as u32,
            last_modified_by: self.last_modified_by as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
            file,
        })
    }
}

const ENTRY_SELECT: &str = "SELECT e.id, e.vault_id, e.parent_id, e.name, e.path, e.inode, \
     e.mode, e.owner_uid, e.group_gid, e.base32_alias, e.kind, e.created_by, \
     e.last_modified_by, e.created_at, e.updated_at, \
     f.size_bytes, f.mime_type, f.content_hash, f.encryption_iv, \
     f.encrypted_with_key_version, f.quarantined \
     FROM fs_entry e LEFT JOIN files f ON f.entry_id = e.id";

impl PgStore {
    async fn insert_entry_tx(&self, draft: &NewEntry) -> Result<FsEntry> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin insert entry", e))?;

        let inode: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(inode), 0) + 1 FROM fs_entry WHERE vault_id = $1")
                .bind(draft.vault_id as i32)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| db_err("allocate inode", e))?;

        let kind = match draft.kind {
            EntryKind::Directory => "directory",
            EntryKind::File => "file",
        };
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO fs_entry (vault_id, parent_id, name, path, inode, mode, owner_uid, \
             group_gid, base32_alias, kind, created_by, last_modified_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) RETURNING id",
        )
        .bind(draft.vault_id as i32)
        .bind(draft.parent_id.map(|p| p as i64))
        .bind(&draft.name)
        .bind(&draft.path)
        .bind(inode)
        .bind(draft.mode as i32)
        .bind(draft.owner_uid as i32)
        .bind(draft.group_gid as i32)
        .bind(alias::generate())
        .bind(kind)
        .bind(draft.created_by as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_err("insert entry", e))?;

        if let Some(meta) = &draft.file {
            sqlx::query(
                "INSERT INTO files (entry_id, size_bytes, mime_type, content_hash, \
                 encryption_iv, encrypted_with_key_version, quarantined) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(id)
            .bind(meta.size_bytes as i64)
            .bind(&meta.mime_type)
            .bind(&meta.content_hash)
            .bind(&meta.encryption_iv)
            .bind(meta.encrypted_with_key_version as i32)
            .bind(meta.quarantined)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("insert file meta", e))?;
        }

        tx.commit().await.map_err(|e| db_err("commit insert entry", e))?;

        self.entry_by_id(id as u64)
            .await?
            .ok_or_else(|| Error::Internal("entry vanished right after insert".into()))
    }
}

#[async_trait]
impl FsStore for PgStore {
    async fn ensure_root(&self, vault_id: VaultId, actor: UserId) -> Result<FsEntry> {
        if let Some(root) = self.entry_by_path(vault_id, "/").await? {
            return Ok(root);
        }
        self.insert_entry_tx(&NewEntry {
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
        .await
    }

    async fn entry_by_path(&self, vault_id: VaultId, path: &str) -> Result<Option<FsEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "{ENTRY_SELECT} WHERE e.vault_id = $1 AND e.path = $2"
        ))
        .bind(vault_id as i32)
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch entry by path", e))?;
        row.map(EntryRow::into_model).transpose()
    }

    async fn entry_by_id(&self, id: EntryId) -> Result<Option<FsEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!("{ENTRY_SELECT} WHERE e.id = $1"))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("fetch entry", e))?;
        row.map(EntryRow::into_model).transpose()
    }

    async fn children(&self, parent_id: EntryId) -> Result<Vec<FsEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "{ENTRY_SELECT} WHERE e.parent_id = $1 ORDER BY e.name"
        ))
        .bind(parent_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list children", e))?;
        rows.into_iter().map(EntryRow::into_model).collect()
    }

    async fn subtree(&self, vault_id: VaultId, prefix: &str) -> Result<Vec<FsEntry>> {
        let like = if prefix == "/" {
            "/%".to_string()
        } else {
            format!("{prefix}/%")
        };
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "{ENTRY_SELECT} WHERE e.vault_id = $1 AND e.path LIKE $2 ORDER BY e.path"
        ))
        .bind(vault_id as i32)
        .bind(like)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list subtree", e))?;
        rows.into_iter().map(EntryRow::into_model).collect()
    }

    async fn insert_entry(&self, draft: NewEntry) -> Result<FsEntry> {
        self.insert_entry_tx(&draft).await
    }

    async fn update_file_meta(
        &self,
        id: EntryId,
        meta: FileMeta,
        modified_by: UserId,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin update file meta", e))?;

        sqlx::query(
            "INSERT INTO files (entry_id, size_bytes, mime_type, content_hash, encryption_iv, \
             encrypted_with_key_version, quarantined) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (entry_id) DO UPDATE SET size_bytes = EXCLUDED.size_bytes, \
             mime_type = EXCLUDED.mime_type, content_hash = EXCLUDED.content_hash, \
             encryption_iv = EXCLUDED.encryption_iv, \
             encrypted_with_key_version = EXCLUDED.encrypted_with_key_version, \
             quarantined = EXCLUDED.quarantined",
        )
        .bind(id as i64)
        .bind(meta.size_bytes as i64)
        .bind(&meta.mime_type)
        .bind(&meta.content_hash)
        .bind(&meta.encryption_iv)
        .bind(meta.encrypted_with_key_version as i32)
        .bind(meta.quarantined)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("upsert file meta", e))?;

        sqlx::query("UPDATE fs_entry SET last_modified_by = $2, updated_at = NOW() WHERE id = $1")
            .bind(id as i64)
            .bind(modified_by as i32)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("touch entry", e))?;

        tx.commit().await.map_err(|e| db_err("commit update file meta", e))?;
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin move entry", e))?;

        let entry = sqlx::query_as::<_, EntryRow>(&format!(
            "{ENTRY_SELECT} WHERE e.id = $1 FOR UPDATE OF e"
        ))
        .bind(id as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_err("lock moved entry", e))?
        .ok_or_else(|| Error::NotFound(format!("entry {id}")))?
        .into_model()?;
        if entry.parent_id.is_none() {
            return Err(Error::Validation("cannot move the vault root".into()));
        }

        let parent = sqlx::query_as::<_, EntryRow>(&format!("{ENTRY_SELECT} WHERE e.id = $1"))
            .bind(new_parent as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("fetch new parent", e))?
            .ok_or_else(|| Error::NotFound(format!("parent entry {new_parent}")))?
            .into_model()?;
        if parent.kind != EntryKind::Directory {
            return Err(Error::Validation(format!("'{}' is not a directory", parent.path)));
        }
        if paths::is_within(&entry.path, &parent.path) {
            return Err(Error::Validation(format!(
                "cannot move '{}' beneath itself",
                entry.path
            )));
        }

        let new_path = paths::join(&parent.path, new_name);

        sqlx::query(
            "UPDATE fs_entry SET parent_id = $2, name = $3, last_modified_by = $4, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(id as i64)
        .bind(new_parent as i64)
        .bind(new_name)
        .bind(actor as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("move entry", e))?;

        // Rewrite the subtree's paths in the same transaction.
        sqlx::query(
            "UPDATE fs_entry SET path = $3 || substr(path, length($2) + 1), updated_at = NOW() \
             WHERE vault_id = $1 AND (path = $2 OR path LIKE $2 || '/%')",
        )
        .bind(entry.vault_id as i32)
        .bind(&entry.path)
        .bind(&new_path)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("rewrite descendant paths", e))?;

        tx.commit().await.map_err(|e| db_err("commit move entry", e))?;

        self.entry_by_id(id)
            .await?
            .ok_or_else(|| Error::Internal("entry vanished during move".into()))
    }

    async fn remove_entry(&self, id: EntryId) -> Result<()> {
        let entry = self
            .entry_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;

        // ON DELETE CASCADE on parent_id clears the subtree.
        sqlx::query("DELETE FROM fs_entry WHERE id = $1")
            .bind(entry.id as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("remove entry", e))?;
        Ok(())
    }

    async fn touch(&self, id: EntryId, actor: UserId) -> Result<()> {
        sqlx::query("UPDATE fs_entry SET last_modified_by = $2, updated_at = NOW() WHERE id = $1")
            .bind(id as i64)
            .bind(actor as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("touch entry", e))?;
        Ok(())
    }

    async fn vault_size(&self, vault_id: VaultId) -> Result<u64> {
        let size: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(f.size_bytes), 0) FROM files f \
             JOIN fs_entry e ON e.id = f.entry_id WHERE e.vault_id = $1",
        )
        .bind(vault_id as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("compute vault size", e))?;
        Ok(size.max(0) as u64)
    }

    async fn entries_with_key_version(
        &self,
        vault_id: VaultId,
        version: KeyVersion,
    ) -> Result<Vec<FsEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "{ENTRY_SELECT} WHERE e.vault_id = $1 AND f.encrypted_with_key_version = $2 \
             ORDER BY e.path"
        ))
        .bind(vault_id as i32)
        .bind(version as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list entries by key version", e))?;
        rows.into_iter().map(EntryRow::into_model).collect()
    }

    async fn set_quarantined(&self, id: EntryId, quarantined: bool) -> Result<()> {
        sqlx::query("UPDATE files SET quarantined = $2 WHERE entry_id = $1")
            .bind(id as i64)
            .bind(quarantined)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("set quarantined", e))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TrashRow {
    id: i64,
    vault_id: i32,
    base32_alias: String,
    backing_path: String,
    trashed_at: DateTime<Utc>,
    trashed_by: i32,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<TrashRow> for TrashedFile {
    fn from(row: TrashRow) -> Self {
        TrashedFile {
            id: row.id as u64,
            vault_id: row.vault_id as u32,
            base32_alias: row.base32_alias,
            backing_path: row.backing_path,
            trashed_at: row.trashed_at,
            trashed_by: row.trashed_by as u32,
            deleted_at: row.deleted_at,
        }
    }
}

#[async_trait]
impl TrashStore for PgStore {
    async fn trash_file(
        &self,
        vault_id: VaultId,
        base32_alias: &str,
        backing_path: &str,
        trashed_by: UserId,
    ) -> Result<TrashedFile> {
        let row = sqlx::query_as::<_, TrashRow>(
            "INSERT INTO files_trashed (vault_id, base32_alias, backing_path, trashed_by) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, vault_id, base32_alias, backing_path, trashed_at, trashed_by, deleted_at",
        )
        .bind(vault_id as i32)
        .bind(base32_alias)
        .bind(backing_path)
        .bind(trashed_by as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("trash file", e))?;
        Ok(row.into())
    }

    async fn trashed_files(&self, vault_id: VaultId) -> Result<Vec<TrashedFile>> {
        let rows = sqlx::query_as::<_, TrashRow>(
            "SELECT id, vault_id, base32_alias, backing_path, trashed_at, trashed_by, deleted_at \
             FROM files_trashed WHERE vault_id = $1 ORDER BY id",
        )
        .bind(vault_id as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list trashed files", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn trashed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TrashedFile>> {
        let rows = sqlx::query_as::<_, TrashRow>(
            "SELECT id, vault_id, base32_alias, backing_path, trashed_at, trashed_by, deleted_at \
             FROM files_trashed WHERE deleted_at IS NULL AND trashed_at < $1 ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list reclaimable trash", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_trash_deleted(&self, id: u64) -> Result<()> {
        sqlx::query("UPDATE files_trashed SET deleted_at = NOW() WHERE id = $1")
            .bind(id as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("mark trash deleted", e))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    vault_id: i32,
    path: String,
    kind: String,
    base32_alias: String,
    size_bytes: i64,
    last_accessed: DateTime<Utc>,
}

impl CacheRow {
    fn into_model(self) -> Result<CacheEntry> {
        let kind = match self.kind.as_str() {
            "directory" => EntryKind::Directory,
            "file" => EntryKind::File,
            other => return Err(Error::Corrupt(format!("cache row carries unknown kind '{other}'"))),
        };
        Ok(CacheEntry {
            vault_id: self.vault_id as u32,
            path: self.path,
            kind,
            base32_alias: self.base32_alias,
            size_bytes: self.size_bytes as u64,
            last_accessed: self.last_accessed,
        })
    }
}

fn kind_token(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Directory => "directory",
        EntryKind::File => "file",
    }
}

#[async_trait]
impl CacheIndexStore for PgStore {
    async fn upsert_cache_entry(&self, entry: CacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_index (vault_id, path, kind, base32_alias, size_bytes, last_accessed) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (vault_id, path, kind) DO UPDATE SET \
             base32_alias = EXCLUDED.base32_alias, size_bytes = EXCLUDED.size_bytes, \
             last_accessed = EXCLUDED.last_accessed",
        )
        .bind(entry.vault_id as i32)
        .bind(&entry.path)
        .bind(kind_token(entry.kind))
        .bind(&entry.base32_alias)
        .bind(entry.size_bytes as i64)
        .bind(entry.last_accessed)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("upsert cache entry", e))?;
        Ok(())
    }

    async fn cache_entry(
        &self,
        vault_id: VaultId,
        path: &str,
        kind: EntryKind,
    ) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(
            "SELECT vault_id, path, kind, base32_alias, size_bytes, last_accessed \
             FROM cache_index WHERE vault_id = $1 AND path = $2 AND kind = $3",
        )
        .bind(vault_id as i32)
        .bind(path)
        .bind(kind_token(kind))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch cache entry", e))?;
        row.map(CacheRow::into_model).transpose()
    }

    async fn touch_cache_entry(
        &self,
        vault_id: VaultId,
        path: &str,
        kind: EntryKind,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE cache_index SET last_accessed = NOW() \
             WHERE vault_id = $1 AND path = $2 AND kind = $3",
        )
        .bind(vault_id as i32)
        .bind(path)
        .bind(kind_token(kind))
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("touch cache entry", e))?;
        Ok(())
    }

    async fn cache_size(&self, vault_id: VaultId) -> Result<u64> {
        let size: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_index WHERE vault_id = $1",
        )
        .bind(vault_id as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("compute cache size", e))?;
        Ok(size.max(0) as u64)
    }

    async fn cache_lru(&self, vault_id: VaultId, limit: usize) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query_as::<_, CacheRow>(
            "SELECT vault_id, path, kind, base32_alias, size_bytes, last_accessed \
             FROM cache_index WHERE vault_id = $1 ORDER BY last_accessed LIMIT $2",
        )
        .bind(vault_id as i32)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list cache lru", e))?;
        rows.into_iter().map(CacheRow::into_model).collect()
    }

    async fn cache_entries(&self, vault_id: VaultId) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query_as::<_, CacheRow>(
            "SELECT vault_id, path, kind, base32_alias, size_bytes, last_accessed \
             FROM cache_index WHERE vault_id = $1 ORDER BY path",
        )
        .bind(vault_id as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list cache entries", e))?;
        rows.into_iter().map(CacheRow::into_model).collect()
    }

    async fn remove_cache_entry(
        &self,
        vault_id: VaultId,
        path: &str,
        kind: EntryKind,
    ) -> Result<()> {
        sqlx::query("DELETE FROM cache_index WHERE vault_id = $1 AND path = $2 AND kind = $3")
            .bind(vault_id as i32)
            .bind(path)
            .bind(kind_token(kind))
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("remove cache entry", e))?;
        Ok(())
    }
}
