// Vault, data-key and API-key persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vaulthalla_core::types::{ApiKeyId, KeyVersion, UserId, VaultId};
use vaulthalla_core::{Error, Result};
use vaulthalla_store::model::{
    ApiKey, NewApiKey, NewVault, S3Settings, SyncPolicy, TrashedVaultKey, Vault, VaultKey,
};
use vaulthalla_store::{ApiKeyStore, VaultKeyStore, VaultStore};

use super::{db_err, PgStore};

#[derive(sqlx::FromRow)]
struct VaultRow {
    id: i32,
    name: String,
    owner_id: i32,
    vault_type: String,
    mount_point: String,
    quota_bytes: i64,
    description: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    api_key_id: Option<i32>,
    bucket: Option<String>,
    encrypt_upstream: Option<bool>,
}

impl VaultRow {
    fn into_model(self) -> Result<Vault> {
        let vault_type = self.vault_type.parse()?;
        let s3 = match (self.api_key_id, self.bucket, self.encrypt_upstream) {
            (Some(api_key_id), Some(bucket), Some(encrypt_upstream)) => Some(S3Settings {
                api_key_id: api_key_id as u32,
                bucket,
                encrypt_upstream,
            }),
            _ => None,
        };
        Ok(Vault {
            id: self.id as u32,
            name: self.name,
            owner_id: self.owner_id as u32,
            vault_type,
            mount_point: self.mount_point,
            quota_bytes: self.quota_bytes as u64,
            description: self.description,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
            s3,
        })
    }
}

const VAULT_SELECT: &str = "SELECT v.id, v.name, v.owner_id, v.vault_type, v.mount_point, \
     v.quota_bytes, v.description, v.is_active, v.created_at, v.updated_at, \
     s.api_key_id, s.bucket, s.encrypt_upstream \
     FROM vaults v LEFT JOIN s3 s ON s.vault_id = v.id";

#[async_trait]
impl VaultStore for PgStore {
    async fn create_vault(&self, draft: NewVault) -> Result<Vault> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin create vault", e))?;

        let id: i32 = sqlx::query_scalar(
            "INSERT INTO vaults (name, owner_id, vault_type, mount_point, quota_bytes, description) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&draft.name)
        .bind(draft.owner_id as i32)
        .bind(draft.vault_type.to_string())
        .bind(&draft.mount_point)
        .bind(draft.quota_bytes as i64)
        .bind(&draft.description)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_err("create vault", e))?;

        if let Some(s3) = &draft.s3 {
            sqlx::query(
                "INSERT INTO s3 (vault_id, api_key_id, bucket, encrypt_upstream) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(s3.api_key_id as i32)
            .bind(&s3.bucket)
            .bind(s3.encrypt_upstream)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("create vault s3 settings", e))?;
        }

        tx.commit().await.map_err(|e| db_err("commit create vault", e))?;

        self.vault(id as u32)
            .await?
            .ok_or_else(|| Error::Internal("vault vanished right after creation".into()))
    }

    async fn vault(&self, id: VaultId) -> Result<Option<Vault>> {
        let row = sqlx::query_as::<_, VaultRow>(&format!("{VAULT_SELECT} WHERE v.id = $1"))
            .bind(id as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("fetch vault", e))?;
        row.map(VaultRow::into_model).transpose()
    }

    async fn vault_by_name(&self, owner_id: UserId, name: &str) -> Result<Option<Vault>> {
        let row = sqlx::query_as::<_, VaultRow>(&format!(
            "{VAULT_SELECT} WHERE v.owner_id = $1 AND v.name = $2"
        ))
        .bind(owner_id as i32)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch vault by name", e))?;
        row.map(VaultRow::into_model).transpose()
    }

    async fn list_vaults(&self) -> Result<Vec<Vault>> {
        let rows = sqlx::query_as::<_, VaultRow>(&format!("{VAULT_SELECT} ORDER BY v.id"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list vaults", e))?;
        rows.into_iter().map(VaultRow::into_model).collect()
    }

    async fn list_active_vaults(&self) -> Result<Vec<Vault>> {
        let rows = sqlx::query_as::<_, VaultRow>(&format!(
            "{VAULT_SELECT} WHERE v.is_active ORDER BY v.id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list active vaults", e))?;
        rows.into_iter().map(VaultRow::into_model).collect()
    }

    async fn update_vault(&self, vault: &Vault) -> Result<()> {
        sqlx::query(
            "UPDATE vaults SET name = $2, quota_bytes = $3, description = $4, is_active = $5, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(vault.id as i32)
        .bind(&vault.name)
        .bind(vault.quota_bytes as i64)
        .bind(&vault.description)
        .bind(vault.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("update vault", e))?;

        if let Some(s3) = &vault.s3 {
            sqlx::query("UPDATE s3 SET encrypt_upstream = $2, bucket = $3 WHERE vault_id = $1")
                .bind(vault.id as i32)
                .bind(s3.encrypt_upstream)
                .bind(&s3.bucket)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("update vault s3 settings", e))?;
        }
        Ok(())
    }

    async fn set_vault_active(&self, id: VaultId, active: bool) -> Result<()> {
        sqlx::query("UPDATE vaults SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id as i32)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("set vault active", e))?;
        Ok(())
    }

    async fn sync_policy(&self, vault_id: VaultId) -> Result<Option<SyncPolicy>> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT policy FROM sync WHERE vault_id = $1")
                .bind(vault_id as i32)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_err("fetch sync policy", e))?;
        value
            .map(|v| {
                serde_json::from_value(v)
                    .map_err(|e| Error::Corrupt(format!("stored sync policy is malformed: {e}")))
            })
            .transpose()
    }

    async fn update_sync_policy(&self, vault_id: VaultId, policy: SyncPolicy) -> Result<()> {
        let value = serde_json::to_value(&policy)
            .map_err(|e| Error::Internal(format!("sync policy serialization failed: {e}")))?;
        sqlx::query(
            "INSERT INTO sync (vault_id, policy) VALUES ($1, $2) \
             ON CONFLICT (vault_id) DO UPDATE SET policy = EXCLUDED.policy",
        )
        .bind(vault_id as i32)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("update sync policy", e))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    vault_id: i32,
    version: i32,
    wrapped_key: Vec<u8>,
    iv: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TrashedKeyRow {
    vault_id: i32,
    version: i32,
    wrapped_key: Vec<u8>,
    iv: Vec<u8>,
    created_at: DateTime<Utc>,
    trashed_at: DateTime<Utc>,
    rotation_completed_at: Option<DateTime<Utc>>,
}

impl From<TrashedKeyRow> for TrashedVaultKey {
    fn from(row: TrashedKeyRow) -> Self {
        TrashedVaultKey {
            vault_id: row.vault_id as u32,
            version: row.version as u32,
            wrapped_key: row.wrapped_key,
            iv: row.iv,
            created_at: row.created_at,
            trashed_at: row.trashed_at,
            rotation_completed_at: row.rotation_completed_at,
        }
    }
}

#[async_trait]
impl VaultKeyStore for PgStore {
    async fn insert_initial_key(&self, key: VaultKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO vault_keys (vault_id, version, wrapped_key, iv, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(key.vault_id as i32)
        .bind(key.version as i32)
        .bind(&key.wrapped_key)
        .bind(&key.iv)
        .bind(key.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("insert initial vault key", e))?;
        Ok(())
    }

    async fn active_key(&self, vault_id: VaultId) -> Result<Option<VaultKey>> {
        let row = sqlx::query_as::<_, KeyRow>(
            "SELECT vault_id, version, wrapped_key, iv, created_at \
             FROM vault_keys WHERE vault_id = $1",
        )
        .bind(vault_id as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch active key", e))?;
        Ok(row.map(|r| VaultKey {
            vault_id: r.vault_id as u32,
            version: r.version as u32,
            wrapped_key: r.wrapped_key,
            iv: r.iv,
            created_at: r.created_at,
        }))
    }

    async fn rotate_vault_key(
        &self,
        vault_id: VaultId,
        wrapped_key: Vec<u8>,
        iv: Vec<u8>,
    ) -> Result<KeyVersion> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin key rotation", e))?;

        let unfinished: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vault_keys_trashed \
             WHERE vault_id = $1 AND rotation_completed_at IS NULL",
        )
        .bind(vault_id as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_err("check rotation state", e))?;
        if unfinished > 0 {
            return Err(Error::Conflict(format!(
                "vault {vault_id} already has a rotation in progress"
            )));
        }

        let current = sqlx::query_as::<_, KeyRow>(
            "SELECT vault_id, version, wrapped_key, iv, created_at \
             FROM vault_keys WHERE vault_id = $1 FOR UPDATE",
        )
        .bind(vault_id as i32)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_err("lock active key", e))?
        .ok_or(Error::KeyMissing(vault_id))?;

        sqlx::query(
            "INSERT INTO vault_keys_trashed (vault_id, version, wrapped_key, iv, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(current.vault_id)
        .bind(current.version)
        .bind(&current.wrapped_key)
        .bind(&current.iv)
        .bind(current.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("trash superseded key", e))?;

        let new_version = current.version + 1;
        sqlx::query(
            "UPDATE vault_keys SET version = $2, wrapped_key = $3, iv = $4, created_at = NOW() \
             WHERE vault_id = $1",
        )
        .bind(vault_id as i32)
        .bind(new_version)
        .bind(&wrapped_key)
        .bind(&iv)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("install rotated key", e))?;

        tx.commit().await.map_err(|e| db_err("commit key rotation", e))?;
        Ok(new_version as u32)
    }

    async fn finish_vault_key_rotation(&self, vault_id: VaultId) -> Result<()> {
        sqlx::query(
            "UPDATE vault_keys_trashed SET rotation_completed_at = NOW() \
             WHERE vault_id = $1 AND rotation_completed_at IS NULL",
        )
        .bind(vault_id as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("finish key rotation", e))?;
        Ok(())
    }

    async fn rotation_in_progress(&self, vault_id: VaultId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vault_keys_trashed \
             WHERE vault_id = $1 AND rotation_completed_at IS NULL",
        )
        .bind(vault_id as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("check rotation in progress", e))?;
        Ok(count > 0)
    }

    async fn rotation_old_key(&self, vault_id: VaultId) -> Result<Option<TrashedVaultKey>> {
        let row = sqlx::query_as::<_, TrashedKeyRow>(
            "SELECT vault_id, version, wrapped_key, iv, created_at, trashed_at, rotation_completed_at \
             FROM vault_keys_trashed \
             WHERE vault_id = $1 AND rotation_completed_at IS NULL \
             ORDER BY version DESC LIMIT 1",
        )
        .bind(vault_id as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch rotation old key", e))?;
        Ok(row.map(Into::into))
    }

    async fn trashed_keys(&self, vault_id: VaultId) -> Result<Vec<TrashedVaultKey>> {
        let rows = sqlx::query_as::<_, TrashedKeyRow>(
            "SELECT vault_id, version, wrapped_key, iv, created_at, trashed_at, rotation_completed_at \
             FROM vault_keys_trashed WHERE vault_id = $1 ORDER BY version",
        )
        .bind(vault_id as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list trashed keys", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn purge_trashed_key(&self, vault_id: VaultId, version: KeyVersion) -> Result<()> {
        sqlx::query("DELETE FROM vault_keys_trashed WHERE vault_id = $1 AND version = $2")
            .bind(vault_id as i32)
            .bind(version as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("purge trashed key", e))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: i32,
    user_id: i32,
    name: String,
    provider: String,
    access_key: String,
    wrapped_secret: Vec<u8>,
    iv: Vec<u8>,
    region: String,
    endpoint: Option<String>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        ApiKey {
            id: row.id as u32,
            user_id: row.user_id as u32,
            name: row.name,
            provider: row.provider,
            access_key: row.access_key,
            wrapped_secret: row.wrapped_secret,
            iv: row.iv,
            region: row.region,
            endpoint: row.endpoint,
        }
    }
}

const API_KEY_COLUMNS: &str =
    "id, user_id, name, provider, access_key, wrapped_secret, iv, region, endpoint";

#[async_trait]
impl ApiKeyStore for PgStore {
    async fn create_api_key(&self, draft: NewApiKey) -> Result<ApiKey> {
        let row = sqlx::query_as::<_, ApiKeyRow>(&format!(
            "INSERT INTO api_keys (user_id, name, provider, access_key, wrapped_secret, iv, region, endpoint) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {API_KEY_COLUMNS}"
        ))
        .bind(draft.user_id as i32)
        .bind(&draft.name)
        .bind(&draft.provider)
        .bind(&draft.access_key)
        .bind(&draft.wrapped_secret)
        .bind(&draft.iv)
        .bind(&draft.region)
        .bind(&draft.endpoint)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("create api key", e))?;
        Ok(row.into())
    }

    async fn api_key(&self, id: ApiKeyId) -> Result<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = $1"
        ))
        .bind(id as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch api key", e))?;
        Ok(row.map(Into::into))
    }

    async fn api_keys_for_user(&self, user_id: UserId) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE user_id = $1 ORDER BY id"
        ))
        .bind(user_id as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list api keys", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_api_key(&self, id: ApiKeyId) -> Result<()> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(id as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete api key", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("api key {id}")));
        }
        Ok(())
    }
}
