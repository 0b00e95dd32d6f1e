// Sync event history, internal secrets and waivers

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vaulthalla_core::types::{SyncOutcome, SyncTrigger, VaultId};
use vaulthalla_core::{Error, Result};
use vaulthalla_store::model::{InternalSecret, SyncEvent, Waiver};
use vaulthalla_store::{SecretStore, SyncStore, WaiverStore};

use super::{db_err, PgStore};

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    vault_id: i32,
    trigger_kind: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    outcome: Option<String>,
    error: Option<String>,
}

impl EventRow {
    fn into_model(self) -> Result<SyncEvent> {
        let trigger = match self.trigger_kind.as_str() {
            "schedule" => SyncTrigger::Schedule,
            "webhook" => SyncTrigger::Webhook,
            "manual" => SyncTrigger::Manual,
            "startup" => SyncTrigger::Startup,
            other => {
                return Err(Error::Corrupt(format!(
                    "sync event carries unknown trigger '{other}'"
                )))
            }
        };
        let outcome = match self.outcome.as_deref() {
            None => None,
            Some("success") => Some(SyncOutcome::Success),
            Some("failed") => Some(SyncOutcome::Failed),
            Some("interrupted") => Some(SyncOutcome::Interrupted),
            Some("suspended") => Some(SyncOutcome::Suspended),
            Some(other) => {
                return Err(Error::Corrupt(format!(
                    "sync event carries unknown outcome '{other}'"
                )))
            }
        };
        Ok(SyncEvent {
            id: self.id as u64,
            vault_id: self.vault_id as u32,
            trigger,
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome,
            error: self.error,
        })
    }
}

fn outcome_token(outcome: SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Success => "success",
        SyncOutcome::Failed => "failed",
        SyncOutcome::Interrupted => "interrupted",
        SyncOutcome::Suspended => "suspended",
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn start_sync_event(&self, vault_id: VaultId, trigger: SyncTrigger) -> Result<SyncEvent> {
        let row = sqlx::query_as::<_, EventRow>(
            "INSERT INTO sync_events (vault_id, trigger_kind) VALUES ($1, $2) \
             RETURNING id, vault_id, trigger_kind, started_at, finished_at, outcome, error",
        )
        .bind(vault_id as i32)
        .bind(trigger.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("start sync event", e))?;
        row.into_model()
    }

    async fn finish_sync_event(
        &self,
        id: u64,
        outcome: SyncOutcome,
        error: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_events SET finished_at = NOW(), outcome = $2, error = $3 WHERE id = $1",
        )
        .bind(id as i64)
        .bind(outcome_token(outcome))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("finish sync event", e))?;
        Ok(())
    }

    async fn sync_events(&self, vault_id: VaultId, limit: usize) -> Result<Vec<SyncEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, vault_id, trigger_kind, started_at, finished_at, outcome, error \
             FROM sync_events WHERE vault_id = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(vault_id as i32)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list sync events", e))?;
        rows.into_iter().map(EventRow::into_model).collect()
    }

    async fn last_success_at(&self, vault_id: VaultId) -> Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            "SELECT MAX(finished_at) FROM sync_events \
             WHERE vault_id = $1 AND outcome = 'success'",
        )
        .bind(vault_id as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("fetch last success", e))
    }

    async fn prune_sync_events(&self, cutoff: DateTime<Utc>, max_keep: usize) -> Result<u64> {
        let aged = sqlx::query("DELETE FROM sync_events WHERE started_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("prune aged sync events", e))?
            .rows_affected();

        // Cap per vault, newest kept.
        let capped = sqlx::query(
            "DELETE FROM sync_events WHERE id IN ( \
               SELECT id FROM ( \
                 SELECT id, ROW_NUMBER() OVER (PARTITION BY vault_id ORDER BY id DESC) AS rn \
                 FROM sync_events \
               ) ranked WHERE rn > $1 \
             )",
        )
        .bind(max_keep.min(i64::MAX as usize) as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("prune excess sync events", e))?
        .rows_affected();

        Ok(aged + capped)
    }
}

#[async_trait]
impl SecretStore for PgStore {
    async fn secret(&self, key: &str) -> Result<Option<InternalSecret>> {
        #[derive(sqlx::FromRow)]
        struct SecretRow {
            key: String,
            wrapped_value: Vec<u8>,
            iv: Vec<u8>,
            created_at: DateTime<Utc>,
        }
        let row = sqlx::query_as::<_, SecretRow>(
            "SELECT key, wrapped_value, iv, created_at FROM internal_secrets WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch internal secret", e))?;
        Ok(row.map(|r| InternalSecret {
            key: r.key,
            wrapped_value: r.wrapped_value,
            iv: r.iv,
            created_at: r.created_at,
        }))
    }

    async fn put_secret(&self, secret: InternalSecret) -> Result<()> {
        sqlx::query(
            "INSERT INTO internal_secrets (key, wrapped_value, iv, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (key) DO UPDATE SET wrapped_value = EXCLUDED.wrapped_value, \
             iv = EXCLUDED.iv",
        )
        .bind(&secret.key)
        .bind(&secret.wrapped_value)
        .bind(&secret.iv)
        .bind(secret.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("put internal secret", e))?;
        Ok(())
    }
}

#[async_trait]
impl WaiverStore for PgStore {
    async fn append_waiver(&self, waiver: Waiver) -> Result<Waiver> {
        #[derive(sqlx::FromRow)]
        struct WaiverRow {
            id: i64,
            created_at: DateTime<Utc>,
        }
        let row = sqlx::query_as::<_, WaiverRow>(
            "INSERT INTO waivers (vault_id, user_id, api_key_id, encrypt_upstream, waiver_text, overriding_role) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id, created_at",
        )
        .bind(waiver.vault_id as i32)
        .bind(waiver.user_id as i32)
        .bind(waiver.api_key_id as i32)
        .bind(waiver.encrypt_upstream)
        .bind(&waiver.waiver_text)
        .bind(waiver.overriding_role.map(|r| r as i32))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("append waiver", e))?;

        Ok(Waiver {
            id: row.id as u64,
            created_at: row.created_at,
            ..waiver
        })
    }

    async fn waivers_for_vault(&self, vault_id: VaultId) -> Result<Vec<Waiver>> {
        #[derive(sqlx::FromRow)]
        struct WaiverRow {
            id: i64,
            vault_id: i32,
            user_id: i32,
            api_key_id: i32,
            encrypt_upstream: bool,
            waiver_text: String,
            overriding_role: Option<i32>,
            created_at: DateTime<Utc>,
        }
        let rows = sqlx::query_as::<_, WaiverRow>(
            "SELECT id, vault_id, user_id, api_key_id, encrypt_upstream, waiver_text, \
             overriding_role, created_at FROM waivers WHERE vault_id = $1 ORDER BY id",
        )
        .bind(vault_id as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list waivers", e))?;

        Ok(rows
            .into_iter()
            .map(|r| Waiver {
                id: r.id as u64,
                vault_id: r.vault_id as u32,
                user_id: r.user_id as u32,
                api_key_id: r.api_key_id as u32,
                encrypt_upstream: r.encrypt_upstream,
                waiver_text: r.waiver_text,
                overriding_role: r.overriding_role.map(|x| x as u32),
                created_at: r.created_at,
            })
            .collect())
    }
}
