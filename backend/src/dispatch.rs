// Request dispatcher
//
// The typed front-end envelope: every inbound frame carries
// `{command, token?, payload, request_id}` and gets back
// `{command: <command>.response, request_id, status, data?, error?}`.
// Commands whose name does not begin with `auth` require a valid access
// token. Every error kind maps to an envelope; stack traces never leak.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use vaulthalla_core::types::{SyncTrigger, VaultId};
use vaulthalla_core::{Error, Result};
use vaulthalla_rbac::{build_snapshot, evaluate, Operation};
use vaulthalla_store::model::User;
use vaulthalla_store::{SyncStore, VaultStore};

use crate::runtime::Runtime;

#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    pub command: String,
    pub token: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
    Unauthorized,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub command: String,
    pub request_id: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

pub struct Dispatcher {
    runtime: Arc<Runtime>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub async fn handle(&self, session_uuid: Uuid, envelope: RequestEnvelope) -> ResponseEnvelope {
        let command = envelope.command.clone();
        let request_id = envelope.request_id.clone();

        let result = self.route(session_uuid, envelope).await;
        let response_command = format!("{command}.response");

        match result {
            Ok(data) => ResponseEnvelope {
                command: response_command,
                request_id,
                status: Status::Ok,
                data: Some(data),
                error: None,
            },
            Err(err) => {
                match &err {
                    Error::Validation(_) | Error::NotFound(_) => {
                        tracing::debug!(command, error = %err, "request rejected")
                    }
                    Error::Forbidden(_) | Error::Unauthorized(_) => {
                        tracing::info!(command, error = %err, "request denied")
                    }
                    Error::Internal(_) | Error::Backend(_) | Error::Corrupt(_) => {
                        tracing::error!(command, error = %err, "request failed")
                    }
                    _ => tracing::warn!(command, error = %err, "request failed"),
                }

                let status = if matches!(err, Error::Unauthorized(_)) {
                    Status::Unauthorized
                } else {
                    Status::Error
                };
                // Internal detail stays in the logs.
                let message = match &err {
                    Error::Internal(_) => "internal error".to_string(),
                    other => other.to_string(),
                };
                ResponseEnvelope {
                    command: response_command,
                    request_id,
                    status,
                    data: None,
                    error: Some(ErrorBody {
                        code: err.code().to_string(),
                        message,
                    }),
                }
            }
        }
    }

    async fn route(&self, session_uuid: Uuid, envelope: RequestEnvelope) -> Result<Value> {
        if !envelope.command.starts_with("auth") {
            let token = envelope
                .token
                .as_deref()
                .ok_or_else(|| Error::Unauthorized("missing access token".into()))?;
            if !self.runtime.sessions.validate_access_token(token) {
                return Err(Error::Unauthorized("invalid or expired access token".into()));
            }
        }

        match envelope.command.as_str() {
            "auth.register" => self.auth_register(session_uuid, &envelope.payload).await,
            "auth.login" => self.auth_login(session_uuid, &envelope.payload).await,
            "auth.logout" => {
                self.runtime.sessions.invalidate(session_uuid).await?;
                Ok(json!({}))
            }

            "storage.put" => self.storage_put(&envelope).await,
            "storage.get" => self.storage_get(&envelope).await,
            "storage.list" => self.storage_list(&envelope).await,
            "storage.remove" => self.storage_remove(&envelope).await,
            "storage.move" => self.storage_move(&envelope).await,
            "storage.rename" => self.storage_rename(&envelope).await,
            "storage.copy" => self.storage_copy(&envelope).await,
            "storage.mkdir" => self.storage_mkdir(&envelope).await,
            "storage.stats" => self.storage_stats(&envelope).await,

            "vaults.list" => self.vaults_list(&envelope).await,
            "sync.run" => self.sync_run(&envelope).await,
            "sync.events" => self.sync_events(&envelope).await,
            "keys.rotate" => self.keys_rotate(&envelope).await,

            other => Err(Error::Validation(format!("unknown command '{other}'"))),
        }
    }

    fn field<'a>(payload: &'a Value, name: &str) -> Result<&'a str> {
        payload
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation(format!("payload field '{name}' is required")))
    }

    fn vault_id(payload: &Value) -> Result<VaultId> {
        payload
            .get("vault_id")
            .and_then(Value::as_u64)
            .map(|v| v as VaultId)
            .ok_or_else(|| Error::Validation("payload field 'vault_id' is required".into()))
    }

    /// Resolve the acting user for a token-bearing request.
    fn actor(&self, envelope: &RequestEnvelope) -> Result<Arc<User>> {
        let token = envelope
            .token
            .as_deref()
            .ok_or_else(|| Error::Unauthorized("missing access token".into()))?;
        self.runtime
            .sessions
            .find_by_access_token(token)
            .and_then(|client| client.user())
            .ok_or_else(|| Error::Unauthorized("session is not authenticated".into()))
    }

    async fn auth_register(&self, session_uuid: Uuid, payload: &Value) -> Result<Value> {
        let client = self
            .runtime
            .sessions
            .get_client(session_uuid)
            .ok_or_else(|| Error::Unauthorized("no open session".into()))?;

        let (user, access_token) = self
            .runtime
            .auth
            .register_user(
                Self::field(payload, "name")?,
                Self::field(payload, "email")?,
                Self::field(payload, "password")?,
                &client,
            )
            .await?;

        Ok(json!({
            "user": { "id": user.id, "name": user.name, "email": user.email },
            "access_token": access_token,
        }))
    }

    async fn auth_login(&self, session_uuid: Uuid, payload: &Value) -> Result<Value> {
        let client = self
            .runtime
            .sessions
            .get_client(session_uuid)
            .ok_or_else(|| Error::Unauthorized("no open session".into()))?;

        let (user, access_token) = self
            .runtime
            .auth
            .login_user(
                Self::field(payload, "email")?,
                Self::field(payload, "password")?,
                &client,
            )
            .await?;

        Ok(json!({
            "user": { "id": user.id, "name": user.name, "email": user.email },
            "access_token": access_token,
        }))
    }

    async fn engine(&self, payload: &Value) -> Result<Arc<vaulthalla_storage::StorageEngine>> {
        let vault_id = Self::vault_id(payload)?;
        self.runtime
            .engines
            .engine(vault_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("vault {vault_id} is not attached")))
    }

    async fn storage_put(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        let path = Self::field(&envelope.payload, "path")?;
        let content = BASE64
            .decode(Self::field(&envelope.payload, "content")?)
            .map_err(|_| Error::Validation("payload field 'content' must be base64".into()))?;

        let entry = engine.put(path, &content, &actor).await?;
        Ok(json!({ "entry": entry }))
    }

    async fn storage_get(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        let path = Self::field(&envelope.payload, "path")?;

        let plaintext = engine.get(path, &actor).await?;
        Ok(json!({ "content": BASE64.encode(plaintext) }))
    }

    async fn storage_list(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        let path = Self::field(&envelope.payload, "path")?;
        let recursive = envelope
            .payload
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let entries = engine.list(path, recursive, &actor).await?;
        Ok(json!({ "entries": entries }))
    }

    async fn storage_remove(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        engine
            .remove(Self::field(&envelope.payload, "path")?, &actor)
            .await?;
        Ok(json!({}))
    }

    async fn storage_move(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        let entry = engine
            .move_to(
                Self::field(&envelope.payload, "src")?,
                Self::field(&envelope.payload, "dst")?,
                &actor,
            )
            .await?;
        Ok(json!({ "entry": entry }))
    }

    async fn storage_rename(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        let entry = engine
            .rename(
                Self::field(&envelope.payload, "path")?,
                Self::field(&envelope.payload, "new_name")?,
                &actor,
            )
            .await?;
        Ok(json!({ "entry": entry }))
    }

    async fn storage_copy(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        let entry = engine
            .copy(
                Self::field(&envelope.payload, "src")?,
                Self::field(&envelope.payload, "dst")?,
                &actor,
            )
            .await?;
        Ok(json!({ "entry": entry }))
    }

    async fn storage_mkdir(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        let entry = engine
            .mkdir(Self::field(&envelope.payload, "path")?, &actor)
            .await?;
        Ok(json!({ "entry": entry }))
    }

    async fn storage_stats(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let _actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        Ok(json!({
            "vault_size": engine.vault_size().await?,
            "free_space": engine.free_space().await?,
            "cache_size": engine.cache_size().await?,
        }))
    }

    async fn vaults_list(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let vaults: Vec<_> = self
            .runtime
            .store
            .list_vaults()
            .await?
            .into_iter()
            .filter(|v| v.owner_id == actor.id)
            .collect();
        Ok(json!({ "vaults": vaults }))
    }

    async fn sync_run(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let engine = self.engine(&envelope.payload).await?;
        let vault_id = engine.vault_id();

        if actor.id != engine.vault().owner_id {
            let snapshot =
                build_snapshot(self.runtime.store.as_ref(), &actor, Some(vault_id)).await?;
            if !evaluate(&snapshot, Operation::Sync, "/").is_allowed() {
                return Err(Error::Forbidden(format!(
                    "user {} may not trigger sync for vault {vault_id}",
                    actor.name
                )));
            }
        }

        self.runtime.sync.run_now(vault_id, SyncTrigger::Manual).await?;
        Ok(json!({ "vault_id": vault_id }))
    }

    async fn sync_events(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let _actor = self.actor(envelope)?;
        let vault_id = Self::vault_id(&envelope.payload)?;
        let limit = envelope
            .payload
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(50) as usize;

        let events = self.runtime.store.sync_events(vault_id, limit).await?;
        Ok(json!({ "events": events }))
    }

    async fn keys_rotate(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let actor = self.actor(envelope)?;
        let snapshot = build_snapshot(self.runtime.store.as_ref(), &actor, None).await?;
        if !evaluate(&snapshot, Operation::ManageEncryptionKeys, "/").is_allowed() {
            return Err(Error::Forbidden(
                "rotating vault keys requires the manage-encryption-keys capability".into(),
            ));
        }

        let engine = self.engine(&envelope.payload).await?;
        let version = engine.encryption().prepare_key_rotation().await?;

        if envelope
            .payload
            .get("now")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            self.runtime
                .sync
                .run_now(engine.vault_id(), SyncTrigger::Manual)
                .await?;
        }

        Ok(json!({ "vault_id": engine.vault_id(), "version": version }))
    }
}
