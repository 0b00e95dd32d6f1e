// Admin control channel
//
// Line-oriented JSON on a Unix-domain socket owned by the vaulthalla
// admin group. Requests are `{cmd, args}`, responses
// `{ok, exit_code, message}`; peer credentials are checked against the
// configured admin gid (root always passes). Exit codes: 0 success,
// 1 permission denied or runtime failure, 2 invalid arguments,
// 3 internal error.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use vaulthalla_core::service::{AsyncService, ServiceContext};
use vaulthalla_core::types::{SyncTrigger, VaultId};
use vaulthalla_core::Error;
use vaulthalla_rbac::{validate_pattern, Capability};
use vaulthalla_sealed_key::SealedKeyProvider;
use vaulthalla_store::model::{NewOverride, OverrideEffect, Subject, Waiver};
use vaulthalla_store::{RbacStore, SyncStore, UserStore, VaultKeyStore, VaultStore, WaiverStore};

use crate::runtime::Runtime;

const ENABLE_UPSTREAM_ENCRYPTION_WAIVER: &str = "\
You are enabling encryption on a vault whose upstream S3 bucket already \
contains files. This operation will encrypt and overwrite every existing \
object in the bucket, permanently changing its format; any other service \
reading from the bucket will break immediately. You are solely responsible \
for backing up the unencrypted originals and for the custody of your vault \
keys. Re-run with --accept-overwrite-waiver to proceed.";

const DISABLE_UPSTREAM_ENCRYPTION_WAIVER: &str = "\
You are disabling upstream encryption for this vault. Future uploads to \
the bucket will be stored in plaintext and accessible without decryption, \
which may weaken your security posture and violate compliance expectations. \
Local copies stay encrypted. Re-run with --accept-decryption-waiver to \
proceed.";

#[derive(Debug, Deserialize)]
struct CtlRequest {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CtlResponse {
    ok: bool,
    exit_code: i32,
    message: String,
}

impl CtlResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, exit_code: 0, message: message.into() }
    }

    fn fail(exit_code: i32, message: impl Into<String>) -> Self {
        Self { ok: false, exit_code, message: message.into() }
    }
}

pub struct CtlServer {
    runtime: Arc<Runtime>,
    socket_path: PathBuf,
    admin_gid: u32,
}

impl CtlServer {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let socket_path = runtime.config.paths.ctl_socket.clone();
        let admin_gid = runtime.config.services.ctl_admin_gid;
        Self { runtime, socket_path, admin_gid }
    }

    fn peer_allowed(&self, stream: &UnixStream) -> bool {
        match stream.peer_cred() {
            Ok(cred) => cred.uid() == 0 || cred.gid() == self.admin_gid,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read ctl peer credentials");
                false
            }
        }
    }

    async fn serve_connection(&self, stream: UnixStream) {
        let allowed = self.peer_allowed(&stream);
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }

            let response = if !allowed {
                CtlResponse::fail(1, "permission denied")
            } else {
                match serde_json::from_str::<CtlRequest>(&line) {
                    Ok(request) => self.dispatch(request).await,
                    Err(e) => CtlResponse::fail(2, format!("malformed request: {e}")),
                }
            };

            let mut payload = match serde_json::to_vec(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "cannot serialize ctl response");
                    break;
                }
            };
            payload.push(b'\n');
            if write_half.write_all(&payload).await.is_err() {
                break;
            }
        }
    }

    async fn dispatch(&self, request: CtlRequest) -> CtlResponse {
        let args: Vec<&str> = request.args.iter().map(String::as_str).collect();
        let result = match (request.cmd.as_str(), args.as_slice()) {
            ("status", _) => self.status().await,
            ("vault", ["list", ..]) => self.vault_list().await,
            ("vault", ["sync", rest @ ..]) => self.vault_sync(rest).await,
            ("vault", ["sync-info", vault, ..]) => self.vault_sync_info(vault).await,
            ("vault", ["keys", rest @ ..]) => self.vault_keys(rest).await,
            ("vault", ["rotate", rest @ ..]) => self.vault_rotate(rest).await,
            ("vault", ["events", vault, ..]) => self.vault_events(vault).await,
            ("vault", ["set-encrypt", rest @ ..]) => self.vault_set_encrypt(rest).await,
            ("user", ["list", ..]) => self.user_list().await,
            ("role", ["list", ..]) => self.role_list().await,
            ("role", ["assign", rest @ ..]) => self.role_assign(rest).await,
            ("override", ["add", rest @ ..]) => self.override_add(rest).await,
            ("override", ["toggle", id, state, ..]) => self.override_toggle(id, state).await,
            ("vault", _) => Err(CtlFailure::Usage(
                "vault: expected list | sync | sync-info | keys | rotate | events | set-encrypt".into(),
            )),
            ("role", _) => Err(CtlFailure::Usage("role: expected list | assign".into())),
            ("override", _) => Err(CtlFailure::Usage("override: expected add | toggle".into())),
            (other, _) => Err(CtlFailure::Usage(format!("unknown command '{other}'"))),
        };

        match result {
            Ok(message) => CtlResponse::ok(message),
            Err(CtlFailure::Usage(message)) => CtlResponse::fail(2, message),
            Err(CtlFailure::Runtime(message)) => CtlResponse::fail(1, message),
            Err(CtlFailure::Internal(message)) => {
                tracing::error!(message, "ctl command failed internally");
                CtlResponse::fail(3, "internal error")
            }
        }
    }

    async fn status(&self) -> CtlResult {
        let vaults = self.runtime.store.list_vaults().await.map_err(internal)?;
        let engines = self.runtime.engines.engines().await;
        let sessions = self.runtime.sessions.active_sessions();
        Ok(format!(
            "vaults: {} ({} attached), active sessions: {}",
            vaults.len(),
            engines.len(),
            sessions.len()
        ))
    }

    async fn vault_list(&self) -> CtlResult {
        let vaults = self.runtime.store.list_vaults().await.map_err(internal)?;
        if vaults.is_empty() {
            return Ok("no vaults".to_string());
        }
        let mut out = String::new();
        for vault in vaults {
            out.push_str(&format!(
                "{:>4}  {:<24} {:<6} owner={} active={}\n",
                vault.id, vault.name, vault.vault_type, vault.owner_id, vault.is_active
            ));
        }
        Ok(out.trim_end().to_string())
    }

    fn parse_vault_id(token: &str) -> Result<VaultId, CtlFailure> {
        token
            .parse()
            .map_err(|_| CtlFailure::Usage(format!("'{token}' is not a vault id")))
    }

    async fn vault_sync(&self, args: &[&str]) -> CtlResult {
        let [vault, ..] = args else {
            return Err(CtlFailure::Usage("vault sync: missing <vault_id>".into()));
        };
        let vault_id = Self::parse_vault_id(vault)?;
        self.runtime
            .sync
            .run_now(vault_id, SyncTrigger::Manual)
            .await
            .map_err(runtime_err)?;
        Ok(format!("sync initiated for vault {vault_id}"))
    }

    async fn vault_sync_info(&self, vault: &str) -> CtlResult {
        let vault_id = Self::parse_vault_id(vault)?;
        let policy = self
            .runtime
            .store
            .sync_policy(vault_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| CtlFailure::Runtime(format!("vault {vault_id} has no sync policy")))?;
        serde_json::to_string_pretty(&policy).map_err(|e| CtlFailure::Internal(e.to_string()))
    }

    /// Key custody commands. The ctl socket is gated by OS peer
    /// credentials; exports are still written to the audit log.
    async fn vault_keys(&self, args: &[&str]) -> CtlResult {
        let [sub, vault, ..] = args else {
            return Err(CtlFailure::Usage(
                "vault keys: expected <inspect | export> <vault_id>".into(),
            ));
        };
        let vault_id = Self::parse_vault_id(vault)?;

        let active = self
            .runtime
            .store
            .active_key(vault_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| CtlFailure::Runtime(format!("vault {vault_id} has no data key")))?;
        let rotating = self
            .runtime
            .store
            .rotation_in_progress(vault_id)
            .await
            .map_err(internal)?;

        match *sub {
            "inspect" => {
                let info = serde_json::json!({
                    "vault_id": vault_id,
                    "version": active.version,
                    "created_at": active.created_at,
                    "rotation_in_progress": rotating,
                });
                serde_json::to_string_pretty(&info).map_err(|e| CtlFailure::Internal(e.to_string()))
            }
            "export" => {
                let master = self
                    .runtime
                    .provider
                    .master_key()
                    .map_err(|e| CtlFailure::Internal(e.to_string()))?;
                let key = vaulthalla_crypto::wrap::unwrap(&master, &active.wrapped_key, &active.iv, b"")
                    .map_err(runtime_err)?;

                tracing::warn!(
                    target: "audit",
                    vault_id,
                    version = active.version,
                    "vault key exported over the ctl socket"
                );
                let out = serde_json::json!({
                    "vault_id": vault_id,
                    "version": active.version,
                    "key": hex::encode(key),
                    "created_at": active.created_at,
                });
                serde_json::to_string_pretty(&out).map_err(|e| CtlFailure::Internal(e.to_string()))
            }
            other => Err(CtlFailure::Usage(format!(
                "vault keys: unknown subcommand '{other}' (expected inspect | export)"
            ))),
        }
    }

    async fn vault_rotate(&self, args: &[&str]) -> CtlResult {
        let [vault, rest @ ..] = args else {
            return Err(CtlFailure::Usage("vault rotate: missing <vault_id | all>".into()));
        };
        let now = rest.contains(&"--now");

        let engines = if *vault == "all" {
            self.runtime.engines.engines().await
        } else {
            let vault_id = Self::parse_vault_id(vault)?;
            vec![self
                .runtime
                .engines
                .engine(vault_id)
                .await
                .ok_or_else(|| CtlFailure::Runtime(format!("vault {vault_id} is not attached")))?]
        };

        let mut rotated = Vec::new();
        for engine in engines {
            let version = engine
                .encryption()
                .prepare_key_rotation()
                .await
                .map_err(runtime_err)?;
            if now {
                self.runtime
                    .sync
                    .run_now(engine.vault_id(), SyncTrigger::Manual)
                    .await
                    .map_err(runtime_err)?;
            }
            rotated.push(format!("vault {} -> version {version}", engine.vault_id()));
        }
        Ok(rotated.join("\n"))
    }

    async fn vault_events(&self, vault: &str) -> CtlResult {
        let vault_id = Self::parse_vault_id(vault)?;
        let events = self
            .runtime
            .store
            .sync_events(vault_id, 20)
            .await
            .map_err(internal)?;
        serde_json::to_string_pretty(&events).map_err(|e| CtlFailure::Internal(e.to_string()))
    }

    /// Flipping `encrypt_upstream` on a non-empty bucket is destructive;
    /// it demands an explicit waiver flag, recorded append-only.
    async fn vault_set_encrypt(&self, args: &[&str]) -> CtlResult {
        let [vault, state, rest @ ..] = args else {
            return Err(CtlFailure::Usage(
                "vault set-encrypt: expected <vault_id> <true|false> [--accept-overwrite-waiver | --accept-decryption-waiver]".into(),
            ));
        };
        let vault_id = Self::parse_vault_id(vault)?;
        let encrypt: bool = state
            .parse()
            .map_err(|_| CtlFailure::Usage(format!("'{state}' is not true|false")))?;

        let mut record = self
            .runtime
            .store
            .vault(vault_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| CtlFailure::Runtime(format!("vault {vault_id} not found")))?;
        let s3 = record
            .s3
            .clone()
            .ok_or_else(|| CtlFailure::Usage("set-encrypt only applies to S3 vaults".into()))?;
        if s3.encrypt_upstream == encrypt {
            return Ok(format!("vault {vault_id} already has encrypt_upstream={encrypt}"));
        }

        let engine = self
            .runtime
            .engines
            .engine(vault_id)
            .await
            .ok_or_else(|| CtlFailure::Runtime(format!("vault {vault_id} is not attached")))?;
        let bucket_empty = engine
            .backend()
            .list("")
            .await
            .map_err(runtime_err)?
            .is_empty();

        let (flag, waiver_text) = if encrypt {
            ("--accept-overwrite-waiver", ENABLE_UPSTREAM_ENCRYPTION_WAIVER)
        } else {
            ("--accept-decryption-waiver", DISABLE_UPSTREAM_ENCRYPTION_WAIVER)
        };
        if !bucket_empty && !rest.contains(&flag) {
            return Err(CtlFailure::Runtime(waiver_text.to_string()));
        }

        if !bucket_empty {
            self.runtime
                .store
                .append_waiver(Waiver {
                    id: 0,
                    vault_id,
                    user_id: record.owner_id,
                    api_key_id: s3.api_key_id,
                    encrypt_upstream: encrypt,
                    waiver_text: waiver_text.to_string(),
                    overriding_role: None,
                    created_at: chrono::Utc::now(),
                })
                .await
                .map_err(internal)?;
        }

        if let Some(s3) = record.s3.as_mut() {
            s3.encrypt_upstream = encrypt;
        }
        self.runtime.store.update_vault(&record).await.map_err(internal)?;

        // Rebuild the engine so the new setting takes effect.
        self.runtime.engines.detach(vault_id).await;
        self.runtime.engines.attach(vault_id).await.map_err(runtime_err)?;

        Ok(format!("vault {vault_id} encrypt_upstream set to {encrypt}"))
    }

    async fn role_list(&self) -> CtlResult {
        let roles = self.runtime.store.list_roles().await.map_err(internal)?;
        let mut out = String::new();
        for role in roles {
            out.push_str(&format!(
                "{:>4}  {:<20} {:?} permissions={:#x}\n",
                role.id, role.name, role.role_type, role.permissions
            ));
        }
        Ok(out.trim_end().to_string())
    }

    /// `role assign <user|group> <subject_id> <role_name> [vault_id]`
    async fn role_assign(&self, args: &[&str]) -> CtlResult {
        let [kind, subject_id, role_name, rest @ ..] = args else {
            return Err(CtlFailure::Usage(
                "role assign: expected <user|group> <subject_id> <role_name> [vault_id]".into(),
            ));
        };
        let subject_id: u32 = subject_id
            .parse()
            .map_err(|_| CtlFailure::Usage(format!("'{subject_id}' is not a subject id")))?;
        let subject = match *kind {
            "user" => Subject::user(subject_id),
            "group" => Subject::group(subject_id),
            other => return Err(CtlFailure::Usage(format!("'{other}' is not user|group"))),
        };
        let role = self
            .runtime
            .store
            .role_by_name(role_name)
            .await
            .map_err(internal)?
            .ok_or_else(|| CtlFailure::Runtime(format!("role '{role_name}' not found")))?;
        let vault_id = match rest.first() {
            Some(token) => Some(Self::parse_vault_id(token)?),
            None => None,
        };

        let assignment = self
            .runtime
            .store
            .create_assignment(subject, role.id, vault_id)
            .await
            .map_err(runtime_err)?;
        Ok(format!("assignment {} created", assignment.id))
    }

    /// `override add <assignment_id> <capability> <pattern> <allow|deny>`
    ///
    /// The pattern is compiled here and rejected before it reaches the
    /// store.
    async fn override_add(&self, args: &[&str]) -> CtlResult {
        let [assignment_id, capability, pattern, effect, ..] = args else {
            return Err(CtlFailure::Usage(
                "override add: expected <assignment_id> <capability> <pattern> <allow|deny>".into(),
            ));
        };
        let assignment_id: u32 = assignment_id
            .parse()
            .map_err(|_| CtlFailure::Usage(format!("'{assignment_id}' is not an assignment id")))?;
        let capability: Capability = capability
            .parse()
            .map_err(|e: Error| CtlFailure::Usage(e.to_string()))?;
        validate_pattern(pattern).map_err(|e| CtlFailure::Usage(e.to_string()))?;
        let effect = match *effect {
            "allow" => OverrideEffect::Allow,
            "deny" => OverrideEffect::Deny,
            other => return Err(CtlFailure::Usage(format!("'{other}' is not allow|deny"))),
        };

        let over = self
            .runtime
            .store
            .create_override(NewOverride {
                assignment_id,
                capability_bit: capability.bit(),
                pattern: pattern.to_string(),
                effect,
            })
            .await
            .map_err(runtime_err)?;
        Ok(format!("override {} created", over.id))
    }

    async fn override_toggle(&self, id: &str, state: &str) -> CtlResult {
        let id: u32 = id
            .parse()
            .map_err(|_| CtlFailure::Usage(format!("'{id}' is not an override id")))?;
        let enabled: bool = state
            .parse()
            .map_err(|_| CtlFailure::Usage(format!("'{state}' is not true|false")))?;
        self.runtime
            .store
            .set_override_enabled(id, enabled)
            .await
            .map_err(runtime_err)?;
        Ok(format!("override {id} enabled={enabled}"))
    }

    async fn user_list(&self) -> CtlResult {
        let users = self.runtime.store.list_users().await.map_err(internal)?;
        let mut out = String::new();
        for user in users {
            out.push_str(&format!(
                "{:>4}  {:<20} {:<30} active={}\n",
                user.id, user.name, user.email, user.is_active
            ));
        }
        Ok(out.trim_end().to_string())
    }
}

enum CtlFailure {
    Usage(String),
    Runtime(String),
    Internal(String),
}

type CtlResult = Result<String, CtlFailure>;

fn runtime_err(e: Error) -> CtlFailure {
    match e {
        Error::Internal(msg) => CtlFailure::Internal(msg),
        other => CtlFailure::Runtime(other.to_string()),
    }
}

fn internal(e: Error) -> CtlFailure {
    CtlFailure::Internal(e.to_string())
}

#[async_trait]
impl AsyncService for CtlServer {
    fn name(&self) -> &'static str {
        "CtlServer"
    }

    async fn run_loop(&self, ctx: Arc<ServiceContext>) {
        if let Some(parent) = self.socket_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;

        let listener = match UnixListener::bind(&self.socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(path = ?self.socket_path, error = %e, "cannot bind ctl socket");
                return;
            }
        };
        tracing::info!(path = ?self.socket_path, "ctl socket listening");

        while !ctx.is_interrupted() {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.serve_connection(stream).await,
                        Err(e) => tracing::warn!(error = %e, "ctl accept failed"),
                    }
                }
                _ = ctx.lazy_sleep(std::time::Duration::from_secs(3600)) => {}
            }
        }

        let _ = tokio::fs::remove_file(&self.socket_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_store::MemoryStore;

    async fn ctl(dir: &tempfile::TempDir) -> CtlServer {
        let mut config = vaulthalla_config::Config::default();
        config.relocate_under(dir.path());
        let runtime = Runtime::build_with_store(config, Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        CtlServer::new(runtime)
    }

    fn request(cmd: &str, args: &[&str]) -> CtlRequest {
        CtlRequest {
            cmd: cmd.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_status_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = ctl(&dir).await;

        let status = ctl.dispatch(request("status", &[])).await;
        assert!(status.ok);
        assert_eq!(status.exit_code, 0);

        let vaults = ctl.dispatch(request("vault", &["list"])).await;
        assert!(vaults.ok);
        assert_eq!(vaults.message, "no vaults");
    }

    #[tokio::test]
    async fn test_unknown_command_exits_2() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = ctl(&dir).await;

        let response = ctl.dispatch(request("frobnicate", &[])).await;
        assert!(!response.ok);
        assert_eq!(response.exit_code, 2);

        let missing = ctl.dispatch(request("vault", &["sync"])).await;
        assert_eq!(missing.exit_code, 2);

        let bad_id = ctl.dispatch(request("vault", &["sync", "not-a-number"])).await;
        assert_eq!(bad_id.exit_code, 2);
    }

    #[tokio::test]
    async fn test_override_add_rejects_bad_patterns_at_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = ctl(&dir).await;

        // Seeded read-write role exists; hang an assignment off a user.
        let assign = ctl
            .dispatch(request("role", &["assign", "user", "1", "read-write", "3"]))
            .await;
        assert!(assign.ok, "{}", assign.message);

        let bad = ctl
            .dispatch(request(
                "override",
                &["add", "1", "download", "([unclosed", "deny"],
            ))
            .await;
        assert!(!bad.ok);
        assert_eq!(bad.exit_code, 2);

        let good = ctl
            .dispatch(request(
                "override",
                &["add", "1", "download", "^/secret/", "deny"],
            ))
            .await;
        assert!(good.ok, "{}", good.message);

        let bad_cap = ctl
            .dispatch(request("override", &["add", "1", "teleport", "^/x/", "deny"]))
            .await;
        assert_eq!(bad_cap.exit_code, 2);
    }

    #[tokio::test]
    async fn test_sync_unknown_vault_is_runtime_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = ctl(&dir).await;

        let response = ctl.dispatch(request("vault", &["sync", "42"])).await;
        assert!(!response.ok);
        assert_eq!(response.exit_code, 1);
    }
}
