//! Engine registry
//!
//! One engine per attached (active) vault. The sync controller snapshots
//! this registry each scheduling pass; request handlers resolve engines by
//! vault id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use vaulthalla_core::types::{VaultId, VaultType};
use vaulthalla_core::{Error, Result};
use vaulthalla_crypto::{wrap, VaultEncryptionManager};
use vaulthalla_sealed_key::SealedKeyProvider;
use vaulthalla_store::model::{SyncPolicy, Vault};
use vaulthalla_store::{ApiKeyStore, FsStore, Store, VaultStore};

use crate::cache::LocalCache;
use crate::engine::StorageEngine;
use crate::local::LocalBackend;
use crate::retry::RetryPolicy;
use crate::s3::S3Backend;

/// Everything needed to build engines.
pub struct EngineDeps {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn SealedKeyProvider>,
    pub cache_dir: PathBuf,
    pub cache_cap_bytes: u64,
    pub default_sync_interval_secs: u64,
    pub retry: RetryPolicy,
}

pub struct StorageEngineManager {
    deps: EngineDeps,
    engines: RwLock<HashMap<VaultId, Arc<StorageEngine>>>,
}

impl StorageEngineManager {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Attach every active vault at startup. A vault that fails to attach
    /// is logged and skipped; one bad vault must not block the daemon.
    pub async fn attach_all_active(&self) -> Result<usize> {
        let mut attached = 0;
        for vault in self.deps.store.list_active_vaults().await? {
            match self.attach(vault.id).await {
                Ok(_) => attached += 1,
                Err(e) => {
                    tracing::error!(vault_id = vault.id, error = %e, "failed to attach vault");
                }
            }
        }
        Ok(attached)
    }

    pub async fn attach(&self, vault_id: VaultId) -> Result<Arc<StorageEngine>> {
        if let Some(engine) = self.engines.read().await.get(&vault_id) {
            return Ok(Arc::clone(engine));
        }

        let vault = self
            .deps
            .store
            .vault(vault_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("vault {vault_id}")))?;
        if !vault.is_active {
            return Err(Error::Validation(format!("vault '{}' is not active", vault.name)));
        }

        let engine = Arc::new(self.build_engine(&vault).await?);
        self.engines.write().await.insert(vault_id, Arc::clone(&engine));
        tracing::info!(vault_id, vault = %vault.name, "vault attached");
        Ok(engine)
    }

    async fn build_engine(&self, vault: &Vault) -> Result<StorageEngine> {
        self.deps.store.ensure_root(vault.id, vault.owner_id).await?;

        let policy = match self.deps.store.sync_policy(vault.id).await? {
            Some(policy) => policy,
            None => {
                let policy = match vault.vault_type {
                    VaultType::Local => SyncPolicy::default_fs(self.deps.default_sync_interval_secs),
                    VaultType::S3 => SyncPolicy::default_rs(self.deps.default_sync_interval_secs),
                };
                self.deps
                    .store
                    .update_sync_policy(vault.id, policy.clone())
                    .await?;
                policy
            }
        };

        let encryption = Arc::new(VaultEncryptionManager::new(
            vault.id,
            Arc::clone(&self.deps.store) as _,
            Arc::clone(&self.deps.provider),
        ));
        encryption.load_or_init_key().await?;

        let (backend, cache): (Arc<dyn crate::backend::VaultBackend>, Option<LocalCache>) =
            match vault.vault_type {
                VaultType::Local => {
                    (Arc::new(LocalBackend::new(&vault.mount_point).await?), None)
                }
                VaultType::S3 => {
                    let s3 = vault.s3.as_ref().ok_or_else(|| {
                        Error::Corrupt(format!("S3 vault {} has no S3 settings row", vault.id))
                    })?;
                    let api_key = self
                        .deps
                        .store
                        .api_key(s3.api_key_id)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("api key {}", s3.api_key_id)))?;

                    let master = self.deps.provider.master_key().map_err(|e| {
                        Error::Internal(format!("master key unavailable: {e}"))
                    })?;
                    let secret_bytes =
                        wrap::unwrap(&master, &api_key.wrapped_secret, &api_key.iv, b"")?;
                    let secret = String::from_utf8(secret_bytes)
                        .map_err(|_| Error::Corrupt("api key secret is not UTF-8".into()))?;

                    let backend = S3Backend::new(
                        &s3.bucket,
                        &api_key.region,
                        api_key.endpoint.as_deref(),
                        &api_key.access_key,
                        &secret,
                    );
                    let cache = LocalCache::new(
                        vault.id,
                        &self.deps.cache_dir,
                        self.deps.cache_cap_bytes,
                        Arc::clone(&self.deps.store) as _,
                    )
                    .await?;
                    (Arc::new(backend), Some(cache))
                }
            };

        Ok(StorageEngine::new(
            vault.clone(),
            policy,
            backend,
            encryption,
            Arc::clone(&self.deps.store),
            cache,
            self.deps.retry,
        ))
    }

    pub async fn detach(&self, vault_id: VaultId) -> bool {
        let removed = self.engines.write().await.remove(&vault_id).is_some();
        if removed {
            tracing::info!(vault_id, "vault detached");
        }
        removed
    }

    pub async fn engine(&self, vault_id: VaultId) -> Option<Arc<StorageEngine>> {
        self.engines.read().await.get(&vault_id).cloned()
    }

    /// Snapshot of all attached engines, the controller's scheduling input.
    pub async fn engines(&self) -> Vec<Arc<StorageEngine>> {
        let mut engines: Vec<_> = self.engines.read().await.values().cloned().collect();
        engines.sort_by_key(|e| e.vault_id());
        engines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_core::types::VaultType;
    use vaulthalla_sealed_key::FileSealedKeyProvider;
    use vaulthalla_store::model::{NewUser, NewVault, RoleType};
    use vaulthalla_store::{MemoryStore, RbacStore, UserStore, VaultStore};

    async fn manager(dir: &tempfile::TempDir) -> (StorageEngineManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FileSealedKeyProvider::new("master", dir.path()).unwrap());
        provider.init(None).unwrap();

        let manager = StorageEngineManager::new(EngineDeps {
            store: Arc::clone(&store) as Arc<dyn Store>,
            provider,
            cache_dir: dir.path().join("cache"),
            cache_cap_bytes: 0,
            default_sync_interval_secs: 60,
            retry: RetryPolicy::backend_default(),
        });
        (manager, store)
    }

    async fn seed_vault(store: &MemoryStore, dir: &tempfile::TempDir, name: &str) -> VaultId {
        if store.role_by_name("user").await.unwrap().is_none() {
            store.create_role("user", RoleType::User, 0).await.unwrap();
        }
        if store.user_by_email("o@ex.com").await.unwrap().is_none() {
            store
                .create_user(NewUser {
                    name: "owner".into(),
                    email: "o@ex.com".into(),
                    password_hash: "h".into(),
                    role_id: 1,
                })
                .await
                .unwrap();
        }
        store
            .create_vault(NewVault {
                name: name.into(),
                owner_id: 1,
                vault_type: VaultType::Local,
                mount_point: dir.path().join(name).to_string_lossy().into_owned(),
                quota_bytes: 0,
                description: String::new(),
                s3: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_attach_builds_engine_with_default_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(&dir).await;
        let vault_id = seed_vault(&store, &dir, "docs").await;

        let engine = manager.attach(vault_id).await.unwrap();
        assert_eq!(engine.vault_id(), vault_id);
        assert_eq!(engine.encryption().key_version(), 1);
        // Default policy got persisted.
        assert!(store.sync_policy(vault_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(&dir).await;
        let vault_id = seed_vault(&store, &dir, "docs").await;

        let a = manager.attach(vault_id).await.unwrap();
        let b = manager.attach(vault_id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.engines().await.len(), 1);
    }

    #[tokio::test]
    async fn test_detach_and_inactive_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(&dir).await;
        let vault_id = seed_vault(&store, &dir, "docs").await;

        manager.attach(vault_id).await.unwrap();
        assert!(manager.detach(vault_id).await);
        assert!(!manager.detach(vault_id).await);
        assert!(manager.engine(vault_id).await.is_none());

        store.set_vault_active(vault_id, false).await.unwrap();
        assert!(matches!(
            manager.attach(vault_id).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_attach_all_active() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(&dir).await;
        seed_vault(&store, &dir, "a").await;
        let b = seed_vault(&store, &dir, "b").await;
        store.set_vault_active(b, false).await.unwrap();

        let attached = manager.attach_all_active().await.unwrap();
        assert_eq!(attached, 1);
    }
}
