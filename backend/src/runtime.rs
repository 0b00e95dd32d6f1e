// Runtime wiring
//
// The explicit dependency graph, built once at startup and threaded
// through constructors. No global registries: tests build a fresh Runtime
// over the in-memory store.

use std::sync::Arc;

use anyhow::Context;

use vaulthalla_auth::{AuthManager, ConnectionLifecycleManager, SessionManager, TokenAuthority};
use vaulthalla_config::Config;
use vaulthalla_core::service::ServiceHandle;
use vaulthalla_crypto::{InternalSecretManager, PasswordPolicy, JWT_SECRET_KEY};
use vaulthalla_rbac::{Capability, CapabilitySet};
use vaulthalla_sealed_key::{FileSealedKeyProvider, SealedKeyProvider};
use vaulthalla_storage::{EngineDeps, RetryPolicy, StorageEngineManager};
use vaulthalla_store::model::RoleType;
use vaulthalla_store::{RbacStore, Store};
use vaulthalla_sync::SyncController;

use crate::db::{create_pool, run_migrations, PgStore};
use crate::janitor::DbJanitor;

pub struct Runtime {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn SealedKeyProvider>,
    pub secrets: Arc<InternalSecretManager>,
    pub authority: Arc<TokenAuthority>,
    pub sessions: Arc<SessionManager>,
    pub auth: Arc<AuthManager>,
    pub engines: Arc<StorageEngineManager>,
    pub sync: Arc<SyncController>,
    pub lifecycle: Arc<ConnectionLifecycleManager>,
    pub janitor: Arc<DbJanitor>,
    services: tokio::sync::Mutex<Vec<ServiceHandle>>,
}

impl Runtime {
    /// Production build: Postgres store, migrations applied.
    pub async fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let pool = create_pool(&config.database)
            .await
            .context("connecting to the database")?;
        run_migrations(&pool).await.context("running migrations")?;
        Self::build_with_store(config, Arc::new(PgStore::new(pool))).await
    }

    /// Build over any store implementation (tests, TEST_MODE runs).
    pub async fn build_with_store(
        config: Config,
        store: Arc<dyn Store>,
    ) -> anyhow::Result<Arc<Self>> {
        let provider: Arc<dyn SealedKeyProvider> = Arc::new(
            FileSealedKeyProvider::new("master", &config.paths.secrets_dir)
                .context("opening sealed key provider")?,
        );
        provider.init(None).context("initializing master key")?;

        let secrets = Arc::new(InternalSecretManager::new(
            Arc::clone(&store) as _,
            Arc::clone(&provider),
        ));
        let jwt_secret = secrets
            .get_or_create(JWT_SECRET_KEY, 32)
            .await
            .context("loading jwt secret")?;

        let authority = Arc::new(TokenAuthority::new(
            &jwt_secret,
            &config.auth.jwt_issuer,
            config.auth.access_token_ttl_secs,
            config.auth.refresh_token_ttl_days,
        ));

        let mut policy = PasswordPolicy::new();
        if let Some(path) = &config.auth.dictionary_path {
            let loaded = policy.load_dictionary(path).context("loading dictionary corpus")?;
            tracing::info!(loaded, "dictionary corpus loaded");
        }
        if let Some(path) = &config.auth.weak_passwords_path {
            policy.load_weak_passwords(path).context("loading weak-password corpus")?;
        }
        if let Some(path) = &config.auth.pwned_sha1_path {
            policy.load_pwned_sha1(path).context("loading breached-password corpus")?;
        }

        let default_role_id = seed_roles(store.as_ref()).await?;

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&authority),
        ));
        let auth = Arc::new(AuthManager::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            Arc::clone(&authority),
            Arc::new(policy),
            default_role_id,
        ));

        let engines = Arc::new(StorageEngineManager::new(EngineDeps {
            store: Arc::clone(&store),
            provider: Arc::clone(&provider),
            cache_dir: config.paths.cache_dir.clone(),
            cache_cap_bytes: config.storage.cache_cap_bytes,
            default_sync_interval_secs: config.services.sync_interval_secs,
            retry: RetryPolicy {
                max_attempts: config.storage.retry_max_attempts,
                initial_backoff: std::time::Duration::from_millis(
                    config.storage.retry_initial_backoff_ms,
                ),
                ..RetryPolicy::backend_default()
            },
        }));
        let attached = engines.attach_all_active().await?;
        tracing::info!(attached, "storage engines attached");

        let sync = Arc::new(SyncController::new(
            Arc::clone(&engines),
            Arc::clone(&store),
            config.services.sync_worker_pool_size,
            std::time::Duration::from_secs(5),
        ));
        let lifecycle = Arc::new(ConnectionLifecycleManager::new(
            Arc::clone(&sessions),
            config.services.lifecycle_sweep_interval_secs,
            config.services.unauthenticated_timeout_secs,
            config.services.idle_timeout_mins,
        ));
        let janitor = Arc::new(DbJanitor::new(
            Arc::clone(&store),
            Arc::clone(&engines),
            &config.services,
        ));

        Ok(Arc::new(Self {
            config,
            store,
            provider,
            secrets,
            authority,
            sessions,
            auth,
            engines,
            sync,
            lifecycle,
            janitor,
            services: tokio::sync::Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the background services.
    pub async fn start_services(&self) {
        let mut services = self.services.lock().await;
        services.push(ServiceHandle::start(Arc::clone(&self.sync) as _));
        services.push(ServiceHandle::start(Arc::clone(&self.lifecycle) as _));
        services.push(ServiceHandle::start(Arc::clone(&self.janitor) as _));
    }

    pub async fn register_service(&self, handle: ServiceHandle) {
        self.services.lock().await.push(handle);
    }

    /// Stop services in reverse start order; idempotent.
    pub async fn shutdown(&self) {
        let mut services = self.services.lock().await;
        for handle in services.iter().rev() {
            handle.stop().await;
        }
        services.clear();
        tracing::info!("runtime shut down");
    }
}

/// Make sure the built-in roles exist; returns the default user role id.
async fn seed_roles(store: &dyn Store) -> anyhow::Result<u32> {
    if store.role_by_name("super-admin").await?.is_none() {
        store
            .create_role(
                "super-admin",
                RoleType::User,
                CapabilitySet::of(&[Capability::SuperAdmin]).bits(),
            )
            .await?;
    }
    if store.role_by_name("read-write").await?.is_none() {
        store
            .create_role("read-write", RoleType::Vault, CapabilitySet::all_vault().bits())
            .await?;
    }
    let user_role = match store.role_by_name("user").await? {
        Some(role) => role,
        None => store.create_role("user", RoleType::User, 0).await?,
    };
    Ok(user_role.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_store::MemoryStore;

    async fn test_runtime(dir: &tempfile::TempDir) -> Arc<Runtime> {
        let mut config = Config::default();
        config.relocate_under(dir.path());
        Runtime::build_with_store(config, Arc::new(MemoryStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_seeds_roles_and_secret() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(&dir).await;

        assert!(runtime.store.role_by_name("super-admin").await.unwrap().is_some());
        assert!(runtime.store.role_by_name("user").await.unwrap().is_some());

        // The jwt secret is stable across rebuilds over the same state.
        let first = runtime.secrets.get_or_create(JWT_SECRET_KEY, 32).await.unwrap();
        let second = runtime.secrets.get_or_create(JWT_SECRET_KEY, 32).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_services_start_and_shutdown_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(&dir).await;

        runtime.start_services().await;
        runtime.shutdown().await;
        // A second shutdown is a no-op.
        runtime.shutdown().await;
    }
}
