// Database janitor
//
// Reclaims trashed backing objects past the retention window, purges dead
// refresh tokens and enforces sync-event retention.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use vaulthalla_config::ServicesConfig;
use vaulthalla_core::service::{AsyncService, ServiceContext};
use vaulthalla_storage::StorageEngineManager;
use vaulthalla_store::{Store, SyncStore, TokenStore, TrashStore};

pub struct DbJanitor {
    store: Arc<dyn Store>,
    engines: Arc<StorageEngineManager>,
    interval: std::time::Duration,
    trash_retention: Duration,
    sync_event_retention: Duration,
    sync_event_max: usize,
}

impl DbJanitor {
    pub fn new(
        store: Arc<dyn Store>,
        engines: Arc<StorageEngineManager>,
        config: &ServicesConfig,
    ) -> Self {
        Self {
            store,
            engines,
            interval: std::time::Duration::from_secs(config.janitor_interval_secs),
            trash_retention: Duration::days(config.trash_retention_days),
            sync_event_retention: Duration::days(config.sync_event_retention_days),
            sync_event_max: config.sync_event_retention_max,
        }
    }

    pub async fn sweep(&self) {
        let now = Utc::now();

        // Reclaim trashed backing objects whose retention lapsed.
        match self.store.trashed_before(now - self.trash_retention).await {
            Ok(reclaimable) => {
                for trashed in reclaimable {
                    let Some(engine) = self.engines.engine(trashed.vault_id).await else {
                        // Detached vault; the row waits for a re-attach.
                        continue;
                    };
                    match engine.backend().delete(&trashed.backing_path).await {
                        Ok(()) => {
                            if let Err(e) = self.store.mark_trash_deleted(trashed.id).await {
                                tracing::error!(id = trashed.id, error = %e, "cannot mark trash reclaimed");
                            } else {
                                tracing::debug!(
                                    vault_id = trashed.vault_id,
                                    backing = %trashed.backing_path,
                                    "reclaimed trashed object"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                vault_id = trashed.vault_id,
                                backing = %trashed.backing_path,
                                error = %e,
                                "trash reclamation failed, will retry next sweep"
                            );
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "trash sweep query failed"),
        }

        match self.store.purge_refresh_tokens(now).await {
            Ok(purged) if purged > 0 => tracing::debug!(purged, "purged dead refresh tokens"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "refresh token purge failed"),
        }

        match self
            .store
            .prune_sync_events(now - self.sync_event_retention, self.sync_event_max)
            .await
        {
            Ok(pruned) if pruned > 0 => tracing::debug!(pruned, "pruned sync events"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "sync event prune failed"),
        }
    }
}

#[async_trait]
impl AsyncService for DbJanitor {
    fn name(&self) -> &'static str {
        "DbJanitor"
    }

    async fn run_loop(&self, ctx: Arc<ServiceContext>) {
        while !ctx.is_interrupted() {
            self.sweep().await;
            ctx.lazy_sleep(self.interval).await;
        }
    }
}
