//! The sync controller
//!
//! Globally fair, preemptible scheduling of per-vault sync tasks. One
//! task per attached vault; a bounded worker pool runs them; no two
//! workers ever touch the same vault concurrently. A failed task is
//! logged and rescheduled — it never takes the controller down.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock, Semaphore};

use vaulthalla_core::service::{AsyncService, ServiceContext};
use vaulthalla_core::types::{SyncOutcome, SyncTrigger, VaultId};
use vaulthalla_core::{Error, Result};
use vaulthalla_store::model::SyncPolicy;
use vaulthalla_store::{Store, SyncStore};
use vaulthalla_storage::StorageEngineManager;

use crate::local;
use crate::remote;
use crate::task::{QueueEntry, SyncTask};

pub struct SyncController {
    manager: Arc<StorageEngineManager>,
    store: Arc<dyn Store>,
    /// Bounded worker pool; overflow tasks stay queued.
    pool: Arc<Semaphore>,
    pq: std::sync::Mutex<BinaryHeap<QueueEntry>>,
    task_map: RwLock<HashMap<VaultId, Arc<SyncTask>>>,
    /// Vaults with a worker in flight.
    running: Arc<std::sync::Mutex<HashSet<VaultId>>>,
    kick: Notify,
    tick_interval: std::time::Duration,
}

impl SyncController {
    pub fn new(
        manager: Arc<StorageEngineManager>,
        store: Arc<dyn Store>,
        worker_pool_size: usize,
        tick_interval: std::time::Duration,
    ) -> Self {
        Self {
            manager,
            store,
            pool: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            pq: std::sync::Mutex::new(BinaryHeap::new()),
            task_map: RwLock::new(HashMap::new()),
            running: Arc::new(std::sync::Mutex::new(HashSet::new())),
            kick: Notify::new(),
            tick_interval,
        }
    }

    /// Mark the vault's task as manually triggered and nudge the
    /// scheduler.
    pub async fn run_now(&self, vault_id: VaultId, trigger: SyncTrigger) -> Result<()> {
        if self.task_map.read().await.get(&vault_id).is_none() {
            self.refresh_engines().await?;
        }
        let tasks = self.task_map.read().await;
        let task = tasks
            .get(&vault_id)
            .ok_or_else(|| Error::NotFound(format!("no sync task for vault {vault_id}")))?;
        task.mark_manual(trigger);
        drop(tasks);

        self.kick.notify_waiters();
        Ok(())
    }

    /// Cooperative cancellation: the worker finishes its current file and
    /// yields.
    pub async fn interrupt_task(&self, vault_id: VaultId) -> Result<()> {
        let tasks = self.task_map.read().await;
        let task = tasks
            .get(&vault_id)
            .ok_or_else(|| Error::NotFound(format!("no sync task for vault {vault_id}")))?;
        task.interrupt();
        Ok(())
    }

    /// Reconcile the task map with the engine registry: new engines get a
    /// task, removed engines lose theirs.
    pub async fn refresh_engines(&self) -> Result<()> {
        let engines = self.manager.engines().await;
        let engine_ids: HashSet<VaultId> = engines.iter().map(|e| e.vault_id()).collect();

        let mut tasks = self.task_map.write().await;
        for engine in engines {
            let vault_id = engine.vault_id();
            if tasks.contains_key(&vault_id) {
                continue;
            }
            let interval = engine.sync_policy().await.interval();
            let last_success = self.store.last_success_at(vault_id).await?;
            tasks.insert(
                vault_id,
                Arc::new(SyncTask::new(engine, interval, last_success)),
            );
            tracing::debug!(vault_id, "sync task created");
        }

        let stale: Vec<VaultId> = tasks
            .keys()
            .filter(|id| !engine_ids.contains(id))
            .copied()
            .collect();
        for vault_id in stale {
            if let Some(task) = tasks.remove(&vault_id) {
                task.interrupt();
                tracing::debug!(vault_id, "sync task dropped");
            }
        }
        Ok(())
    }

    /// Rebuild the priority queue from tasks that are due and idle, then
    /// dispatch while worker slots are free.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<usize> {
        {
            let tasks = self.task_map.read().await;
            let running = self.running.lock().expect("running set lock poisoned");
            let mut pq = self.pq.lock().expect("queue lock poisoned");
            pq.clear();
            for task in tasks.values() {
                if task.is_due(now) && !running.contains(&task.vault_id) {
                    pq.push(task.queue_entry(now));
                }
            }
        }

        let mut dispatched = 0;
        loop {
            let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() else {
                break;
            };
            let entry = self.pq.lock().expect("queue lock poisoned").pop();
            let Some(entry) = entry else {
                drop(permit);
                break;
            };
            let task = match self.task_map.read().await.get(&entry.vault_id) {
                Some(task) => Arc::clone(task),
                None => continue,
            };

            self.running
                .lock()
                .expect("running set lock poisoned")
                .insert(entry.vault_id);
            let store = Arc::clone(&self.store);
            let running = Arc::clone(&self.running);
            tokio::spawn(async move {
                let _permit = permit;
                run_task(task, store).await;
                running
                    .lock()
                    .expect("running set lock poisoned")
                    .remove(&entry.vault_id);
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn tick(&self) {
        if let Err(e) = self.refresh_engines().await {
            tracing::error!(error = %e, "engine refresh failed");
        }
        if let Err(e) = self.dispatch_due(Utc::now()).await {
            tracing::error!(error = %e, "dispatch failed");
        }
    }
}

/// Run one task end to end: event start, worker, event finish, state
/// update. Every failure path is contained here.
async fn run_task(task: Arc<SyncTask>, store: Arc<dyn Store>) {
    let vault_id = task.vault_id;
    let trigger = task.take_trigger();
    task.clear_interrupt();

    let event = match store.start_sync_event(vault_id, trigger).await {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(vault_id, error = %e, "cannot record sync event");
            return;
        }
    };

    let policy = task.engine.sync_policy().await;
    task.set_interval(policy.interval());

    let result = match policy {
        SyncPolicy::Fs(_) => local::run(&task).await,
        SyncPolicy::Rs(_) => remote::run(&task).await,
    };

    let (outcome, error) = match result {
        Ok(outcome) => (outcome, None),
        Err(e) => {
            tracing::error!(vault_id, error = %e, "sync task failed");
            (SyncOutcome::Failed, Some(e.to_string()))
        }
    };

    match outcome {
        SyncOutcome::Success => task.record_success(Utc::now()),
        SyncOutcome::Failed => task.requeue_with_cooldown(Utc::now()),
        SyncOutcome::Interrupted | SyncOutcome::Suspended => {}
    }

    if let Err(e) = store.finish_sync_event(event.id, outcome, error).await {
        tracing::error!(vault_id, error = %e, "cannot finish sync event");
    }
    tracing::info!(vault_id, ?trigger, ?outcome, "sync task finished");
}

#[async_trait]
impl AsyncService for SyncController {
    fn name(&self) -> &'static str {
        "SyncController"
    }

    async fn run_loop(&self, ctx: Arc<ServiceContext>) {
        while !ctx.is_interrupted() {
            self.tick().await;
            tokio::select! {
                _ = ctx.lazy_sleep(self.tick_interval) => {},
                _ = self.kick.notified() => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vaulthalla_core::types::VaultType;
    use vaulthalla_sealed_key::{FileSealedKeyProvider, SealedKeyProvider};
    use vaulthalla_storage::{EngineDeps, RetryPolicy};
    use vaulthalla_store::model::{NewUser, NewVault};
    use vaulthalla_store::{MemoryStore, UserStore, VaultStore};

    async fn setup(
        pool_size: usize,
        dir: &tempfile::TempDir,
    ) -> (SyncController, Arc<MemoryStore>, VaultId, VaultId) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FileSealedKeyProvider::new("master", dir.path()).unwrap());
        provider.init(None).unwrap();

        store
            .create_user(NewUser {
                name: "o".into(),
                email: "o@ex.com".into(),
                password_hash: "h".into(),
                role_id: 1,
            })
            .await
            .unwrap();

        let mut vault_ids = Vec::new();
        for name in ["a", "b"] {
            let vault = store
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
                .unwrap();
            vault_ids.push(vault.id);
        }

        let manager = Arc::new(StorageEngineManager::new(EngineDeps {
            store: Arc::clone(&store) as Arc<dyn Store>,
            provider,
            cache_dir: dir.path().join("cache"),
            cache_cap_bytes: 0,
            default_sync_interval_secs: 60,
            retry: RetryPolicy::backend_default(),
        }));
        manager.attach_all_active().await.unwrap();

        let controller = SyncController::new(
            manager,
            Arc::clone(&store) as Arc<dyn Store>,
            pool_size,
            std::time::Duration::from_millis(50),
        );
        (controller, store, vault_ids[0], vault_ids[1])
    }

    async fn wait_for_events(store: &MemoryStore, vault_id: VaultId, count: usize) {
        for _ in 0..100 {
            if store.sync_events(vault_id, 100).await.unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("vault {vault_id} never reached {count} sync events");
    }

    #[tokio::test]
    async fn test_longest_overdue_dispatched_first_with_one_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, store, vault_a, vault_b) = setup(1, &dir).await;
        controller.refresh_engines().await.unwrap();

        let now = Utc::now();
        {
            let tasks = controller.task_map.read().await;
            // A is 120 s overdue, B is 90 s overdue, interval 60 s.
            tasks[&vault_a].record_success(now - Duration::seconds(120));
            tasks[&vault_b].record_success(now - Duration::seconds(90));
        }

        let dispatched = controller.dispatch_due(now).await.unwrap();
        assert_eq!(dispatched, 1);

        wait_for_events(&store, vault_a, 1).await;
        assert_eq!(store.sync_events(vault_b, 100).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_not_yet_due_tasks_wait() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _store, vault_a, vault_b) = setup(4, &dir).await;
        controller.refresh_engines().await.unwrap();

        let now = Utc::now();
        {
            let tasks = controller.task_map.read().await;
            tasks[&vault_a].record_success(now - Duration::seconds(10));
            tasks[&vault_b].record_success(now - Duration::seconds(10));
        }

        assert_eq!(controller.dispatch_due(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manual_trigger_bypasses_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, store, vault_a, vault_b) = setup(4, &dir).await;
        controller.refresh_engines().await.unwrap();

        let now = Utc::now();
        {
            let tasks = controller.task_map.read().await;
            tasks[&vault_a].record_success(now);
            tasks[&vault_b].record_success(now);
        }

        controller.run_now(vault_a, SyncTrigger::Manual).await.unwrap();
        assert_eq!(controller.dispatch_due(now).await.unwrap(), 1);

        wait_for_events(&store, vault_a, 1).await;
        let events = store.sync_events(vault_a, 10).await.unwrap();
        assert_eq!(events[0].trigger, SyncTrigger::Manual);
        assert_eq!(events[0].outcome, Some(SyncOutcome::Success));
    }

    #[tokio::test]
    async fn test_refresh_drops_detached_vaults() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _store, vault_a, _vault_b) = setup(4, &dir).await;
        controller.refresh_engines().await.unwrap();
        assert_eq!(controller.task_map.read().await.len(), 2);

        controller.manager.detach(vault_a).await;
        controller.refresh_engines().await.unwrap();
        assert_eq!(controller.task_map.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_run_now_unknown_vault_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _store, _a, _b) = setup(1, &dir).await;
        assert!(matches!(
            controller.run_now(999, SyncTrigger::Manual).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_running_vault_not_double_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, store, vault_a, _b) = setup(4, &dir).await;
        controller.refresh_engines().await.unwrap();

        controller
            .running
            .lock()
            .unwrap()
            .insert(vault_a);
        let now = Utc::now();
        let dispatched = controller.dispatch_due(now).await.unwrap();
        // Only vault B runs; A is already in flight.
        assert_eq!(dispatched, 1);
        assert_eq!(store.sync_events(vault_a, 10).await.unwrap().len(), 0);
    }
}
