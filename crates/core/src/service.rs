//! Long-running service runtime
//!
//! Every background worker in the daemon (sync controller, lifecycle
//! sweeper, janitor, ctl server) is an [`AsyncService`] driven by a
//! [`ServiceHandle`]. Cancellation is cooperative: loop bodies must observe
//! the context's interrupt flag at their suspension points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// A named, long-running background loop.
#[async_trait]
pub trait AsyncService: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// The service body. Must return promptly once `ctx.is_interrupted()`.
    ///
    /// Errors are handled inside the loop: a failed iteration is logged and
    /// the loop keeps running. Returning ends the service.
    async fn run_loop(&self, ctx: Arc<ServiceContext>);
}

/// Shared cancellation state between a service loop and its handle.
pub struct ServiceContext {
    interrupted: AtomicBool,
    wakeup: Notify,
}

impl ServiceContext {
    fn new() -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            wakeup: Notify::new(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.wakeup.notify_waiters();
    }

    /// Sleep that wakes early on interrupt. Returns `false` when the sleep
    /// was cut short, so loops can `while ctx.lazy_sleep(iv).await {}`.
    pub async fn lazy_sleep(&self, duration: Duration) -> bool {
        if self.is_interrupted() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_interrupted(),
            _ = self.wakeup.notified() => false,
        }
    }

    /// Wake a sleeping loop without interrupting it (e.g. a manual sync
    /// trigger nudging the scheduler).
    pub fn nudge(&self) {
        self.wakeup.notify_waiters();
    }
}

/// Owns a spawned service task. `stop()` is idempotent and joins the worker
/// exactly once; it is safe from any task except the service's own.
/// `restart()` stops the current loop and spawns a fresh one.
pub struct ServiceHandle {
    name: &'static str,
    service: Arc<dyn AsyncService>,
    ctx: std::sync::RwLock<Arc<ServiceContext>>,
    running: std::sync::RwLock<Arc<AtomicBool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceHandle {
    /// Spawn the service loop onto the runtime.
    pub fn start(service: Arc<dyn AsyncService>) -> Self {
        let (ctx, running, task) = Self::spawn(&service);
        Self {
            name: service.name(),
            service,
            ctx: std::sync::RwLock::new(ctx),
            running: std::sync::RwLock::new(running),
            task: Mutex::new(Some(task)),
        }
    }

    fn spawn(
        service: &Arc<dyn AsyncService>,
    ) -> (Arc<ServiceContext>, Arc<AtomicBool>, JoinHandle<()>) {
        let ctx = Arc::new(ServiceContext::new());
        let running = Arc::new(AtomicBool::new(true));

        let task = {
            let service = Arc::clone(service);
            let ctx = Arc::clone(&ctx);
            let running = Arc::clone(&running);
            tokio::spawn(async move {
                tracing::info!(service = service.name(), "service started");
                service.run_loop(ctx).await;
                running.store(false, Ordering::SeqCst);
                tracing::info!(service = service.name(), "service stopped");
            })
        };

        (ctx, running, task)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running
            .read()
            .expect("service handle lock poisoned")
            .load(Ordering::SeqCst)
    }

    /// Context handle for nudging the service from outside.
    pub fn context(&self) -> Arc<ServiceContext> {
        Arc::clone(&self.ctx.read().expect("service handle lock poisoned"))
    }

    /// Request cooperative shutdown and join the worker. A second call is a
    /// no-op that still returns success.
    pub async fn stop(&self) {
        self.context().interrupt();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(service = self.name, error = %e, "service task ended abnormally");
            }
        }
        self.running
            .read()
            .expect("service handle lock poisoned")
            .store(false, Ordering::SeqCst);
    }

    /// Stop the current loop and spawn a fresh one.
    pub async fn restart(&self) {
        tracing::info!(service = self.name, "restarting service");
        self.stop().await;

        let (ctx, running, task) = Self::spawn(&self.service);
        *self.ctx.write().expect("service handle lock poisoned") = ctx;
        *self.running.write().expect("service handle lock poisoned") = running;
        *self.task.lock().await = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Ticker {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AsyncService for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }

        async fn run_loop(&self, ctx: Arc<ServiceContext>) {
            while !ctx.is_interrupted() {
                self.ticks.fetch_add(1, Ordering::SeqCst);
                ctx.lazy_sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[tokio::test]
    async fn test_service_runs_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = ServiceHandle::start(Arc::new(Ticker { ticks: Arc::clone(&ticks) }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.is_running());
        handle.stop().await;

        assert!(!handle.is_running());
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = ServiceHandle::start(Arc::new(Ticker { ticks }));

        handle.stop().await;
        let after_first = handle.is_running();
        // Second stop must succeed without a second join.
        handle.stop().await;

        assert!(!after_first);
        assert!(!handle.is_running());
        assert!(handle.task.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_spawns_a_fresh_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = ServiceHandle::start(Arc::new(Ticker { ticks: Arc::clone(&ticks) }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.restart().await;
        assert!(handle.is_running());

        let before = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ticks.load(Ordering::SeqCst) > before);

        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_lazy_sleep_cut_short_by_interrupt() {
        let ctx = Arc::new(ServiceContext::new());
        let sleeper = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.lazy_sleep(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.interrupt();
        let completed = sleeper.await.unwrap();
        assert!(!completed);
    }
}
