//! Per-vault sync tasks and their scheduling order

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use vaulthalla_core::types::{SyncTrigger, VaultId};
use vaulthalla_storage::StorageEngine;

/// Cooldown applied when a worker requeues itself after transient failure.
pub const REQUEUE_COOLDOWN_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct TaskState {
    pub interval: Duration,
    pub last_success_at: Option<DateTime<Utc>>,
    pub manual_trigger: Option<SyncTrigger>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// One scheduled task per active vault.
pub struct SyncTask {
    pub vault_id: VaultId,
    pub engine: Arc<StorageEngine>,
    state: std::sync::Mutex<TaskState>,
    /// Cooperative cancellation; the worker checks between files.
    interrupt: AtomicBool,
}

impl SyncTask {
    pub fn new(
        engine: Arc<StorageEngine>,
        interval: Duration,
        last_success_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            vault_id: engine.vault_id(),
            engine,
            state: std::sync::Mutex::new(TaskState {
                interval,
                last_success_at,
                manual_trigger: None,
                cooldown_until: None,
            }),
            interrupt: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().expect("task state lock poisoned").clone()
    }

    pub fn mark_manual(&self, trigger: SyncTrigger) {
        let mut state = self.state.lock().expect("task state lock poisoned");
        state.manual_trigger = Some(trigger);
    }

    /// Consume the pending manual trigger, defaulting to the schedule.
    pub fn take_trigger(&self) -> SyncTrigger {
        let mut state = self.state.lock().expect("task state lock poisoned");
        state.manual_trigger.take().unwrap_or(SyncTrigger::Schedule)
    }

    pub fn record_success(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock().expect("task state lock poisoned");
        state.last_success_at = Some(at);
        state.cooldown_until = None;
    }

    /// Push the task back with a cooldown after a transient failure.
    pub fn requeue_with_cooldown(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("task state lock poisoned");
        state.cooldown_until = Some(now + Duration::seconds(REQUEUE_COOLDOWN_SECS));
    }

    pub fn set_interval(&self, interval: Duration) {
        let mut state = self.state.lock().expect("task state lock poisoned");
        state.interval = interval;
    }

    pub fn interrupt(&self) {
        self.interrupt.store(true, AtomicOrdering::SeqCst);
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, AtomicOrdering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(AtomicOrdering::SeqCst)
    }

    /// Whether the scheduler may dispatch this task now. A pending manual
    /// trigger bypasses both interval and cooldown.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().expect("task state lock poisoned");
        if state.manual_trigger.is_some() {
            return true;
        }
        if state.cooldown_until.map(|t| now < t).unwrap_or(false) {
            return false;
        }
        match state.last_success_at {
            None => true,
            Some(last) => now - last >= state.interval,
        }
    }

    pub fn queue_entry(&self, now: DateTime<Utc>) -> QueueEntry {
        let state = self.state.lock().expect("task state lock poisoned");
        QueueEntry {
            manual: state.manual_trigger.is_some(),
            overdue_ms: state
                .last_success_at
                .map(|last| (now - last).num_milliseconds())
                .unwrap_or(i64::MAX),
            vault_id: self.vault_id,
        }
    }
}

/// Max-heap entry: manual triggers first, then longest overdue; vault id
/// breaks ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub manual: bool,
    pub overdue_ms: i64,
    pub vault_id: VaultId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.manual
            .cmp(&other.manual)
            .then(self.overdue_ms.cmp(&other.overdue_ms))
            .then(other.vault_id.cmp(&self.vault_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn entry(manual: bool, overdue_ms: i64, vault_id: VaultId) -> QueueEntry {
        QueueEntry { manual, overdue_ms, vault_id }
    }

    #[test]
    fn test_manual_beats_overdue() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(false, 1_000_000, 1));
        heap.push(entry(true, 10, 2));

        assert_eq!(heap.pop().unwrap().vault_id, 2);
        assert_eq!(heap.pop().unwrap().vault_id, 1);
    }

    #[test]
    fn test_longest_overdue_first() {
        // Spec scenario: A overdue 120 s, B overdue 90 s, no manual
        // trigger: A dispatches first.
        let mut heap = BinaryHeap::new();
        heap.push(entry(false, 90_000, 2));
        heap.push(entry(false, 120_000, 1));

        assert_eq!(heap.pop().unwrap().vault_id, 1);
        assert_eq!(heap.pop().unwrap().vault_id, 2);
    }

    #[test]
    fn test_never_synced_sorts_first() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(false, 5_000, 1));
        heap.push(entry(false, i64::MAX, 2));
        assert_eq!(heap.pop().unwrap().vault_id, 2);
    }

    #[test]
    fn test_tie_breaks_by_vault_id() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(false, 1000, 9));
        heap.push(entry(false, 1000, 3));
        assert_eq!(heap.pop().unwrap().vault_id, 3);
    }
}
