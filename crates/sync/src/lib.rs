//! # Vaulthalla sync
//!
//! The sync controller and its per-vault workers: a max-priority queue of
//! tasks (manual triggers first, then longest overdue), a bounded worker
//! pool, deterministic diff application, and the online re-encryption
//! walk that completes key rotations.

pub mod controller;
pub mod diff;
pub mod local;
pub mod remote;
pub mod rotation;
pub mod task;

pub use controller::SyncController;
pub use diff::{diff_remote, order_changes, Change, ChangeKind, RemoteDiff};
pub use task::{QueueEntry, SyncTask};
