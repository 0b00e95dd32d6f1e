//! Sync policy and event history records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use vaulthalla_core::types::{
    FsConflictPolicy, RsConflictPolicy, SyncOutcome, SyncStrategy, SyncTrigger, VaultId,
};

/// Per-vault reconciliation policy, a tagged sum over the backend variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncPolicy {
    Fs(FsSyncPolicy),
    Rs(RsSyncPolicy),
}

impl SyncPolicy {
    pub fn interval(&self) -> Duration {
        let secs = match self {
            SyncPolicy::Fs(p) => p.interval_secs,
            SyncPolicy::Rs(p) => p.interval_secs,
        };
        Duration::seconds(secs as i64)
    }

    pub fn default_fs(interval_secs: u64) -> Self {
        SyncPolicy::Fs(FsSyncPolicy {
            interval_secs,
            conflict_policy: FsConflictPolicy::Overwrite,
        })
    }

    pub fn default_rs(interval_secs: u64) -> Self {
        SyncPolicy::Rs(RsSyncPolicy {
            interval_secs,
            strategy: SyncStrategy::Cache,
            conflict_policy: RsConflictPolicy::KeepLocal,
        })
    }
}

/// Local-disk vault reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsSyncPolicy {
    pub interval_secs: u64,
    pub conflict_policy: FsConflictPolicy,
}

/// S3 vault reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsSyncPolicy {
    pub interval_secs: u64,
    pub strategy: SyncStrategy,
    pub conflict_policy: RsConflictPolicy,
}

/// One sync task run, retained for a configured window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: u64,
    pub vault_id: VaultId,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<SyncOutcome>,
    pub error: Option<String>,
}
