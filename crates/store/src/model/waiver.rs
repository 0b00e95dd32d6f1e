//! Destructive-change waivers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vaulthalla_core::types::{ApiKeyId, RoleId, UserId, VaultId};

/// Append-only audit record required before a destructive encryption-state
/// change on a non-empty S3 bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waiver {
    pub id: u64,
    pub vault_id: VaultId,
    pub user_id: UserId,
    pub api_key_id: ApiKeyId,
    /// The encryption state the user accepted
    pub encrypt_upstream: bool,
    pub waiver_text: String,
    /// Role that allowed the actor to override, when not the owner
    pub overriding_role: Option<RoleId>,
    pub created_at: DateTime<Utc>,
}
