//! Roles, assignments and path-scoped overrides
//!
//! Capability bit semantics live in `vaulthalla-rbac`; the store carries
//! the raw bits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vaulthalla_core::types::{GroupId, RoleId, UserId, VaultId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    /// Process-wide capabilities (manage users, manage vaults, ...)
    User,
    /// Per-vault capabilities (list, download, delete, share, ...)
    Vault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub role_type: RoleType,
    /// Capability bitset
    pub permissions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    User,
    Group,
}

/// Who an assignment applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectType,
    pub id: u32,
}

impl Subject {
    pub fn user(id: UserId) -> Self {
        Self { kind: SubjectType::User, id }
    }

    pub fn group(id: GroupId) -> Self {
        Self { kind: SubjectType::Group, id }
    }
}

/// Links a subject to a role, optionally scoped to a vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: u32,
    pub subject: Subject,
    pub role_id: RoleId,
    pub vault_id: Option<VaultId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideEffect {
    Allow,
    Deny,
}

/// Path-scoped Allow/Deny modifier on a role assignment.
///
/// `pattern` is the regex source; compilation happens at load in the rbac
/// crate and invalid patterns are rejected at insertion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOverride {
    pub id: u32,
    pub assignment_id: u32,
    /// Single capability bit the override touches
    pub capability_bit: u64,
    pub pattern: String,
    pub effect: OverrideEffect,
    pub enabled: bool,
}

/// Draft for override insertion
#[derive(Debug, Clone)]
pub struct NewOverride {
    pub assignment_id: u32,
    pub capability_bit: u64,
    pub pattern: String,
    pub effect: OverrideEffect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
