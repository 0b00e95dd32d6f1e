//! # Vaulthalla RBAC
//!
//! Capability bitsets, permission snapshots and the pure path-scoped
//! evaluator that authorises every filesystem and admin operation.

pub mod capability;
pub mod evaluator;
pub mod overrides;
pub mod snapshot;

pub use capability::{Capability, CapabilitySet, Operation};
pub use evaluator::{evaluate, Decision};
pub use overrides::{validate_pattern, CompiledOverride};
pub use snapshot::{build_snapshot, PermissionSnapshot, VaultRoleGrant};
