//! Permission snapshots
//!
//! The evaluator is a pure function over a snapshot; callers build the
//! snapshot inside the same transaction as the operation being authorised
//! so a concurrent revocation cannot slip between check and use.

use vaulthalla_core::types::{UserId, VaultId};
use vaulthalla_core::Result;
use vaulthalla_store::model::{Subject, User};
use vaulthalla_store::RbacStore;

use crate::capability::{Capability, CapabilitySet};
use crate::overrides::CompiledOverride;

/// A vault role granted to the user (directly or through a group), with
/// its compiled overrides.
#[derive(Debug, Clone, Default)]
pub struct VaultRoleGrant {
    pub capabilities: CapabilitySet,
    pub overrides: Vec<CompiledOverride>,
}

/// Everything the evaluator needs for one `(user, vault)` pair.
#[derive(Debug, Clone, Default)]
pub struct PermissionSnapshot {
    pub user_id: UserId,
    /// Process-wide role bits
    pub global: CapabilitySet,
    /// Direct per-vault assignment, if any
    pub direct: Option<VaultRoleGrant>,
    /// One grant per group membership with a matching vault assignment
    pub groups: Vec<VaultRoleGrant>,
}

impl PermissionSnapshot {
    pub fn is_super_admin(&self) -> bool {
        self.global.contains(Capability::SuperAdmin)
    }
}

/// Assemble a snapshot for `user` against `vault_id` from the store.
pub async fn build_snapshot<S>(
    store: &S,
    user: &User,
    vault_id: Option<VaultId>,
) -> Result<PermissionSnapshot>
where
    S: RbacStore + ?Sized,
{
    let global = match store.role(user.role_id).await? {
        Some(role) => CapabilitySet::from_bits(role.permissions),
        None => CapabilitySet::EMPTY,
    };

    let mut snapshot = PermissionSnapshot {
        user_id: user.id,
        global,
        direct: None,
        groups: Vec::new(),
    };

    let Some(vault_id) = vault_id else {
        return Ok(snapshot);
    };

    snapshot.direct = load_grant(store, Subject::user(user.id), vault_id).await?;

    for group_id in store.groups_for_user(user.id).await? {
        if let Some(grant) = load_grant(store, Subject::group(group_id), vault_id).await? {
            snapshot.groups.push(grant);
        }
    }

    Ok(snapshot)
}

async fn load_grant<S>(
    store: &S,
    subject: Subject,
    vault_id: VaultId,
) -> Result<Option<VaultRoleGrant>>
where
    S: RbacStore + ?Sized,
{
    let mut grant: Option<VaultRoleGrant> = None;

    for assignment in store.assignments_for_subject(subject).await? {
        // An unscoped assignment applies to every vault.
        if assignment.vault_id.is_some() && assignment.vault_id != Some(vault_id) {
            continue;
        }
        let Some(role) = store.role(assignment.role_id).await? else {
            continue;
        };

        let slot = grant.get_or_insert_with(VaultRoleGrant::default);
        slot.capabilities = slot
            .capabilities
            .union(CapabilitySet::from_bits(role.permissions));
        for row in store.overrides_for_assignment(assignment.id).await? {
            slot.overrides.push(CompiledOverride::compile(&row)?);
        }
    }

    Ok(grant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_store::model::{NewOverride, NewUser, OverrideEffect, RoleType};
    use vaulthalla_store::{MemoryStore, RbacStore, UserStore};

    #[tokio::test]
    async fn test_snapshot_merges_direct_and_group_grants() {
        let store = MemoryStore::new();

        let user_role = store.create_role("user", RoleType::User, 0).await.unwrap();
        let reader = store
            .create_role("reader", RoleType::Vault, Capability::Download.bit())
            .await
            .unwrap();
        let lister = store
            .create_role("lister", RoleType::Vault, Capability::ListEntries.bit())
            .await
            .unwrap();

        let user = store
            .create_user(NewUser {
                name: "alice".into(),
                email: "a@ex.com".into(),
                password_hash: "h".into(),
                role_id: user_role.id,
            })
            .await
            .unwrap();

        let group = store.create_group("staff").await.unwrap();
        store.add_group_member(group.id, user.id).await.unwrap();

        let direct = store
            .create_assignment(Subject::user(user.id), reader.id, Some(3))
            .await
            .unwrap();
        store
            .create_override(NewOverride {
                assignment_id: direct.id,
                capability_bit: Capability::Download.bit(),
                pattern: "^/secret/".into(),
                effect: OverrideEffect::Deny,
            })
            .await
            .unwrap();
        store
            .create_assignment(Subject::group(group.id), lister.id, Some(3))
            .await
            .unwrap();

        let snapshot = build_snapshot(&store, &user, Some(3)).await.unwrap();
        let direct = snapshot.direct.expect("direct grant present");
        assert!(direct.capabilities.contains(Capability::Download));
        assert_eq!(direct.overrides.len(), 1);
        assert_eq!(snapshot.groups.len(), 1);
        assert!(snapshot.groups[0].capabilities.contains(Capability::ListEntries));
    }

    #[tokio::test]
    async fn test_assignment_for_other_vault_ignored() {
        let store = MemoryStore::new();
        let user_role = store.create_role("user", RoleType::User, 0).await.unwrap();
        let reader = store
            .create_role("reader", RoleType::Vault, Capability::Download.bit())
            .await
            .unwrap();
        let user = store
            .create_user(NewUser {
                name: "bob".into(),
                email: "b@ex.com".into(),
                password_hash: "h".into(),
                role_id: user_role.id,
            })
            .await
            .unwrap();
        store
            .create_assignment(Subject::user(user.id), reader.id, Some(9))
            .await
            .unwrap();

        let snapshot = build_snapshot(&store, &user, Some(3)).await.unwrap();
        assert!(snapshot.direct.is_none());
    }
}
