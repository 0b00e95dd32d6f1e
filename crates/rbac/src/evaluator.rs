//! The permission evaluator
//!
//! A pure function of the snapshot: no store access, no mutable state.
//!
//! Order of decision:
//! 1. SuperAdmin short-circuits to allow.
//! 2. Global capabilities evaluate against the process-wide role only.
//! 3. base = direct vault role ∪ all group vault roles.
//! 4. Overrides whose pattern matches the path, direct level before group
//!    level; within a level a Deny beats an Allow. A level that touches
//!    the capability decides it.
//! 5. The resulting capability bit allows or denies.

use crate::capability::Operation;
use crate::overrides::CompiledOverride;
use crate::snapshot::PermissionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

pub fn evaluate(snapshot: &PermissionSnapshot, operation: Operation, path: &str) -> Decision {
    if snapshot.is_super_admin() {
        return Decision::Allow;
    }

    let capability = operation.capability();

    if capability.is_global() {
        return if snapshot.global.contains(capability) {
            Decision::Allow
        } else {
            Decision::Deny
        };
    }

    let mut base = snapshot
        .direct
        .as_ref()
        .map(|g| g.capabilities)
        .unwrap_or_default();
    for group in &snapshot.groups {
        base = base.union(group.capabilities);
    }

    let bit = capability.bit();
    let direct_overrides: &[CompiledOverride] = snapshot
        .direct
        .as_ref()
        .map(|g| g.overrides.as_slice())
        .unwrap_or(&[]);
    let group_overrides: Vec<&CompiledOverride> =
        snapshot.groups.iter().flat_map(|g| g.overrides.iter()).collect();

    let effective = level_verdict(direct_overrides.iter(), bit, path)
        .or_else(|| level_verdict(group_overrides.into_iter(), bit, path))
        .unwrap_or_else(|| base.contains_bit(bit));

    if effective {
        Decision::Allow
    } else {
        Decision::Deny
    }
}

/// Verdict of one precedence level: `None` when no override touches the
/// capability at this level, otherwise Deny-wins-over-Allow.
fn level_verdict<'a, I>(overrides: I, capability_bit: u64, path: &str) -> Option<bool>
where
    I: IntoIterator<Item = &'a CompiledOverride>,
{
    let mut verdict = None;
    for over in overrides {
        if !over.matches(capability_bit, path) {
            continue;
        }
        match over.effect {
            vaulthalla_store::model::OverrideEffect::Deny => return Some(false),
            vaulthalla_store::model::OverrideEffect::Allow => verdict = Some(true),
        }
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilitySet};
    use crate::snapshot::VaultRoleGrant;
    use vaulthalla_store::model::{OverrideEffect, PermissionOverride};

    fn over(bit: u64, pattern: &str, effect: OverrideEffect) -> CompiledOverride {
        CompiledOverride::compile(&PermissionOverride {
            id: 0,
            assignment_id: 0,
            capability_bit: bit,
            pattern: pattern.to_string(),
            effect,
            enabled: true,
        })
        .unwrap()
    }

    fn snapshot_with_direct(grant: VaultRoleGrant) -> PermissionSnapshot {
        PermissionSnapshot {
            user_id: 1,
            global: CapabilitySet::EMPTY,
            direct: Some(grant),
            groups: Vec::new(),
        }
    }

    #[test]
    fn test_super_admin_short_circuits() {
        let snapshot = PermissionSnapshot {
            user_id: 1,
            global: CapabilitySet::of(&[Capability::SuperAdmin]),
            direct: None,
            groups: Vec::new(),
        };
        assert!(evaluate(&snapshot, Operation::Delete, "/anything").is_allowed());
        assert!(evaluate(&snapshot, Operation::ManageUsers, "/").is_allowed());
    }

    #[test]
    fn test_global_capability_ignores_vault_grants() {
        let mut snapshot = snapshot_with_direct(VaultRoleGrant {
            capabilities: CapabilitySet::all_vault(),
            overrides: Vec::new(),
        });
        assert_eq!(evaluate(&snapshot, Operation::ManageVaults, "/"), Decision::Deny);

        snapshot.global = CapabilitySet::of(&[Capability::ManageVaults]);
        assert_eq!(evaluate(&snapshot, Operation::ManageVaults, "/"), Decision::Allow);
    }

    #[test]
    fn test_deny_override_scopes_by_path() {
        // Spec scenario: read-write role, Deny Download on ^/secret/.
        let snapshot = snapshot_with_direct(VaultRoleGrant {
            capabilities: CapabilitySet::all_vault(),
            overrides: vec![over(Capability::Download.bit(), "^/secret/", OverrideEffect::Deny)],
        });

        assert_eq!(
            evaluate(&snapshot, Operation::Download, "/secret/x.txt"),
            Decision::Deny
        );
        assert_eq!(
            evaluate(&snapshot, Operation::Download, "/public/x.txt"),
            Decision::Allow
        );
        // Other capabilities under the same path stay untouched.
        assert_eq!(
            evaluate(&snapshot, Operation::List, "/secret/x.txt"),
            Decision::Allow
        );
    }

    #[test]
    fn test_deny_beats_allow_at_same_level() {
        let snapshot = snapshot_with_direct(VaultRoleGrant {
            capabilities: CapabilitySet::EMPTY,
            overrides: vec![
                over(Capability::Download.bit(), "^/shared/", OverrideEffect::Allow),
                over(Capability::Download.bit(), "^/shared/hr/", OverrideEffect::Deny),
            ],
        });

        assert_eq!(
            evaluate(&snapshot, Operation::Download, "/shared/hr/pay.txt"),
            Decision::Deny
        );
        assert_eq!(
            evaluate(&snapshot, Operation::Download, "/shared/notes.txt"),
            Decision::Allow
        );
    }

    #[test]
    fn test_direct_level_decides_before_group_level() {
        let snapshot = PermissionSnapshot {
            user_id: 1,
            global: CapabilitySet::EMPTY,
            direct: Some(VaultRoleGrant {
                capabilities: CapabilitySet::EMPTY,
                overrides: vec![over(
                    Capability::Download.bit(),
                    "^/x/",
                    OverrideEffect::Allow,
                )],
            }),
            groups: vec![VaultRoleGrant {
                capabilities: CapabilitySet::EMPTY,
                overrides: vec![over(Capability::Download.bit(), "^/x/", OverrideEffect::Deny)],
            }],
        };

        // The direct Allow settles the capability; the group Deny is never
        // consulted.
        assert_eq!(evaluate(&snapshot, Operation::Download, "/x/a"), Decision::Allow);
    }

    #[test]
    fn test_group_roles_contribute_to_base() {
        let snapshot = PermissionSnapshot {
            user_id: 1,
            global: CapabilitySet::EMPTY,
            direct: None,
            groups: vec![VaultRoleGrant {
                capabilities: CapabilitySet::of(&[Capability::ListEntries]),
                overrides: Vec::new(),
            }],
        };
        assert_eq!(evaluate(&snapshot, Operation::List, "/"), Decision::Allow);
        assert_eq!(evaluate(&snapshot, Operation::Download, "/"), Decision::Deny);
    }

    #[test]
    fn test_removing_capability_never_grants() {
        // Permission monotonicity: dropping a bit from the base can only
        // shrink the allowed set.
        let wide = snapshot_with_direct(VaultRoleGrant {
            capabilities: CapabilitySet::all_vault(),
            overrides: Vec::new(),
        });
        let narrow = snapshot_with_direct(VaultRoleGrant {
            capabilities: CapabilitySet::all_vault().without(Capability::Delete),
            overrides: Vec::new(),
        });

        for op in [Operation::List, Operation::Download, Operation::Delete] {
            let before = evaluate(&wide, op, "/a").is_allowed();
            let after = evaluate(&narrow, op, "/a").is_allowed();
            assert!(before || !after, "narrowing granted {op:?}");
        }
        assert_eq!(evaluate(&narrow, Operation::Delete, "/a"), Decision::Deny);
    }

    #[test]
    fn test_adding_deny_only_reduces() {
        let without_deny = snapshot_with_direct(VaultRoleGrant {
            capabilities: CapabilitySet::all_vault(),
            overrides: Vec::new(),
        });
        let with_deny = snapshot_with_direct(VaultRoleGrant {
            capabilities: CapabilitySet::all_vault(),
            overrides: vec![over(Capability::Upload.bit(), "^/ro/", OverrideEffect::Deny)],
        });

        for path in ["/ro/f", "/rw/f"] {
            for op in [Operation::Upload, Operation::Download] {
                let before = evaluate(&without_deny, op, path).is_allowed();
                let after = evaluate(&with_deny, op, path).is_allowed();
                assert!(before || !after, "deny widened access for {op:?} at {path}");
            }
        }
        assert_eq!(evaluate(&with_deny, Operation::Upload, "/ro/f"), Decision::Deny);
    }

    #[test]
    fn test_disabled_override_is_inert() {
        let mut deny = over(Capability::Download.bit(), "^/secret/", OverrideEffect::Deny);
        deny.enabled = false;
        let snapshot = snapshot_with_direct(VaultRoleGrant {
            capabilities: CapabilitySet::all_vault(),
            overrides: vec![deny],
        });
        assert_eq!(
            evaluate(&snapshot, Operation::Download, "/secret/x"),
            Decision::Allow
        );
    }
}
