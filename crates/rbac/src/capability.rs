//! Capability bits
//!
//! Process-wide capabilities occupy the low bits; per-vault capabilities
//! start at bit 16. Roles persist the raw bitset.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    // Process-wide
    SuperAdmin,
    ManageUsers,
    ManageGroups,
    ManageRoles,
    ManageVaults,
    ManageEncryptionKeys,
    ManageApiKeys,
    ManageSettings,

    // Per-vault
    ListEntries,
    Download,
    Upload,
    Delete,
    MoveEntry,
    RenameEntry,
    CopyEntry,
    CreateDirectory,
    Share,
    SyncVault,
    ManageVaultSettings,
}

impl Capability {
    pub fn bit(self) -> u64 {
        match self {
            Capability::SuperAdmin => 1 << 0,
            Capability::ManageUsers => 1 << 1,
            Capability::ManageGroups => 1 << 2,
            Capability::ManageRoles => 1 << 3,
            Capability::ManageVaults => 1 << 4,
            Capability::ManageEncryptionKeys => 1 << 5,
            Capability::ManageApiKeys => 1 << 6,
            Capability::ManageSettings => 1 << 7,

            Capability::ListEntries => 1 << 16,
            Capability::Download => 1 << 17,
            Capability::Upload => 1 << 18,
            Capability::Delete => 1 << 19,
            Capability::MoveEntry => 1 << 20,
            Capability::RenameEntry => 1 << 21,
            Capability::CopyEntry => 1 << 22,
            Capability::CreateDirectory => 1 << 23,
            Capability::Share => 1 << 24,
            Capability::SyncVault => 1 << 25,
            Capability::ManageVaultSettings => 1 << 26,
        }
    }

    /// Whether the capability is evaluated against the process-wide role
    /// only.
    pub fn is_global(self) -> bool {
        self.bit() < (1 << 16)
    }

    /// The snake_case token used on admin surfaces.
    pub fn name(self) -> &'static str {
        match self {
            Capability::SuperAdmin => "super_admin",
            Capability::ManageUsers => "manage_users",
            Capability::ManageGroups => "manage_groups",
            Capability::ManageRoles => "manage_roles",
            Capability::ManageVaults => "manage_vaults",
            Capability::ManageEncryptionKeys => "manage_encryption_keys",
            Capability::ManageApiKeys => "manage_api_keys",
            Capability::ManageSettings => "manage_settings",
            Capability::ListEntries => "list_entries",
            Capability::Download => "download",
            Capability::Upload => "upload",
            Capability::Delete => "delete",
            Capability::MoveEntry => "move_entry",
            Capability::RenameEntry => "rename_entry",
            Capability::CopyEntry => "copy_entry",
            Capability::CreateDirectory => "create_directory",
            Capability::Share => "share",
            Capability::SyncVault => "sync_vault",
            Capability::ManageVaultSettings => "manage_vault_settings",
        }
    }

    pub const ALL_VAULT: &'static [Capability] = &[
        Capability::ListEntries,
        Capability::Download,
        Capability::Upload,
        Capability::Delete,
        Capability::MoveEntry,
        Capability::RenameEntry,
        Capability::CopyEntry,
        Capability::CreateDirectory,
        Capability::Share,
        Capability::SyncVault,
        Capability::ManageVaultSettings,
    ];
}

impl std::str::FromStr for Capability {
    type Err = vaulthalla_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: &[Capability] = &[
            Capability::SuperAdmin,
            Capability::ManageUsers,
            Capability::ManageGroups,
            Capability::ManageRoles,
            Capability::ManageVaults,
            Capability::ManageEncryptionKeys,
            Capability::ManageApiKeys,
            Capability::ManageSettings,
            Capability::ListEntries,
            Capability::Download,
            Capability::Upload,
            Capability::Delete,
            Capability::MoveEntry,
            Capability::RenameEntry,
            Capability::CopyEntry,
            Capability::CreateDirectory,
            Capability::Share,
            Capability::SyncVault,
            Capability::ManageVaultSettings,
        ];
        ALL.iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| {
                vaulthalla_core::Error::Validation(format!("unknown capability '{s}'"))
            })
    }
}

/// A set of capability bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(pub u64);

impl CapabilitySet {
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn of(capabilities: &[Capability]) -> Self {
        Self(capabilities.iter().fold(0, |acc, c| acc | c.bit()))
    }

    /// Every per-vault capability set (a full read-write vault role).
    pub fn all_vault() -> Self {
        Self::of(Capability::ALL_VAULT)
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn contains_bit(self, bit: u64) -> bool {
        self.0 & bit != 0
    }

    #[must_use]
    pub fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    #[must_use]
    pub fn without(self, capability: Capability) -> Self {
        Self(self.0 & !capability.bit())
    }

    #[must_use]
    pub fn union(self, other: CapabilitySet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Maps each authorised operation onto its capability and scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    // Per-vault, path-aware
    List,
    Download,
    Upload,
    Delete,
    Move,
    Rename,
    Copy,
    Mkdir,
    Share,
    Sync,
    ManageVaultSettings,

    // Process-wide
    ManageUsers,
    ManageGroups,
    ManageRoles,
    ManageVaults,
    ManageEncryptionKeys,
    ManageApiKeys,
    ManageSettings,
}

impl Operation {
    pub fn capability(self) -> Capability {
        match self {
            Operation::List => Capability::ListEntries,
            Operation::Download => Capability::Download,
            Operation::Upload => Capability::Upload,
            Operation::Delete => Capability::Delete,
            Operation::Move => Capability::MoveEntry,
            Operation::Rename => Capability::RenameEntry,
            Operation::Copy => Capability::CopyEntry,
            Operation::Mkdir => Capability::CreateDirectory,
            Operation::Share => Capability::Share,
            Operation::Sync => Capability::SyncVault,
            Operation::ManageVaultSettings => Capability::ManageVaultSettings,

            Operation::ManageUsers => Capability::ManageUsers,
            Operation::ManageGroups => Capability::ManageGroups,
            Operation::ManageRoles => Capability::ManageRoles,
            Operation::ManageVaults => Capability::ManageVaults,
            Operation::ManageEncryptionKeys => Capability::ManageEncryptionKeys,
            Operation::ManageApiKeys => Capability::ManageApiKeys,
            Operation::ManageSettings => Capability::ManageSettings,
        }
    }

    pub fn is_global(self) -> bool {
        self.capability().is_global()
    }
}
