//! Persisted record types

pub mod api_key;
pub mod fs;
pub mod rbac;
pub mod secret;
pub mod sync;
pub mod token;
pub mod user;
pub mod vault;
pub mod waiver;

pub use api_key::{ApiKey, NewApiKey};
pub use fs::{CacheEntry, EntryKind, FileMeta, FsEntry, NewEntry, TrashedFile};
pub use rbac::{
    Group, NewOverride, OverrideEffect, PermissionOverride, Role, RoleAssignment, RoleType,
    Subject, SubjectType,
};
pub use secret::InternalSecret;
pub use sync::{FsSyncPolicy, RsSyncPolicy, SyncEvent, SyncPolicy};
pub use token::RefreshTokenRecord;
pub use user::{NewUser, User};
pub use vault::{NewVault, S3Settings, TrashedVaultKey, Vault, VaultKey};
pub use waiver::Waiver;
