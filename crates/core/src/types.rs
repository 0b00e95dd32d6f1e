//! Shared identifiers and wire-level enums
//!
//! Every enum that crosses the ctl surface implements `FromStr`/`Display`
//! with the lowercase token the admin channel uses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

pub type VaultId = u32;
pub type UserId = u32;
pub type GroupId = u32;
pub type RoleId = u32;
pub type ApiKeyId = u32;
pub type EntryId = u64;
pub type KeyVersion = u32;

/// Backing implementation of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultType {
    Local,
    S3,
}

impl fmt::Display for VaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultType::Local => write!(f, "local"),
            VaultType::S3 => write!(f, "s3"),
        }
    }
}

impl FromStr for VaultType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(VaultType::Local),
            "s3" => Ok(VaultType::S3),
            other => Err(Error::Validation(format!("unknown vault type: '{other}'"))),
        }
    }
}

/// What caused a sync task to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Schedule,
    Webhook,
    Manual,
    Startup,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Schedule => write!(f, "schedule"),
            SyncTrigger::Webhook => write!(f, "webhook"),
            SyncTrigger::Manual => write!(f, "manual"),
            SyncTrigger::Startup => write!(f, "startup"),
        }
    }
}

/// Terminal state of a sync task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Success,
    Failed,
    Interrupted,
    /// An `Ask` conflict policy paused the walk pending operator input.
    Suspended,
}

/// How an S3 vault reconciles with its upstream bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Pull on access; sync only pushes local changes.
    Cache,
    /// Bidirectional reconciliation.
    Sync,
    /// One-way push; remote-only entries are deleted.
    Mirror,
}

impl FromStr for SyncStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cache" => Ok(SyncStrategy::Cache),
            "sync" => Ok(SyncStrategy::Sync),
            "mirror" => Ok(SyncStrategy::Mirror),
            other => Err(Error::Validation(format!("unknown sync strategy: '{other}'"))),
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStrategy::Cache => write!(f, "cache"),
            SyncStrategy::Sync => write!(f, "sync"),
            SyncStrategy::Mirror => write!(f, "mirror"),
        }
    }
}

/// Conflict policy for local-disk vault reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FsConflictPolicy {
    Overwrite,
    KeepBoth,
    Ask,
}

impl FromStr for FsConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(FsConflictPolicy::Overwrite),
            "keep-both" => Ok(FsConflictPolicy::KeepBoth),
            "ask" => Ok(FsConflictPolicy::Ask),
            other => Err(Error::Validation(format!(
                "unknown conflict policy: '{other}' (expected overwrite | keep-both | ask)"
            ))),
        }
    }
}

impl fmt::Display for FsConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsConflictPolicy::Overwrite => write!(f, "overwrite"),
            FsConflictPolicy::KeepBoth => write!(f, "keep-both"),
            FsConflictPolicy::Ask => write!(f, "ask"),
        }
    }
}

/// Conflict policy for S3 vault reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RsConflictPolicy {
    KeepLocal,
    KeepRemote,
    Ask,
}

impl FromStr for RsConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep-local" => Ok(RsConflictPolicy::KeepLocal),
            "keep-remote" => Ok(RsConflictPolicy::KeepRemote),
            "ask" => Ok(RsConflictPolicy::Ask),
            other => Err(Error::Validation(format!(
                "unknown conflict policy: '{other}' (expected keep-local | keep-remote | ask)"
            ))),
        }
    }
}

impl fmt::Display for RsConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RsConflictPolicy::KeepLocal => write!(f, "keep-local"),
            RsConflictPolicy::KeepRemote => write!(f, "keep-remote"),
            RsConflictPolicy::Ask => write!(f, "ask"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_type_parse_roundtrip() {
        for ty in [VaultType::Local, VaultType::S3] {
            assert_eq!(ty.to_string().parse::<VaultType>().unwrap(), ty);
        }
        assert!("gcs".parse::<VaultType>().is_err());
    }

    #[test]
    fn test_conflict_policy_tokens() {
        assert_eq!(
            "keep-both".parse::<FsConflictPolicy>().unwrap(),
            FsConflictPolicy::KeepBoth
        );
        assert_eq!(
            "keep-remote".parse::<RsConflictPolicy>().unwrap(),
            RsConflictPolicy::KeepRemote
        );
        assert!("merge".parse::<FsConflictPolicy>().is_err());
    }

    #[test]
    fn test_sync_strategy_serde_tokens() {
        let json = serde_json::to_string(&SyncStrategy::Mirror).unwrap();
        assert_eq!(json, r#""mirror""#);
        let back: SyncStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SyncStrategy::Mirror);
    }
}
