//! # Vaulthalla sealed master-key custody
//!
//! A [`SealedKeyProvider`] owns a single 256-bit master key sealed at rest.
//! Providers are named (`"master"`, `"postgres"`, ...); different names are
//! fully independent key domains with their own sealed blobs.
//!
//! The file-backed implementation seals to
//! `<secrets_dir>/<name>.sealed` with mode 0600 — custody equivalent to a
//! hardware-sealed blob for deployments without one. Hardware sealing is an
//! external collaborator behind the same trait.
//!
//! # Example
//!
//! ```no_run
//! use vaulthalla_sealed_key::{FileSealedKeyProvider, SealedKeyProvider};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = FileSealedKeyProvider::new("master", "/var/lib/vaulthalla/secrets")?;
//! provider.init(None)?; // unseal existing blob, or generate + seal
//! let key = provider.master_key()?;
//! assert_eq!(key.as_bytes().len(), 32);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors that can occur during sealed-key operations
#[derive(Debug, Error)]
pub enum SealedKeyError {
    /// `master_key` was called before `init`
    #[error("sealed key provider '{0}' is not initialized")]
    NotInitialized(String),

    /// Sealed blob exists but is not a valid 32-byte key
    #[error("sealed blob for '{0}' is malformed")]
    CorruptBlob(String),

    #[error("sealed key I/O failure for '{name}': {source}")]
    Io {
        name: String,
        source: std::io::Error,
    },
}

/// Result type for sealed-key operations
pub type Result<T> = std::result::Result<T, SealedKeyError>;

pub const MASTER_KEY_LEN: usize = 32;

/// A 256-bit master key that zeroizes on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Generate a fresh key from OS randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; MASTER_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Custody of a single named master key.
///
/// Implementations must be safe to share across tasks; `init` and
/// `update_master_key` serialize internally.
pub trait SealedKeyProvider: Send + Sync {
    /// The key domain this provider serves.
    fn name(&self) -> &str;

    /// Unseal an existing blob; otherwise seal `initial` if supplied, or
    /// generate 32 random bytes and seal those.
    fn init(&self, initial: Option<[u8; MASTER_KEY_LEN]>) -> Result<()>;

    /// Only valid after `init`.
    fn master_key(&self) -> Result<MasterKey>;

    /// Atomically reseal a new master key. Callers own re-wrapping every
    /// secret that depended on the old one.
    fn update_master_key(&self, key: [u8; MASTER_KEY_LEN]) -> Result<()>;

    fn sealed_exists(&self) -> bool;
}

/// File-backed provider sealing to `<secrets_dir>/<name>.sealed`.
pub struct FileSealedKeyProvider {
    name: String,
    blob_path: PathBuf,
    key: RwLock<Option<MasterKey>>,
}

impl FileSealedKeyProvider {
    pub fn new(name: impl Into<String>, secrets_dir: impl AsRef<Path>) -> Result<Self> {
        let name = name.into();
        let secrets_dir = secrets_dir.as_ref();
        fs::create_dir_all(secrets_dir).map_err(|source| SealedKeyError::Io {
            name: name.clone(),
            source,
        })?;

        let blob_path = secrets_dir.join(format!("{name}.sealed"));
        Ok(Self {
            name,
            blob_path,
            key: RwLock::new(None),
        })
    }

    fn unseal(&self) -> Result<MasterKey> {
        let raw = fs::read(&self.blob_path).map_err(|source| SealedKeyError::Io {
            name: self.name.clone(),
            source,
        })?;
        let bytes: [u8; MASTER_KEY_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| SealedKeyError::CorruptBlob(self.name.clone()))?;
        Ok(MasterKey::from_bytes(bytes))
    }

    /// Write-then-rename so a crash never leaves a torn blob behind.
    fn seal(&self, key: &MasterKey) -> Result<()> {
        let tmp_path = self.blob_path.with_extension("sealed.tmp");
        let io = |source| SealedKeyError::Io {
            name: self.name.clone(),
            source,
        };

        let mut file = fs::File::create(&tmp_path).map_err(io)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600)).map_err(io)?;
        }
        file.write_all(key.as_bytes()).map_err(io)?;
        file.sync_all().map_err(io)?;
        drop(file);

        fs::rename(&tmp_path, &self.blob_path).map_err(io)?;
        Ok(())
    }
}

impl SealedKeyProvider for FileSealedKeyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, initial: Option<[u8; MASTER_KEY_LEN]>) -> Result<()> {
        let mut slot = self.key.write().expect("sealed key lock poisoned");

        let key = if self.blob_path.exists() {
            self.unseal()?
        } else {
            let key = match initial {
                Some(bytes) => MasterKey::from_bytes(bytes),
                None => MasterKey::generate(),
            };
            self.seal(&key)?;
            tracing::info!(provider = %self.name, "sealed new master key");
            key
        };

        *slot = Some(key);
        Ok(())
    }

    fn master_key(&self) -> Result<MasterKey> {
        self.key
            .read()
            .expect("sealed key lock poisoned")
            .clone()
            .ok_or_else(|| SealedKeyError::NotInitialized(self.name.clone()))
    }

    fn update_master_key(&self, bytes: [u8; MASTER_KEY_LEN]) -> Result<()> {
        let mut slot = self.key.write().expect("sealed key lock poisoned");
        let key = MasterKey::from_bytes(bytes);
        self.seal(&key)?;
        *slot = Some(key);
        tracing::info!(provider = %self.name, "master key resealed");
        Ok(())
    }

    fn sealed_exists(&self) -> bool {
        self.blob_path.exists()
    }
}

impl fmt::Debug for FileSealedKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSealedKeyProvider")
            .field("name", &self.name)
            .field("blob_path", &self.blob_path)
            .finish()
    }
}
