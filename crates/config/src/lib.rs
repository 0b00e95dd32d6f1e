//! Vaulthalla configuration system
//!
//! TOML-based configuration loaded from `/etc/vaulthalla/config.toml` by
//! default. No environment variable is mandatory; setting
//! `VAULTHALLA_TEST_MODE=1` relocates every state path under a sandbox
//! prefix so tests and CI never touch real state.
//!
//! # Example config.toml
//!
//! ```toml
//! [paths]
//! secrets_dir = "/var/lib/vaulthalla/secrets"
//! data_dir = "/var/lib/vaulthalla/data"
//! cache_dir = "/var/cache/vaulthalla"
//! ctl_socket = "/run/vaulthalla/ctl.sock"
//!
//! [auth]
//! access_token_ttl_secs = 3600
//! refresh_token_ttl_days = 7
//!
//! [services]
//! lifecycle_sweep_interval_secs = 60
//! sync_worker_pool_size = 4
//!
//! [database]
//! url = "postgres://vaulthalla@localhost/vaulthalla"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Errors that can occur during configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Environment flag that relocates all state paths under a sandbox prefix.
pub const TEST_MODE_ENV: &str = "VAULTHALLA_TEST_MODE";

/// Default configuration file location.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/vaulthalla/config.toml")
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub auth: AuthConfig,
    pub services: ServicesConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Front-end listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket front end binds to
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8527".to_string(),
        }
    }
}

/// State directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding per-name sealed master-key blobs
    pub secrets_dir: PathBuf,
    /// Backing trees for local vaults
    pub data_dir: PathBuf,
    /// Content-addressed cache for S3 vaults
    pub cache_dir: PathBuf,
    /// Unix-domain socket for the admin channel
    pub ctl_socket: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            secrets_dir: PathBuf::from("/var/lib/vaulthalla/secrets"),
            data_dir: PathBuf::from("/var/lib/vaulthalla/data"),
            cache_dir: PathBuf::from("/var/cache/vaulthalla"),
            ctl_socket: PathBuf::from("/run/vaulthalla/ctl.sock"),
        }
    }
}

/// Authentication and token lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// JWT issuer for both access and refresh tokens
    pub jwt_issuer: String,
    /// Access token lifetime (default 60 minutes)
    pub access_token_ttl_secs: u64,
    /// Refresh token lifetime (default 7 days)
    pub refresh_token_ttl_days: u64,
    /// Newline-separated dictionary words, one file path per entry
    pub dictionary_path: Option<PathBuf>,
    /// Known weak passwords, lowercased, one per line
    pub weak_passwords_path: Option<PathBuf>,
    /// Breached-password corpus as uppercase SHA-1 hex digests
    pub pwned_sha1_path: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_issuer: "Vaulthalla".to_string(),
            access_token_ttl_secs: 3600,
            refresh_token_ttl_days: 7,
            dictionary_path: None,
            weak_passwords_path: None,
            pwned_sha1_path: None,
        }
    }
}

/// Background service tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Connection lifecycle sweep cadence
    pub lifecycle_sweep_interval_secs: u64,
    /// How long an unauthenticated session may stay open
    pub unauthenticated_timeout_secs: u64,
    /// Idle timeout for authenticated-but-silent connections
    pub idle_timeout_mins: u64,
    /// Concurrent sync workers
    pub sync_worker_pool_size: usize,
    /// Default per-vault sync interval
    pub sync_interval_secs: u64,
    /// Janitor sweep cadence
    pub janitor_interval_secs: u64,
    /// Sync event retention window
    pub sync_event_retention_days: i64,
    /// Sync event retention cap (whichever comes first)
    pub sync_event_retention_max: usize,
    /// Trashed file retention before the janitor reclaims space
    pub trash_retention_days: i64,
    /// Admin group gid for the ctl socket peer check
    pub ctl_admin_gid: u32,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            lifecycle_sweep_interval_secs: 60,
            unauthenticated_timeout_secs: 120,
            idle_timeout_mins: 30,
            sync_worker_pool_size: 4,
            sync_interval_secs: 300,
            janitor_interval_secs: 3600,
            sync_event_retention_days: 30,
            sync_event_retention_max: 10_000,
            trash_retention_days: 14,
            ctl_admin_gid: 0,
        }
    }
}

/// Storage engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Cap on the S3 local cache before LRU eviction kicks in
    pub cache_cap_bytes: u64,
    /// Backend I/O retry attempts
    pub retry_max_attempts: u32,
    /// Initial retry backoff in milliseconds
    pub retry_initial_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_cap_bytes: 10 * 1024 * 1024 * 1024,
            retry_max_attempts: 3,
            retry_initial_backoff_ms: 100,
        }
    }
}

/// Relational store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://vaulthalla@localhost/vaulthalla".to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (compact, pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Config {
    /// Load from an explicit path, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Config::default()
        };

        if std::env::var(TEST_MODE_ENV).map(|v| v == "1").unwrap_or(false) {
            config.relocate_under(&std::env::temp_dir().join("vaulthalla-test"));
        }

        config.validate()?;
        Ok(config)
    }

    /// Move every state path under `prefix`, preserving the relative layout.
    pub fn relocate_under(&mut self, prefix: &Path) {
        self.paths.secrets_dir = prefix.join("secrets");
        self.paths.data_dir = prefix.join("data");
        self.paths.cache_dir = prefix.join("cache");
        self.paths.ctl_socket = prefix.join("ctl.sock");
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.sync_worker_pool_size == 0 {
            return Err(ConfigError::Validation(
                "services.sync_worker_pool_size must be at least 1".into(),
            ));
        }
        if self.auth.access_token_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "auth.access_token_ttl_secs must be positive".into(),
            ));
        }
        if self.storage.retry_max_attempts == 0 {
            return Err(ConfigError::Validation(
                "storage.retry_max_attempts must be at least 1".into(),
            ));
        }
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "logging.level '{other}' is not one of error|warn|info|debug|trace"
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auth.access_token_ttl_secs, 3600);
        assert_eq!(config.auth.refresh_token_ttl_days, 7);
        assert_eq!(config.services.lifecycle_sweep_interval_secs, 60);
        assert_eq!(config.services.idle_timeout_mins, 30);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[services]\nsync_worker_pool_size = 8\n\n[logging]\nlevel = \"debug\""
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.services.sync_worker_pool_size, 8);
        assert_eq!(config.logging.level, "debug");
        // untouched sections keep their defaults
        assert_eq!(config.database.max_connections, 10);
    }

    #[test]
    fn test_invalid_pool_size_rejected() {
        let mut config = Config::default();
        config.services.sync_worker_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relocate_under_prefix() {
        let mut config = Config::default();
        config.relocate_under(Path::new("/tmp/sandbox"));
        assert_eq!(config.paths.secrets_dir, Path::new("/tmp/sandbox/secrets"));
        assert_eq!(config.paths.ctl_socket, Path::new("/tmp/sandbox/ctl.sock"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/vaulthalla.toml")).unwrap();
        assert_eq!(config.auth.jwt_issuer, "Vaulthalla");
    }
}
