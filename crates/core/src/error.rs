//! Core error taxonomy for Vaulthalla

use thiserror::Error;

/// Result type alias using Vaulthalla's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all Vaulthalla modules
///
/// These are kinds, not transport shapes: the request dispatcher maps each
/// kind onto a response envelope and never leaks internals to the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller input was rejected (weak password, malformed path, unknown
    /// vault type). Surfaced verbatim, never logged above info.
    #[error("validation error: {0}")]
    Validation(String),

    /// The permission evaluator denied the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-constraint or concurrent-update clash.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend I/O, network or transient database failure. Retryable.
    #[error("transient error: {0}")]
    Transient(String),

    /// A transient failure that survived every retry attempt.
    #[error("backend error: {0}")]
    Backend(String),

    /// AEAD tag mismatch, malformed sealed blob, hash mismatch. Never
    /// retried.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// No active data key row exists for the vault.
    #[error("no data key found for vault {0}")]
    KeyMissing(u32),

    /// A ciphertext is stamped with a key version the engine cannot serve.
    /// The owning file gets quarantined.
    #[error("unknown key version {version} for vault {vault_id}")]
    UnknownKeyVersion { vault_id: u32, version: u32 },

    /// No or invalid session/token; the client must re-authenticate.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected failure; callers get a generic message, logs get detail.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the storage retry loop may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Authentication failures abort backend retries immediately.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Unauthorized(_))
    }

    /// Stable machine-readable code used in response envelopes and audit
    /// lines.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Transient(_) => "transient",
            Error::Backend(_) => "backend",
            Error::Corrupt(_) => "corrupt",
            Error::KeyMissing(_) => "key_missing",
            Error::UnknownKeyVersion { .. } => "unknown_key_version",
            Error::Unauthorized(_) => "unauthorized",
            Error::Configuration(_) => "configuration",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("socket reset".into()).is_transient());
        assert!(!Error::Corrupt("tag mismatch".into()).is_transient());
        assert!(!Error::Backend("gave up".into()).is_transient());
    }

    #[test]
    fn test_auth_failures_are_fatal_to_retries() {
        assert!(Error::Unauthorized("bad credentials".into()).is_auth_failure());
        assert!(!Error::Transient("timeout".into()).is_auth_failure());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Validation("x".into()).code(), "validation");
        assert_eq!(Error::Forbidden("x".into()).code(), "forbidden");
        assert_eq!(
            Error::UnknownKeyVersion { vault_id: 7, version: 2 }.code(),
            "unknown_key_version"
        );
        assert_eq!(Error::KeyMissing(3).code(), "key_missing");
    }
}
