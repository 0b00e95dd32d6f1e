//! Compiled permission overrides
//!
//! Patterns compile once at snapshot load and re-compile on update;
//! invalid patterns are rejected at insertion time, never at evaluation.

use regex::Regex;
use vaulthalla_core::{Error, Result};
use vaulthalla_store::model::{OverrideEffect, PermissionOverride};

/// An override with its pattern compiled, ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledOverride {
    pub capability_bit: u64,
    pub effect: OverrideEffect,
    pub enabled: bool,
    /// Original pattern source, kept beside the compiled form
    pub source: String,
    pub regex: Regex,
}

impl CompiledOverride {
    pub fn compile(row: &PermissionOverride) -> Result<Self> {
        let regex = Regex::new(&row.pattern).map_err(|e| {
            Error::Internal(format!(
                "stored override {} carries an invalid pattern '{}': {e}",
                row.id, row.pattern
            ))
        })?;
        Ok(Self {
            capability_bit: row.capability_bit,
            effect: row.effect,
            enabled: row.enabled,
            source: row.pattern.clone(),
            regex,
        })
    }

    pub fn matches(&self, capability_bit: u64, path: &str) -> bool {
        self.enabled && self.capability_bit == capability_bit && self.regex.is_match(path)
    }
}

/// Validate a pattern before it reaches the store.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::Validation("override pattern must not be empty".into()));
    }
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| Error::Validation(format!("invalid override pattern '{pattern}': {e}")))
}
