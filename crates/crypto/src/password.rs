//! Password hashing and acceptance policy
//!
//! Hashing is Argon2id with moderate cost parameters. The acceptance
//! policy combines a strength score with dictionary, known-weak-pattern
//! and breached-corpus checks; failures accumulate so the caller sees
//! every problem at once.

use std::collections::HashSet;
use std::path::Path;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};
use sha1::{Digest, Sha1};

use vaulthalla_core::{Error, Result};

/// Moderate Argon2id cost: 64 MiB, 3 passes, 1 lane.
fn hasher() -> Argon2<'static> {
    let params = Params::new(64 * 1024, 3, 1, None).expect("static argon2 params are valid");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

/// Derive an Argon2id PHC-format hash with a fresh salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    hasher()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))
}

/// Constant-time verification against a stored PHC-format hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => hasher()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Length/character-class strength score, clamped to 1..=100.
pub fn strength_score(password: &str) -> u16 {
    if password.is_empty() {
        return 1;
    }

    let mut score: u16 = 0;
    let len = password.chars().count();
    if len >= 8 {
        score += 20;
    }
    if len >= 12 {
        score += 10;
    }
    if len >= 16 {
        score += 10;
    }
    if len >= 20 {
        score += 10;
    }

    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password.chars().any(|c| c.is_ascii_punctuation());

    if has_lower {
        score += 15;
    }
    if has_upper {
        score += 15;
    }
    if has_digit {
        score += 15;
    }
    if has_symbol {
        score += 15;
    }

    if !has_upper && !has_digit && !has_symbol {
        score /= 2;
    }

    score.clamp(1, 100)
}

/// Known-weak passwords shipped even when no corpus files are configured.
const BUILTIN_WEAK: &[&str] = &[
    "password", "passwort", "123456", "12345678", "123456789", "qwerty", "letmein", "abc123",
    "admin", "welcome", "iloveyou", "monkey", "dragon", "master", "sunshine", "princess",
    "football", "shadow", "superman", "trustno1",
];

/// Pre-loaded acceptance corpora.
///
/// All corpus files are read once at startup; validation never touches the
/// network.
pub struct PasswordPolicy {
    dictionary: HashSet<String>,
    weak: HashSet<String>,
    /// Uppercase SHA-1 hex digests, HIBP corpus format
    pwned_sha1: HashSet<String>,
    min_strength: u16,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            dictionary: HashSet::new(),
            weak: BUILTIN_WEAK.iter().map(|s| s.to_string()).collect(),
            pwned_sha1: HashSet::new(),
            min_strength: 50,
        }
    }
}

impl PasswordPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load dictionary words (one per line, entries shorter than 3 chars
    /// skipped).
    pub fn load_dictionary(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read dictionary {path:?}: {e}")))?;
        let mut loaded = 0;
        for line in raw.lines() {
            let word = line.trim().to_lowercase();
            if word.len() >= 3 {
                self.dictionary.insert(word);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Load additional known-weak passwords (one per line, lowercased).
    pub fn load_weak_passwords(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read weak list {path:?}: {e}")))?;
        let mut loaded = 0;
        for line in raw.lines() {
            let pw = line.trim().to_lowercase();
            if !pw.is_empty() {
                self.weak.insert(pw);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Load a breached-password corpus of uppercase SHA-1 hex digests.
    pub fn load_pwned_sha1(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read pwned corpus {path:?}: {e}")))?;
        let mut loaded = 0;
        for line in raw.lines() {
            // Range files carry "HASH:count"; keep the digest only.
            let digest = line.split(':').next().unwrap_or("").trim().to_uppercase();
            if digest.len() == 40 {
                self.pwned_sha1.insert(digest);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn contains_dictionary_word(&self, password: &str) -> bool {
        if self.dictionary.is_empty() {
            return false;
        }
        let lower = password.to_lowercase();
        self.dictionary.iter().any(|word| lower.contains(word))
    }

    pub fn is_common_weak(&self, password: &str) -> bool {
        self.weak.contains(&password.to_lowercase())
    }

    pub fn is_pwned(&self, password: &str) -> bool {
        if self.pwned_sha1.is_empty() {
            return false;
        }
        let digest = hex::encode_upper(Sha1::digest(password.as_bytes()));
        self.pwned_sha1.contains(&digest)
    }

    /// Run every check and accumulate the failures; an empty vec means the
    /// password is acceptable.
    pub fn check(&self, password: &str) -> Vec<String> {
        let mut errors = Vec::new();

        let strength = strength_score(password);
        if strength < self.min_strength {
            errors.push(format!(
                "Password is too weak (strength {strength}/100). Use at least 12 characters, \
                 mix upper/lowercase, digits, and symbols."
            ));
        }

        if self.contains_dictionary_word(password) {
            errors.push("Password contains dictionary word — this is forbidden.".to_string());
        }

        if self.is_common_weak(password) {
            errors.push("Password matches known weak pattern — this is forbidden.".to_string());
        }

        if self.is_pwned(password) {
            errors.push(
                "Password has been found in public breaches — choose a different one.".to_string(),
            );
        }

        errors
    }
}
