//! # Vaulthalla crypto
//!
//! Per-vault payload encryption, key wrapping under the sealed master key,
//! online key rotation, password hashing/policy and internal secret
//! custody. All primitives are pure-Rust RustCrypto implementations.

pub mod aead;
pub mod engine;
pub mod password;
pub mod secrets;
pub mod wrap;

pub use aead::{Aes256GcmCipher, EncryptionKey};
pub use engine::VaultEncryptionManager;
pub use password::{hash_password, strength_score, verify_password, PasswordPolicy};
pub use secrets::{InternalSecretManager, JWT_SECRET_KEY};
