//! S3 credential custody

use serde::{Deserialize, Serialize};
use vaulthalla_core::types::{ApiKeyId, UserId};

/// Upstream provider credentials. The secret is never stored in plaintext:
/// it is wrapped under the master key with a fresh IV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub user_id: UserId,
    pub name: String,
    pub provider: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub wrapped_secret: Vec<u8>,
    pub iv: Vec<u8>,
    pub region: String,
    pub endpoint: Option<String>,
}

/// Draft for credential registration
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub user_id: UserId,
    pub name: String,
    pub provider: String,
    pub access_key: String,
    pub wrapped_secret: Vec<u8>,
    pub iv: Vec<u8>,
    pub region: String,
    pub endpoint: Option<String>,
}
