//! Refresh token persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vaulthalla_core::types::UserId;

/// Stored refresh token. The raw token is an HMAC-signed JWT held only by
/// the client; this row keeps its Argon2id hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub jti: String,
    pub user_id: UserId,
    #[serde(skip_serializing)]
    pub hashed_token: String,
    pub ip: String,
    pub user_agent: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl RefreshTokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
