//! User accounts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vaulthalla_core::types::{RoleId, UserId};

/// `name` and `email` are each unique across the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role_id: RoleId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Draft for user registration
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role_id: RoleId,
}
