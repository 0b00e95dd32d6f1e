//! Internal secrets wrapped under the master key

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named internal secret (e.g. `"jwt-secret"`). The value is AEAD
/// ciphertext under the master key with the secret name bound as AAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalSecret {
    pub key: String,
    #[serde(skip_serializing)]
    pub wrapped_value: Vec<u8>,
    pub iv: Vec<u8>,
    pub created_at: DateTime<Utc>,
}
