//! Internal secret custody
//!
//! Named process secrets (the JWT signing key, upstream credentials the
//! daemon itself needs) are generated on demand, wrapped under the master
//! key with the secret name bound as AAD, and persisted through the
//! `SecretStore`.

use std::sync::Arc;

use rand::RngCore;
use vaulthalla_core::Result;
use vaulthalla_sealed_key::SealedKeyProvider;
use vaulthalla_store::model::InternalSecret;
use vaulthalla_store::SecretStore;

use crate::wrap;

pub const JWT_SECRET_KEY: &str = "jwt-secret";

pub struct InternalSecretManager {
    store: Arc<dyn SecretStore>,
    provider: Arc<dyn SealedKeyProvider>,
}

impl InternalSecretManager {
    pub fn new(store: Arc<dyn SecretStore>, provider: Arc<dyn SealedKeyProvider>) -> Self {
        Self { store, provider }
    }

    /// Fetch and unwrap a named secret, generating and persisting
    /// `len` random bytes on first use.
    pub async fn get_or_create(&self, key: &str, len: usize) -> Result<Vec<u8>> {
        let master = self
            .provider
            .master_key()
            .map_err(|e| vaulthalla_core::Error::Internal(format!("master key unavailable: {e}")))?;

        if let Some(row) = self.store.secret(key).await? {
            return wrap::unwrap(&master, &row.wrapped_value, &row.iv, key.as_bytes());
        }

        let mut value = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut value);

        let (wrapped_value, iv) = wrap::wrap(&master, &value, key.as_bytes())?;
        self.store
            .put_secret(InternalSecret {
                key: key.to_string(),
                wrapped_value,
                iv,
                created_at: chrono::Utc::now(),
            })
            .await?;

        tracing::info!(secret = key, "generated new internal secret");
        Ok(value)
    }

    /// Wrap and persist a caller-supplied secret value.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let master = self
            .provider
            .master_key()
            .map_err(|e| vaulthalla_core::Error::Internal(format!("master key unavailable: {e}")))?;

        let (wrapped_value, iv) = wrap::wrap(&master, value, key.as_bytes())?;
        self.store
            .put_secret(InternalSecret {
                key: key.to_string(),
                wrapped_value,
                iv,
                created_at: chrono::Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_sealed_key::FileSealedKeyProvider;
    use vaulthalla_store::MemoryStore;

    fn manager(dir: &tempfile::TempDir) -> InternalSecretManager {
        let provider = FileSealedKeyProvider::new("master", dir.path()).unwrap();
        provider.init(None).unwrap();
        InternalSecretManager::new(Arc::new(MemoryStore::new()), Arc::new(provider))
    }

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let first = manager.get_or_create(JWT_SECRET_KEY, 32).await.unwrap();
        let second = manager.get_or_create(JWT_SECRET_KEY, 32).await.unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_distinct_names_get_distinct_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let a = manager.get_or_create("jwt-secret", 32).await.unwrap();
        let b = manager.get_or_create("webhook-secret", 32).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        manager.put("jwt-secret", b"fixed-value").await.unwrap();
        let got = manager.get_or_create("jwt-secret", 32).await.unwrap();
        assert_eq!(got, b"fixed-value");
    }
}
