//! Token minting and verification
//!
//! Both refresh and access tokens are HS256 JWTs signed with the
//! `"jwt-secret"` internal secret and checked against the configured
//! issuer. Refresh tokens persist only as Argon2id hashes; the raw JWT
//! lives in the client's cookie.

use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vaulthalla_core::{Error, Result};
use vaulthalla_crypto::password;
use vaulthalla_store::model::{RefreshTokenRecord, User};

use crate::client::AccessToken;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Signs and verifies the daemon's tokens.
pub struct TokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenAuthority {
    pub fn new(secret: &[u8], issuer: &str, access_ttl_secs: u64, refresh_ttl_days: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.to_string(),
            access_ttl: Duration::seconds(access_ttl_secs as i64),
            refresh_ttl: Duration::days(refresh_ttl_days as i64),
        }
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Mint a refresh token. Returns the raw JWT (for the cookie) and the
    /// row to persist at promotion; `user_id` is bound then.
    pub fn mint_refresh_token(
        &self,
        session_uuid: Uuid,
        ip: &str,
        user_agent: &str,
    ) -> Result<(String, RefreshTokenRecord)> {
        let now = Utc::now();
        let expires_at = now + self.refresh_ttl;
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            sub: format!("{ip}:{user_agent}:{session_uuid}"),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: jti.clone(),
        };
        let raw = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("refresh token signing failed: {e}")))?;

        let record = RefreshTokenRecord {
            jti,
            user_id: 0,
            hashed_token: password::hash_password(&raw)?,
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            issued_at: now,
            expires_at,
            revoked: false,
        };
        Ok((raw, record))
    }

    /// Mint a short-lived access token for an authenticated user.
    pub fn mint_access_token(&self, user: &User) -> Result<Arc<AccessToken>> {
        let now = Utc::now();
        let expires_at = now + self.access_ttl;

        let claims = Claims {
            sub: user.id.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let raw = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("access token signing failed: {e}")))?;

        Ok(Arc::new(AccessToken::new(raw, now, expires_at)))
    }

    /// Decode and verify signature, issuer and expiry.
    pub fn decode(&self, raw: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_exp = true;

        decode::<Claims>(raw, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Unauthorized(format!("token verification failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new(b"test-secret-32-bytes-long-please", "Vaulthalla", 3600, 7)
    }

    #[test]
    fn test_refresh_token_roundtrip() {
        let authority = authority();
        let (raw, record) = authority
            .mint_refresh_token(Uuid::new_v4(), "127.0.0.1", "test-agent")
            .unwrap();

        let claims = authority.decode(&raw).unwrap();
        assert_eq!(claims.jti, record.jti);
        assert_eq!(claims.iss, "Vaulthalla");
        assert!(claims.exp > Utc::now().timestamp());

        // Only the hash is persisted, and it verifies the raw token.
        assert_ne!(record.hashed_token, raw);
        assert!(password::verify_password(&raw, &record.hashed_token));
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let ours = authority();
        let theirs =
            TokenAuthority::new(b"test-secret-32-bytes-long-please", "Somebody", 3600, 7);

        let (raw, _) = theirs
            .mint_refresh_token(Uuid::new_v4(), "127.0.0.1", "agent")
            .unwrap();
        assert!(matches!(ours.decode(&raw).unwrap_err(), Error::Unauthorized(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let ours = authority();
        let theirs = TokenAuthority::new(b"a-completely-different-secret!!!", "Vaulthalla", 3600, 7);

        let (raw, _) = theirs
            .mint_refresh_token(Uuid::new_v4(), "127.0.0.1", "agent")
            .unwrap();
        assert!(ours.decode(&raw).is_err());
    }

    #[test]
    fn test_access_token_carries_user() {
        let authority = authority();
        let user = User {
            id: 42,
            name: "a".into(),
            email: "a@ex.com".into(),
            password_hash: "h".into(),
            role_id: 1,
            is_active: true,
            created_at: Utc::now(),
            last_login_at: None,
        };

        let token = authority.mint_access_token(&user).unwrap();
        let claims = authority.decode(&token.token).unwrap();
        assert_eq!(claims.sub, "42");
        assert!(token.seconds_left(Utc::now()) > 3500);
    }
}
