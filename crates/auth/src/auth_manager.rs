//! Registration, login and token validation
//!
//! Owns the password policy, the token authority and the session table.
//! Registration accumulates every validation failure into one error;
//! login revokes all prior refresh tokens before promoting.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use vaulthalla_core::types::RoleId;
use vaulthalla_core::{Error, Result};
use vaulthalla_crypto::{password, PasswordPolicy};
use vaulthalla_store::model::{NewUser, User};
use vaulthalla_store::{Store, TokenStore, UserStore};

use crate::client::Client;
use crate::session_manager::SessionManager;
use crate::tokens::TokenAuthority;

/// Result of adopting or opening a session for a new connection.
pub struct Rehydration {
    pub client: Arc<Client>,
    /// Set when a fresh refresh token was minted; the transport turns it
    /// into a cookie.
    pub refresh_cookie: Option<String>,
}

pub struct AuthManager {
    store: Arc<dyn Store>,
    session_manager: Arc<SessionManager>,
    authority: Arc<TokenAuthority>,
    policy: Arc<PasswordPolicy>,
    default_role_id: RoleId,
    /// Serialises revoke-then-persist so concurrent logins for one user
    /// leave exactly one live refresh token.
    login_lock: Mutex<()>,
}

impl AuthManager {
    pub fn new(
        store: Arc<dyn Store>,
        session_manager: Arc<SessionManager>,
        authority: Arc<TokenAuthority>,
        policy: Arc<PasswordPolicy>,
        default_role_id: RoleId,
    ) -> Self {
        Self {
            store,
            session_manager,
            authority,
            policy,
            default_role_id,
            login_lock: Mutex::new(()),
        }
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    /// Adopt an existing client when the connection presents a valid
    /// refresh-token cookie; otherwise mint a token and open a fresh
    /// unauthenticated client. Either way the session table ends up with
    /// an entry for this UUID (rehydration overwrites).
    pub async fn rehydrate_or_create_client(
        &self,
        session_uuid: Uuid,
        refresh_cookie: Option<&str>,
        ip: &str,
        user_agent: &str,
    ) -> Result<Rehydration> {
        if let Some(raw) = refresh_cookie {
            match self.validate_refresh_token(raw, session_uuid).await? {
                Some(client) => {
                    tracing::debug!(session = %session_uuid, "session rehydrated from refresh token");
                    self.session_manager.create_session(Arc::clone(&client))?;
                    return Ok(Rehydration { client, refresh_cookie: None });
                }
                None => {
                    tracing::debug!(session = %session_uuid, "presented refresh token was invalid or expired");
                }
            }
        }

        let (raw, record) = self
            .authority
            .mint_refresh_token(session_uuid, ip, user_agent)?;
        let client = Arc::new(Client::new(session_uuid, Some(record)));
        self.session_manager.create_session(Arc::clone(&client))?;
        Ok(Rehydration {
            client,
            refresh_cookie: Some(raw),
        })
    }

    /// Register a user and promote their session. Validation failures
    /// accumulate: the caller sees every problem in one message.
    pub async fn register_user(
        &self,
        name: &str,
        email: &str,
        password_text: &str,
        client: &Arc<Client>,
    ) -> Result<(Arc<User>, String)> {
        let mut errors = Vec::new();
        if name.len() < 3 || name.len() > 50 {
            errors.push("Name must be between 3 and 50 characters.".to_string());
        }
        if email.is_empty() || !email.contains('@') || !email.contains('.') {
            errors.push("Email must be valid and contain '@' and '.'.".to_string());
        }
        errors.extend(self.policy.check(password_text));
        if !errors.is_empty() {
            return Err(Error::Validation(format!(
                "registration failed: {}",
                errors.join(" ")
            )));
        }

        let user = Arc::new(
            self.store
                .create_user(NewUser {
                    name: name.to_string(),
                    email: email.to_string(),
                    password_hash: password::hash_password(password_text)?,
                    role_id: self.default_role_id,
                })
                .await?,
        );

        client.set_user(Arc::clone(&user));
        let access = self.session_manager.promote_session(client).await?;

        tracing::info!(user_id = user.id, email = %user.email, "registered new user");
        Ok((user, access))
    }

    /// Verify credentials, revoke prior refresh tokens, promote.
    pub async fn login_user(
        &self,
        email: &str,
        password_text: &str,
        client: &Arc<Client>,
    ) -> Result<(Arc<User>, String)> {
        let user = self
            .store
            .user_by_email(email)
            .await?
            .ok_or_else(|| Error::Unauthorized("invalid email or password".into()))?;
        if !user.is_active {
            return Err(Error::Unauthorized("account is disabled".into()));
        }
        if !password::verify_password(password_text, &user.password_hash) {
            return Err(Error::Unauthorized("invalid email or password".into()));
        }

        let access = {
            let _serial = self.login_lock.lock().await;
            self.store.revoke_all_refresh_tokens(user.id).await?;
            self.store.update_last_login(user.id).await?;

            // The client carries the refresh token minted at connection
            // time; promotion persists it bound to the user.
            let user = Arc::new(user.clone());
            client.set_user(Arc::clone(&user));
            self.session_manager.promote_session(client).await?
        };

        tracing::info!(user_id = user.id, email = %user.email, "user logged in");
        Ok((Arc::new(user), access))
    }

    /// Verify the old password and re-derive the hash for the new one.
    pub async fn change_password(&self, email: &str, old: &str, new: &str) -> Result<()> {
        let user = self
            .store
            .user_by_email(email)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user '{email}'")))?;
        if !password::verify_password(old, &user.password_hash) {
            return Err(Error::Unauthorized("old password does not match".into()));
        }

        let errors = self.policy.check(new);
        if !errors.is_empty() {
            return Err(Error::Validation(errors.join(" ")));
        }

        self.store
            .update_password_hash(user.id, &password::hash_password(new)?)
            .await?;
        tracing::info!(user_id = user.id, "password changed");
        Ok(())
    }

    /// The refresh-token contract:
    /// 1. decode + verify HS256 and issuer, 2. extract and require `jti`,
    /// 3. stored row must exist, be unrevoked and unexpired, 4. the raw
    /// token must verify against the stored hash (constant-time), 5. the
    /// bound user rehydrates into a fresh client.
    ///
    /// Verification failures return `Ok(None)`; only store trouble errors.
    pub async fn validate_refresh_token(
        &self,
        raw: &str,
        session_uuid: Uuid,
    ) -> Result<Option<Arc<Client>>> {
        let claims = match self.authority.decode(raw) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "refresh token rejected at decode");
                return Ok(None);
            }
        };
        if claims.jti.is_empty() {
            tracing::debug!("refresh token carries no jti");
            return Ok(None);
        }

        let Some(record) = self.store.refresh_token(&claims.jti).await? else {
            tracing::debug!(jti = %claims.jti, "refresh token unknown");
            return Ok(None);
        };
        if record.revoked || record.is_expired(Utc::now()) {
            tracing::debug!(jti = %claims.jti, revoked = record.revoked, "refresh token dead");
            return Ok(None);
        }

        if !password::verify_password(raw, &record.hashed_token) {
            tracing::warn!(jti = %claims.jti, "refresh token hash mismatch");
            return Ok(None);
        }

        let Some(user) = self.store.user_by_id(record.user_id).await? else {
            tracing::warn!(jti = %claims.jti, "refresh token bound to a missing user");
            return Ok(None);
        };

        let client = Arc::new(Client::rehydrated(session_uuid, record, Arc::new(user.clone())));
        client.set_access_token(self.authority.mint_access_token(&user)?);
        Ok(Some(client))
    }

    /// Bare access token check: live session plus client-side validity.
    pub fn validate_access_token(&self, raw: &str) -> bool {
        self.session_manager.validate_access_token(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_store::model::RoleType;
    use vaulthalla_store::{MemoryStore, RbacStore, TokenStore};

    struct Harness {
        auth: AuthManager,
        store: Arc<MemoryStore>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.create_role("user", RoleType::User, 0).await.unwrap();

        let authority = Arc::new(TokenAuthority::new(
            b"test-secret-32-bytes-long-please",
            "Vaulthalla",
            3600,
            7,
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&authority),
        ));
        let auth = AuthManager::new(
            Arc::clone(&store) as Arc<dyn Store>,
            sessions,
            authority,
            Arc::new(PasswordPolicy::new()),
            1,
        );
        Harness { auth, store }
    }

    async fn open_session(auth: &AuthManager) -> (Arc<Client>, Option<String>) {
        let rehydration = auth
            .rehydrate_or_create_client(Uuid::new_v4(), None, "127.0.0.1", "test-agent")
            .await
            .unwrap();
        (rehydration.client, rehydration.refresh_cookie)
    }

    const STRONG: &str = "Correct-Horse-Battery-Staple-42";

    #[tokio::test]
    async fn test_register_then_login() {
        let h = harness().await;

        let (client, register_cookie) = open_session(&h.auth).await;
        let (user, register_access) = h
            .auth
            .register_user("alice", "a@ex.com", STRONG, &client)
            .await
            .unwrap();
        assert_eq!(user.id, 1);
        assert!(!register_access.is_empty());
        let register_cookie = register_cookie.expect("fresh session minted a cookie");

        // A later login from a new connection.
        let (login_client, login_cookie) = open_session(&h.auth).await;
        let (_, login_access) = h
            .auth
            .login_user("a@ex.com", STRONG, &login_client)
            .await
            .unwrap();

        assert!(!login_access.is_empty());
        assert_ne!(login_cookie.as_deref().unwrap(), register_cookie);

        // Login revoked the registration-era refresh token.
        assert!(h
            .auth
            .validate_refresh_token(&register_cookie, Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
        assert!(h
            .auth
            .validate_refresh_token(login_cookie.as_deref().unwrap(), Uuid::new_v4())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_weak_password_rejected_with_all_reasons() {
        let h = harness().await;
        let (client, _) = open_session(&h.auth).await;

        let err = h
            .auth
            .register_user("bob", "b@ex.com", "password", &client)
            .await
            .unwrap_err();
        let Error::Validation(message) = err else {
            panic!("expected validation error")
        };
        assert!(message.contains("weak pattern") || message.contains("dictionary"));
        assert!(message.contains("too weak"));

        // No user row was created.
        assert!(h.store.user_by_email("b@ex.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let h = harness().await;
        let (client, _) = open_session(&h.auth).await;
        h.auth
            .register_user("alice", "a@ex.com", STRONG, &client)
            .await
            .unwrap();

        let (second, _) = open_session(&h.auth).await;
        let err = h
            .auth
            .register_user("alice2", "a@ex.com", STRONG, &second)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_login_wrong_password_unauthorized() {
        let h = harness().await;
        let (client, _) = open_session(&h.auth).await;
        h.auth
            .register_user("alice", "a@ex.com", STRONG, &client)
            .await
            .unwrap();

        let (second, _) = open_session(&h.auth).await;
        assert!(matches!(
            h.auth.login_user("a@ex.com", "wrong", &second).await.unwrap_err(),
            Error::Unauthorized(_)
        ));
        assert!(matches!(
            h.auth.login_user("who@ex.com", STRONG, &second).await.unwrap_err(),
            Error::Unauthorized(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_logins_leave_one_live_refresh_token() {
        let h = Arc::new(harness().await);
        let (client, _) = open_session(&h.auth).await;
        h.auth
            .register_user("alice", "a@ex.com", STRONG, &client)
            .await
            .unwrap();

        let (c1, _) = open_session(&h.auth).await;
        let (c2, _) = open_session(&h.auth).await;

        let (h1, h2) = (Arc::clone(&h), Arc::clone(&h));
        let t1 = tokio::spawn(async move { h1.auth.login_user("a@ex.com", STRONG, &c1).await });
        let t2 = tokio::spawn(async move { h2.auth.login_user("a@ex.com", STRONG, &c2).await });

        let (_, access1) = t1.await.unwrap().unwrap();
        let (_, access2) = t2.await.unwrap().unwrap();
        assert_ne!(access1, access2);

        // register + 2 logins persisted 3 rows; exactly one is still live
        // and the other two were revoked (each exactly once).
        let tokens = h.store.refresh_tokens_for_user(1).await;
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens.iter().filter(|t| !t.revoked).count(), 1);
    }

    #[tokio::test]
    async fn test_rehydration_adopts_existing_identity() {
        let h = harness().await;
        let (client, cookie) = open_session(&h.auth).await;
        h.auth
            .register_user("alice", "a@ex.com", STRONG, &client)
            .await
            .unwrap();
        let cookie = cookie.unwrap();

        // New connection presenting the cookie adopts the user without
        // minting a new token.
        let rehydration = h
            .auth
            .rehydrate_or_create_client(Uuid::new_v4(), Some(&cookie), "127.0.0.1", "agent")
            .await
            .unwrap();
        assert!(rehydration.refresh_cookie.is_none());
        assert!(rehydration.client.is_authenticated());
        assert_eq!(rehydration.client.user().unwrap().email, "a@ex.com");

        // A garbage cookie falls back to a fresh unauthenticated client.
        let fallback = h
            .auth
            .rehydrate_or_create_client(Uuid::new_v4(), Some("garbage"), "127.0.0.1", "agent")
            .await
            .unwrap();
        assert!(fallback.refresh_cookie.is_some());
        assert!(!fallback.client.is_authenticated());
    }

    #[tokio::test]
    async fn test_change_password() {
        let h = harness().await;
        let (client, _) = open_session(&h.auth).await;
        h.auth
            .register_user("alice", "a@ex.com", STRONG, &client)
            .await
            .unwrap();

        let new_password = "Another-Strong-Passphrase-77!";
        assert!(matches!(
            h.auth
                .change_password("a@ex.com", "wrong-old", new_password)
                .await
                .unwrap_err(),
            Error::Unauthorized(_)
        ));

        h.auth
            .change_password("a@ex.com", STRONG, new_password)
            .await
            .unwrap();

        let (second, _) = open_session(&h.auth).await;
        assert!(h.auth.login_user("a@ex.com", STRONG, &second).await.is_err());
        assert!(h
            .auth
            .login_user("a@ex.com", new_password, &second)
            .await
            .is_ok());
    }
}
