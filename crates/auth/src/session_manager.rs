//! The process-wide session table
//!
//! One mutex over `active_sessions_`, short critical sections. Promotion
//! persists the hashed refresh-token row, binds the user, replays the
//! client into the table and returns the raw access token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use vaulthalla_core::{Error, Result};
use vaulthalla_store::{Store, TokenStore};

use crate::client::Client;
use crate::tokens::TokenAuthority;

pub struct SessionManager {
    store: Arc<dyn Store>,
    authority: Arc<TokenAuthority>,
    active_sessions: Mutex<HashMap<Uuid, Arc<Client>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, authority: Arc<TokenAuthority>) -> Self {
        Self {
            store,
            authority,
            active_sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Insert (or overwrite) the client keyed by its session UUID.
    pub fn create_session(&self, client: Arc<Client>) -> Result<()> {
        if client.session_uuid.is_nil() {
            return Err(Error::Validation("session must carry a UUID".into()));
        }
        self.active_sessions
            .lock()
            .expect("session table lock poisoned")
            .insert(client.session_uuid, client);
        Ok(())
    }

    /// Transition to authenticated: persist the refresh-token row bound
    /// to the user, mint the access token, replay the client into the
    /// table. Returns the raw access token.
    pub async fn promote_session(&self, client: &Arc<Client>) -> Result<String> {
        let user = client
            .user()
            .ok_or_else(|| Error::Validation("cannot promote a session without a user".into()))?;
        let mut record = client
            .refresh_token()
            .ok_or_else(|| Error::Validation("cannot promote a session without a refresh token".into()))?;

        record.user_id = user.id;
        self.store.add_refresh_token(record.clone()).await?;
        client.set_refresh_token(record);

        let access = self.authority.mint_access_token(&user)?;
        let raw = access.token.clone();
        client.set_access_token(access);

        self.create_session(Arc::clone(client))?;
        tracing::info!(user_id = user.id, session = %client.session_uuid, "session promoted");
        Ok(raw)
    }

    pub fn get_client(&self, session_uuid: Uuid) -> Option<Arc<Client>> {
        self.active_sessions
            .lock()
            .expect("session table lock poisoned")
            .get(&session_uuid)
            .cloned()
    }

    /// Access tokens are presented bare in the envelope; resolve them by
    /// scanning the (small) live-session table.
    pub fn find_by_access_token(&self, raw: &str) -> Option<Arc<Client>> {
        self.active_sessions
            .lock()
            .expect("session table lock poisoned")
            .values()
            .find(|c| {
                c.access_token()
                    .map(|t| t.token == raw)
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// Validate a bare access token: live session plus the client's own
    /// token state.
    pub fn validate_access_token(&self, raw: &str) -> bool {
        self.find_by_access_token(raw)
            .and_then(|c| c.access_token())
            .map(|t| t.is_valid(Utc::now()))
            .unwrap_or(false)
    }

    /// Drop a session. A user-bearing session revokes every refresh token
    /// for that user; an unauthenticated one is simply removed.
    pub async fn invalidate(&self, session_uuid: Uuid) -> Result<()> {
        let client = self
            .active_sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(&session_uuid);

        let Some(client) = client else { return Ok(()) };
        if let Some(token) = client.access_token() {
            token.revoke();
        }
        if let Some(user) = client.user() {
            let revoked = self.store.revoke_all_refresh_tokens(user.id).await?;
            tracing::info!(user_id = user.id, revoked, session = %session_uuid, "session invalidated");
        }
        Ok(())
    }

    /// Snapshot for the lifecycle sweeper.
    pub fn active_sessions(&self) -> Vec<Arc<Client>> {
        self.active_sessions
            .lock()
            .expect("session table lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}
