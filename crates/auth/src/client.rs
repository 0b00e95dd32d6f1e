//! Client session model
//!
//! A `Client` is one connected session, unauthenticated until promotion
//! binds a user. The session table owns clients by strong reference; a
//! client only holds a weak handle to its transport, which in turn looks
//! clients up by UUID — no reference cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use vaulthalla_store::model::{RefreshTokenRecord, User};

/// Transport side of a client: a way to push control frames and close.
pub trait ControlSink: Send + Sync {
    fn send_control(&self, message: &str, payload: serde_json::Value);
    fn close(&self);
}

/// A minted short-lived access token.
pub struct AccessToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    revoked: AtomicBool,
}

impl AccessToken {
    pub fn new(token: String, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token,
            issued_at,
            expires_at,
            revoked: AtomicBool::new(false),
        }
    }

    pub fn seconds_left(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && self.seconds_left(now) > 0
    }
}

pub struct Client {
    pub session_uuid: Uuid,
    pub opened_at: DateTime<Utc>,
    user: RwLock<Option<Arc<User>>>,
    access_token: RwLock<Option<Arc<AccessToken>>>,
    refresh_token: RwLock<Option<RefreshTokenRecord>>,
    last_seen: RwLock<DateTime<Utc>>,
    sink: Mutex<Option<Weak<dyn ControlSink>>>,
}

impl Client {
    /// A fresh unauthenticated client holding its (not yet persisted)
    /// refresh token.
    pub fn new(session_uuid: Uuid, refresh_token: Option<RefreshTokenRecord>) -> Self {
        let now = Utc::now();
        Self {
            session_uuid,
            opened_at: now,
            user: RwLock::new(None),
            access_token: RwLock::new(None),
            refresh_token: RwLock::new(refresh_token),
            last_seen: RwLock::new(now),
            sink: Mutex::new(None),
        }
    }

    /// A rehydrated client adopting a validated refresh token and user.
    pub fn rehydrated(session_uuid: Uuid, token: RefreshTokenRecord, user: Arc<User>) -> Self {
        let client = Self::new(session_uuid, Some(token));
        *client.user.write().expect("client lock poisoned") = Some(user);
        client
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.read().expect("client lock poisoned").is_some()
    }

    pub fn user(&self) -> Option<Arc<User>> {
        self.user.read().expect("client lock poisoned").clone()
    }

    pub fn set_user(&self, user: Arc<User>) {
        *self.user.write().expect("client lock poisoned") = Some(user);
    }

    pub fn access_token(&self) -> Option<Arc<AccessToken>> {
        self.access_token.read().expect("client lock poisoned").clone()
    }

    pub fn set_access_token(&self, token: Arc<AccessToken>) {
        *self.access_token.write().expect("client lock poisoned") = Some(token);
    }

    pub fn refresh_token(&self) -> Option<RefreshTokenRecord> {
        self.refresh_token.read().expect("client lock poisoned").clone()
    }

    pub fn set_refresh_token(&self, token: RefreshTokenRecord) {
        *self.refresh_token.write().expect("client lock poisoned") = Some(token);
    }

    /// Record activity for the idle-timeout sweep.
    pub fn touch(&self) {
        *self.last_seen.write().expect("client lock poisoned") = Utc::now();
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - *self.last_seen.read().expect("client lock poisoned")
    }

    pub fn attach_sink(&self, sink: Weak<dyn ControlSink>) {
        *self.sink.lock().expect("client lock poisoned") = Some(sink);
    }

    /// Best effort: a departed transport is simply skipped.
    pub fn send_control(&self, message: &str, payload: serde_json::Value) {
        let sink = self.sink.lock().expect("client lock poisoned").clone();
        if let Some(sink) = sink.and_then(|w| w.upgrade()) {
            sink.send_control(message, payload);
        }
    }

    pub fn close_connection(&self) {
        let sink = self.sink.lock().expect("client lock poisoned").clone();
        if let Some(sink) = sink.and_then(|w| w.upgrade()) {
            sink.close();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session_uuid", &self.session_uuid)
            .field("authenticated", &self.is_authenticated())
            .field("opened_at", &self.opened_at)
            .finish()
    }
}
