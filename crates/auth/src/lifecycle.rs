//! Connection lifecycle sweeper
//!
//! Periodically walks the session table: times out unauthenticated
//! sessions, closes sessions whose access token died, warns clients whose
//! token is about to expire, and cuts idle connections.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;

use vaulthalla_core::service::{AsyncService, ServiceContext};

use crate::session_manager::SessionManager;

pub struct ConnectionLifecycleManager {
    session_manager: Arc<SessionManager>,
    sweep_interval: std::time::Duration,
    unauthenticated_timeout: Duration,
    idle_timeout: Duration,
}

impl ConnectionLifecycleManager {
    pub fn new(
        session_manager: Arc<SessionManager>,
        sweep_interval_secs: u64,
        unauthenticated_timeout_secs: u64,
        idle_timeout_mins: u64,
    ) -> Self {
        Self {
            session_manager,
            sweep_interval: std::time::Duration::from_secs(sweep_interval_secs),
            unauthenticated_timeout: Duration::seconds(unauthenticated_timeout_secs as i64),
            idle_timeout: Duration::minutes(idle_timeout_mins as i64),
        }
    }

    pub async fn sweep_active_sessions(&self) {
        let now = Utc::now();

        for client in self.session_manager.active_sessions() {
            if !client.is_authenticated() {
                if client.opened_at + self.unauthenticated_timeout < now {
                    tracing::debug!(session = %client.session_uuid, "closing unauthenticated session");
                    client.send_control("unauthenticated_session_timeout", json!({}));
                    client.close_connection();
                    let _ = self.session_manager.invalidate(client.session_uuid).await;
                }
                continue;
            }

            let token = client.access_token();
            let Some(token) = token else {
                // Authenticated but tokenless should not happen; treat it
                // like a revoked token.
                client.send_control("token_revoked", json!({}));
                client.close_connection();
                let _ = self.session_manager.invalidate(client.session_uuid).await;
                continue;
            };

            if token.is_revoked() {
                tracing::debug!(session = %client.session_uuid, "token revoked, closing session");
                client.send_control("token_revoked", json!({}));
                client.close_connection();
                let _ = self.session_manager.invalidate(client.session_uuid).await;
                continue;
            }

            let seconds_left = token.seconds_left(now);
            if seconds_left <= 0 {
                tracing::debug!(session = %client.session_uuid, "token expired, closing session");
                client.send_control("token_expired", json!({}));
                client.close_connection();
                let _ = self.session_manager.invalidate(client.session_uuid).await;
                continue;
            }

            if client.idle_for(now) > self.idle_timeout {
                tracing::debug!(session = %client.session_uuid, "idle timeout, closing session");
                client.send_control("idle_timeout", json!({}));
                client.close_connection();
                let _ = self.session_manager.invalidate(client.session_uuid).await;
                continue;
            }

            if seconds_left <= 10 {
                client.send_control("token_refresh_urgent", json!({ "deadline_ms": 10_000 }));
            } else if seconds_left <= 300 {
                client.send_control("token_refresh_requested", json!({ "deadline_ms": 300_000 }));
            }
        }
    }
}

#[async_trait]
impl AsyncService for ConnectionLifecycleManager {
    fn name(&self) -> &'static str {
        "ConnectionLifecycleManager"
    }

    async fn run_loop(&self, ctx: Arc<ServiceContext>) {
        while !ctx.is_interrupted() {
            self.sweep_active_sessions().await;
            ctx.lazy_sleep(self.sweep_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AccessToken, Client, ControlSink};
    use crate::tokens::TokenAuthority;
    use std::sync::{Mutex, Weak};
    use uuid::Uuid;
    use vaulthalla_store::model::NewUser;
    use vaulthalla_store::{MemoryStore, Store, UserStore};

    struct Recorder {
        messages: Mutex<Vec<String>>,
        closed: Mutex<bool>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
            })
        }
    }

    impl ControlSink for Recorder {
        fn send_control(&self, message: &str, _payload: serde_json::Value) {
            self.messages.lock().unwrap().push(message.to_string());
        }
        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    struct Harness {
        sessions: Arc<SessionManager>,
        sweeper: ConnectionLifecycleManager,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(TokenAuthority::new(
            b"test-secret-32-bytes-long-please",
            "Vaulthalla",
            3600,
            7,
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store) as Arc<dyn Store>,
            authority,
        ));
        let sweeper = ConnectionLifecycleManager::new(Arc::clone(&sessions), 60, 120, 30);
        Harness { sessions, sweeper, store }
    }

    async fn authed_client(h: &Harness, seconds_left: i64) -> (Arc<Client>, Arc<Recorder>) {
        let user = Arc::new(
            h.store
                .create_user(NewUser {
                    name: format!("u{seconds_left}"),
                    email: format!("u{seconds_left}@ex.com"),
                    password_hash: "h".into(),
                    role_id: 1,
                })
                .await
                .unwrap(),
        );

        let client = Arc::new(Client::new(Uuid::new_v4(), None));
        client.set_user(user);
        let now = Utc::now();
        client.set_access_token(Arc::new(AccessToken::new(
            format!("tok-{seconds_left}"),
            now,
            now + Duration::seconds(seconds_left),
        )));

        let sink = Recorder::new();
        client.attach_sink(Arc::downgrade(&sink) as Weak<dyn ControlSink>);
        h.sessions.create_session(Arc::clone(&client)).unwrap();
        (client, sink)
    }

    #[tokio::test]
    async fn test_fresh_unauthenticated_session_survives_sweep() {
        let h = harness();
        let client = Arc::new(Client::new(Uuid::new_v4(), None));
        let sink = Recorder::new();
        client.attach_sink(Arc::downgrade(&sink) as Weak<dyn ControlSink>);
        h.sessions.create_session(Arc::clone(&client)).unwrap();

        h.sweeper.sweep_active_sessions().await;

        assert!(h.sessions.get_client(client.session_uuid).is_some());
        assert!(sink.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_unauthenticated_session_times_out() {
        let h = harness();
        // Zero-second timeout sweeper so a just-opened session is already
        // past its deadline.
        let sweeper = ConnectionLifecycleManager::new(Arc::clone(&h.sessions), 60, 0, 30);

        let client = Arc::new(Client::new(Uuid::new_v4(), None));
        let sink = Recorder::new();
        client.attach_sink(Arc::downgrade(&sink) as Weak<dyn ControlSink>);
        h.sessions.create_session(Arc::clone(&client)).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        sweeper.sweep_active_sessions().await;

        assert_eq!(
            sink.messages.lock().unwrap().as_slice(),
            ["unauthenticated_session_timeout"]
        );
        assert!(*sink.closed.lock().unwrap());
        assert!(h.sessions.get_client(client.session_uuid).is_none());
    }

    #[tokio::test]
    async fn test_expired_token_closes_session() {
        let h = harness();
        let (client, sink) = authed_client(&h, -5).await;

        h.sweeper.sweep_active_sessions().await;

        assert_eq!(sink.messages.lock().unwrap().as_slice(), ["token_expired"]);
        assert!(*sink.closed.lock().unwrap());
        assert!(h.sessions.get_client(client.session_uuid).is_none());
    }

    #[tokio::test]
    async fn test_revoked_token_closes_session() {
        let h = harness();
        let (client, sink) = authed_client(&h, 1000).await;
        client.access_token().unwrap().revoke();

        h.sweeper.sweep_active_sessions().await;

        assert_eq!(sink.messages.lock().unwrap().as_slice(), ["token_revoked"]);
        assert!(h.sessions.get_client(client.session_uuid).is_none());
    }

    #[tokio::test]
    async fn test_refresh_warnings_by_urgency() {
        let h = harness();
        let (_c1, urgent) = authed_client(&h, 8).await;
        let (_c2, requested) = authed_client(&h, 200).await;
        let (_c3, quiet) = authed_client(&h, 2000).await;

        h.sweeper.sweep_active_sessions().await;

        assert_eq!(urgent.messages.lock().unwrap().as_slice(), ["token_refresh_urgent"]);
        assert_eq!(
            requested.messages.lock().unwrap().as_slice(),
            ["token_refresh_requested"]
        );
        assert!(quiet.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_leaves_other_sessions_alone() {
        let h = harness();
        let (dead, _) = authed_client(&h, -5).await;
        let (alive, _) = authed_client(&h, 2000).await;

        h.sweeper.sweep_active_sessions().await;

        assert!(h.sessions.get_client(dead.session_uuid).is_none());
        assert!(h.sessions.get_client(alive.session_uuid).is_some());
    }
}
