// WebSocket front end
//
// One route upgrades the connection and feeds frames to the dispatcher;
// everything beyond the envelope (routing, handlers) lives in
// `dispatch.rs`. The transport holds no client reference: it resolves the
// client by session UUID per frame and exposes itself to the client only
// through a weak `ControlSink`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use vaulthalla_auth::ControlSink;

use crate::dispatch::Dispatcher;
use crate::runtime::Runtime;

const REFRESH_COOKIE: &str = "vh_refresh";

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(runtime)
}

async fn ws_handler(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let refresh_cookie = extract_refresh_cookie(&headers);
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    ws.on_upgrade(move |socket| {
        session_loop(socket, runtime, refresh_cookie, client_ip, user_agent)
    })
}

fn extract_refresh_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == REFRESH_COOKIE).then(|| value.to_string())
    })
}

struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl ControlSink for WsSink {
    fn send_control(&self, message: &str, payload: serde_json::Value) {
        let frame = json!({
            "command": "control",
            "message": message,
            "payload": payload,
        });
        if let Ok(text) = serde_json::to_string(&frame) {
            let _ = self.tx.send(Message::Text(text));
        }
    }

    fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

async fn session_loop(
    socket: WebSocket,
    runtime: Arc<Runtime>,
    refresh_cookie: Option<String>,
    client_ip: String,
    user_agent: String,
) {
    let session_uuid = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let sink = Arc::new(WsSink { tx: tx.clone() });

    let rehydration = match runtime
        .auth
        .rehydrate_or_create_client(
            session_uuid,
            refresh_cookie.as_deref(),
            &client_ip,
            &user_agent,
        )
        .await
    {
        Ok(rehydration) => rehydration,
        Err(e) => {
            tracing::error!(error = %e, "session setup failed");
            let _ = tx.send(Message::Close(None));
            let _ = writer.await;
            return;
        }
    };

    let client = rehydration.client;
    client.attach_sink(Arc::downgrade(&sink) as std::sync::Weak<dyn ControlSink>);
    if let Some(cookie) = rehydration.refresh_cookie {
        sink.send_control("set_refresh_token", json!({ "cookie": cookie }));
    }

    tracing::debug!(session = %session_uuid, "websocket session opened");
    let dispatcher = Dispatcher::new(Arc::clone(&runtime));

    while let Some(Ok(message)) = ws_receiver.next().await {
        match message {
            Message::Text(text) => {
                client.touch();
                let response = match serde_json::from_str(&text) {
                    Ok(envelope) => dispatcher.handle(session_uuid, envelope).await,
                    Err(e) => {
                        sink.send_control("malformed_request", json!({ "error": e.to_string() }));
                        continue;
                    }
                };
                match serde_json::to_string(&response) {
                    Ok(text) => {
                        let _ = tx.send(Message::Text(text));
                    }
                    Err(e) => tracing::error!(error = %e, "cannot serialize response"),
                }
            }
            Message::Ping(_) | Message::Pong(_) => client.touch(),
            Message::Close(_) => break,
            Message::Binary(_) => {
                sink.send_control("malformed_request", json!({ "error": "binary frames unsupported" }));
            }
        }
    }

    tracing::debug!(session = %session_uuid, "websocket session closed");
    drop(tx);
    let _ = writer.await;
}
