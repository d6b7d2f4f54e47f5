#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::time;
use tokio_tungstenite::tungstenite;

use realtime_api::broker::Broker;
use realtime_api::collab::{CollabError, ConversationDirectory, Identity, TokenValidator};
use realtime_api::config::{BrokerBackend, Config};
use realtime_api::gateway::registry::ConnectionRegistry;
use realtime_api::publisher::EventPublisher;
use realtime_api::AppState;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Token validator backed by a fixed token→user table.
pub struct StaticTokens {
    users: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new<const N: usize>(entries: [(&str, &str); N]) -> Self {
        Self {
            users: entries
                .iter()
                .map(|(token, user)| (token.to_string(), user.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, CollabError> {
        Ok(self.users.get(token).map(|user_id| Identity {
            user_id: user_id.clone(),
        }))
    }
}

/// Membership directory backed by a fixed (conversation, user) set.
pub struct StaticMembers {
    members: HashSet<(String, String)>,
}

impl StaticMembers {
    pub fn new<const N: usize>(entries: [(&str, &str); N]) -> Self {
        Self {
            members: entries
                .iter()
                .map(|(conversation, user)| (conversation.to_string(), user.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl ConversationDirectory for StaticMembers {
    async fn is_member(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<bool, CollabError> {
        Ok(self
            .members
            .contains(&(conversation_id.to_string(), user_id.to_string())))
    }
}

/// Production-shaped timings; tests that exercise liveness shrink them.
pub fn test_config() -> Config {
    Config {
        port: 0,
        broker_backend: BrokerBackend::Memory,
        redis_url: None,
        data_api_url: "http://127.0.0.1:9".to_string(),
        internal_api_token: "internal-test-token".to_string(),
        heartbeat_interval: Duration::from_secs(20),
        heartbeat_grace: Duration::from_secs(5),
        presence_ttl: Duration::from_secs(45),
        typing_ttl: Duration::from_secs(10),
    }
}

/// Millisecond-scale timings so heartbeat reaping happens in test time.
pub fn fast_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_grace: Duration::from_millis(50),
        presence_ttl: Duration::from_millis(400),
        ..test_config()
    }
}

/// Build an in-process AppState with the given config and collaborators.
pub fn test_state(
    config: Config,
    tokens: StaticTokens,
    members: StaticMembers,
) -> AppState {
    let broker = Arc::new(Broker::in_process());
    let (publisher, _pump) = EventPublisher::spawn(broker.clone());
    AppState {
        broker,
        publisher,
        registry: Arc::new(ConnectionRegistry::new()),
        tokens: Arc::new(tokens),
        conversations: Arc::new(members),
        config: Arc::new(config),
    }
}

/// Start an actual TCP server for WebSocket testing. The server runs in
/// the background for the rest of the test.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = realtime_api::routes::router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Open a WebSocket to the given path (path includes any query string).
pub async fn connect_ws(addr: SocketAddr, path: &str) -> WsStream {
    let url = format!("ws://{addr}{path}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

/// Read the next text frame as JSON, failing the test after 5 seconds.
pub async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    let msg = time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout waiting for frame")
        .expect("stream ended")
        .expect("ws read error");
    let text = msg.into_text().expect("expected a text frame");
    serde_json::from_str(&text).expect("frame is not valid JSON")
}

/// Skip frames until one with the given envelope `type` arrives.
pub async fn recv_event_of_type(ws: &mut WsStream, kind: &str) -> serde_json::Value {
    for _ in 0..20 {
        let event = recv_json(ws).await;
        if event["type"] == kind {
            return event;
        }
    }
    panic!("no '{kind}' event within 20 frames");
}

/// Read the next frame expecting a close, returning its code.
pub async fn recv_close_code(ws: &mut WsStream) -> u16 {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended without close frame")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Close(Some(frame)) => return u16::from(frame.code),
            tungstenite::Message::Close(None) => panic!("close frame carried no code"),
            _ => continue,
        }
    }
}

/// Send a client frame of the given type with an empty payload.
pub async fn send_frame(ws: &mut WsStream, kind: &str) {
    let frame = serde_json::json!({ "type": kind, "payload": {} });
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}
