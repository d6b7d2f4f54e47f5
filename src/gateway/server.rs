//! WebSocket upgrade handlers and the per-connection event loop.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::broker::{channel_sink, SubscriptionId};
use crate::events::{self, Event};
use crate::AppState;

use super::session::{
    ClientFrame, Session, SessionKind, MSG_HEARTBEAT, MSG_TYPING_START, MSG_TYPING_STOP,
};

/// Close codes (4000-range for application-level).
const CLOSE_INTERNAL_ERROR: u16 = 4000;
const CLOSE_AUTH_REQUIRED: u16 = 4001;
const CLOSE_NOT_A_MEMBER: u16 = 4003;
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/discussions/{episode_id}", get(discussion_upgrade))
        .route("/ws/dm/{conversation_id}", get(dm_upgrade))
}

async fn discussion_upgrade(
    ws: WebSocketUpgrade,
    Path(episode_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| discussion_session(socket, state, episode_id, query.token))
}

async fn dm_upgrade(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| dm_session(socket, state, conversation_id, query.token))
}

/// Semi-public discussion channel: accepts unconditionally. A valid token
/// unlocks typing frames; anything else listens anonymously.
async fn discussion_session(
    socket: WebSocket,
    state: AppState,
    episode_id: String,
    token: Option<String>,
) {
    let (mut ws_tx, ws_rx) = socket.split();

    let identity = match token {
        Some(token) => match state.tokens.validate(&token).await {
            Ok(identity) => identity,
            Err(e) => {
                // The channel accepts unconditionally; degrade to anonymous.
                tracing::warn!(%e, "token validation unavailable; treating as anonymous");
                None
            }
        },
        None => None,
    };

    let room = events::discussion_room(&episode_id);
    let (sink, event_rx) = channel_sink();
    let subscription = match state.broker.subscribe(&room, sink).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(%e, %room, "subscribe failed");
            let _ = send_close(&mut ws_tx, CLOSE_INTERNAL_ERROR, "Subscription failed").await;
            return;
        }
    };

    let session = Session {
        room: room.clone(),
        identity,
        kind: SessionKind::Discussion { episode_id },
    };

    tracing::info!(
        %room,
        authenticated = session.identity.is_some(),
        "discussion session established"
    );

    if send_event(&mut ws_tx, &Event::subscribed(&room)).await.is_ok() {
        run_session(&state, &session, &mut ws_tx, ws_rx, event_rx).await;
    }

    // A discussion session owns nothing ephemeral; exit is just the
    // subscription.
    if let Err(e) = state.broker.unsubscribe(&room, subscription).await {
        tracing::debug!(%e, %room, "unsubscribe failed during teardown");
    }
    tracing::info!(%room, "discussion session ended");
}

/// Private DM channel: token and conversation membership are verified
/// before any subscription exists, so a failed session never appears as a
/// subscriber.
async fn dm_session(
    socket: WebSocket,
    state: AppState,
    conversation_id: String,
    token: Option<String>,
) {
    let (mut ws_tx, ws_rx) = socket.split();

    let Some(token) = token else {
        let _ = send_close(&mut ws_tx, CLOSE_AUTH_REQUIRED, "Authentication required").await;
        return;
    };
    let identity = match state.tokens.validate(&token).await {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_REQUIRED, "Invalid token").await;
            return;
        }
        Err(e) => {
            tracing::warn!(%e, "token validation unavailable");
            let _ = send_close(&mut ws_tx, CLOSE_INTERNAL_ERROR, "Authentication unavailable").await;
            return;
        }
    };
    match state
        .conversations
        .is_member(&identity.user_id, &conversation_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            let _ = send_close(&mut ws_tx, CLOSE_NOT_A_MEMBER, "Not a member of this conversation")
                .await;
            return;
        }
        Err(e) => {
            tracing::warn!(%e, "membership check unavailable");
            let _ = send_close(&mut ws_tx, CLOSE_INTERNAL_ERROR, "Membership check unavailable")
                .await;
            return;
        }
    }

    let room = events::dm_room(&conversation_id);
    let user_id = identity.user_id.clone();

    let (sink, event_rx) = channel_sink();
    let subscription = match state.broker.subscribe(&room, sink).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(%e, %room, "subscribe failed");
            let _ = send_close(&mut ws_tx, CLOSE_INTERNAL_ERROR, "Subscription failed").await;
            return;
        }
    };

    // From here on, every exit path must run the teardown exactly once.
    let first_connection = state.registry.connect(&user_id);

    tracing::info!(%room, %user_id, first_connection, "dm session established");

    if send_event(&mut ws_tx, &Event::subscribed(&room)).await.is_ok() {
        // Entry side effects: presence marker plus the online transition.
        let presence_key = events::presence_key(&user_id);
        if let Err(e) = state
            .broker
            .set_ephemeral(&presence_key, "online", state.config.presence_ttl)
            .await
        {
            tracing::warn!(%e, %user_id, "failed to set presence key");
        }
        if first_connection {
            if let Err(e) = state
                .broker
                .publish(&room, &Event::presence(&user_id, true))
                .await
            {
                tracing::warn!(%e, %room, "failed to publish online presence");
            }
        }

        let session = Session {
            room: room.clone(),
            identity: Some(identity),
            kind: SessionKind::Dm {
                conversation_id: conversation_id.clone(),
            },
        };
        run_session(&state, &session, &mut ws_tx, ws_rx, event_rx).await;
    }

    teardown_dm(&state, &room, subscription, &conversation_id, &user_id).await;
    tracing::info!(%room, %user_id, "dm session ended");
}

/// DM exit path, run exactly once whatever ended the session: release the
/// subscription, then the identity's ephemeral markers. Failures are
/// logged and discarded deliberately; teardown must never fail the
/// disconnect.
async fn teardown_dm(
    state: &AppState,
    room: &str,
    subscription: SubscriptionId,
    conversation_id: &str,
    user_id: &str,
) {
    if let Err(e) = state.broker.unsubscribe(room, subscription).await {
        tracing::debug!(%e, %room, "unsubscribe failed during teardown");
    }
    if let Err(e) = state
        .broker
        .delete_ephemeral(&events::typing_key(conversation_id, user_id))
        .await
    {
        tracing::debug!(%e, %user_id, "typing key delete failed during teardown");
    }
    // Presence only drops with the identity's last local connection;
    // other tabs keep it alive.
    if state.registry.disconnect(user_id) {
        if let Err(e) = state
            .broker
            .delete_ephemeral(&events::presence_key(user_id))
            .await
        {
            tracing::debug!(%e, %user_id, "presence key delete failed during teardown");
        }
        if let Err(e) = state
            .broker
            .publish(room, &Event::presence(user_id, false))
            .await
        {
            tracing::debug!(%e, %room, "offline presence publish failed during teardown");
        }
    }
}

/// Main session loop: client frames in, room events out, liveness checks
/// on a fixed interval.
async fn run_session(
    state: &AppState,
    session: &Session,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    mut event_rx: mpsc::UnboundedReceiver<Event>,
) {
    let mut liveness_timer = time::interval(state.config.receive_timeout());
    liveness_timer.tick().await; // First tick fires immediately; skip it.
    let mut last_heartbeat = Instant::now();

    loop {
        tokio::select! {
            // Client sends us a frame.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_frame(state, session, ws_tx, &text, &mut last_heartbeat)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, room = %session.room, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // An event published to this session's room.
            event = event_rx.recv() => {
                match event {
                    Some(event) => {
                        if send_event(ws_tx, &event).await.is_err() {
                            // Stop sending to this subscriber.
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Liveness check: reap the connection once the client has gone
            // quiet past the presence TTL. This replaces transport-level
            // keepalive for dead peers.
            _ = liveness_timer.tick() => {
                if last_heartbeat.elapsed() > state.config.presence_ttl {
                    tracing::debug!(room = %session.room, "heartbeat timeout; closing connection");
                    let _ = send_close(ws_tx, CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
            }
        }
    }
}

/// Handle one client frame. A malformed or unrecognized frame gets one
/// `error` envelope back and the session stays open. `Err` only when the
/// socket itself is gone.
async fn handle_frame(
    state: &AppState,
    session: &Session,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    text: &str,
    last_heartbeat: &mut Instant,
) -> Result<(), ()> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => return send_event(ws_tx, &Event::error("invalid JSON")).await,
    };

    match frame.kind.as_str() {
        MSG_HEARTBEAT => {
            *last_heartbeat = Instant::now();
            if let (Some(identity), SessionKind::Dm { .. }) = (&session.identity, &session.kind) {
                let key = events::presence_key(&identity.user_id);
                if let Err(e) = state
                    .broker
                    .set_ephemeral(&key, "online", state.config.presence_ttl)
                    .await
                {
                    tracing::warn!(%e, "presence refresh failed");
                }
            }
            Ok(())
        }
        MSG_TYPING_START | MSG_TYPING_STOP => {
            let is_typing = frame.kind == MSG_TYPING_START;
            let Some(identity) = &session.identity else {
                return send_event(ws_tx, &Event::error("authentication required for typing"))
                    .await;
            };
            match session.conversation_id() {
                // Discussion typing is acknowledged without broadcast
                // (reference behavior, kept).
                None => Ok(()),
                Some(conversation_id) => {
                    let key = events::typing_key(conversation_id, &identity.user_id);
                    let marker = if is_typing {
                        state
                            .broker
                            .set_ephemeral(&key, "1", state.config.typing_ttl)
                            .await
                    } else {
                        state.broker.delete_ephemeral(&key).await
                    };
                    if let Err(e) = marker {
                        tracing::warn!(%e, %key, "typing marker update failed");
                    }
                    let event = Event::typing(conversation_id, &identity.user_id, is_typing);
                    if let Err(e) = state.broker.publish(&session.room, &event).await {
                        tracing::warn!(%e, room = %session.room, "typing broadcast failed");
                    }
                    Ok(())
                }
            }
        }
        other => {
            send_event(
                ws_tx,
                &Event::error(&format!("unknown message type '{other}'")),
            )
            .await
        }
    }
}

/// Serialize and send one envelope. `Err` means the socket is gone; the
/// only valid reaction is to stop sending to it.
async fn send_event(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    event: &Event,
) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(?e, "event serialization failed");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
