//! Shared broker backends over redis: channel pub/sub for cross-instance
//! fan-out and native TTLs for ephemeral state.
//!
//! One pub/sub listener task per process receives every channel the
//! process is subscribed to and fans messages out to local sinks. Rooms
//! map 1:1 onto channel names, so any instance publishing to a room
//! reaches every instance with a subscriber in it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, SetExpiry, SetOptions};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::events::Event;

use super::{fan_out, BrokerError, EphemeralStore, EventSink, RoomBus, SubscriptionId};

type SubscriberMap = Arc<DashMap<String, Vec<(SubscriptionId, EventSink)>>>;

/// Open the shared backend: one multiplexed command connection, one
/// pub/sub connection split into a sink (subscribe/unsubscribe) and a
/// stream consumed by the listener task.
pub(crate) async fn connect(
    url: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<(Arc<RedisBus>, Arc<RedisStore>, JoinHandle<()>), BrokerError> {
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client.clone()).await?;
    let (pubsub_sink, pubsub_stream) = client.get_async_pubsub().await?.split();

    let subs: SubscriberMap = Arc::new(DashMap::new());
    let bus = Arc::new(RedisBus {
        conn: conn.clone(),
        pubsub: Mutex::new(pubsub_sink),
        subs: subs.clone(),
        next_id: AtomicU64::new(1),
    });
    let store = Arc::new(RedisStore { conn });
    let listener = tokio::spawn(listen_loop(subs, pubsub_stream, shutdown));

    Ok((bus, store, listener))
}

/// Deliver every message from the process's channel subscriptions to the
/// local sinks of the matching room. Runs until shutdown or until the
/// pub/sub connection dies.
async fn listen_loop(
    subs: SubscriberMap,
    mut stream: PubSubStream,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = stream.next() => {
                let Some(msg) = msg else {
                    tracing::warn!("redis pub/sub stream closed; fan-out stopped");
                    break;
                };
                let room = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(?e, %room, "unreadable pub/sub payload");
                        continue;
                    }
                };
                match serde_json::from_str::<Event>(&payload) {
                    Ok(event) => fan_out(&subs, &room, &event).await,
                    Err(e) => tracing::warn!(?e, %room, "malformed event on channel"),
                }
            }
        }
    }
}

/// Room fan-out over redis channels named after the room.
pub struct RedisBus {
    conn: ConnectionManager,
    pubsub: Mutex<PubSubSink>,
    subs: SubscriberMap,
    next_id: AtomicU64,
}

#[async_trait]
impl RoomBus for RedisBus {
    async fn publish(&self, room: &str, event: &Event) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        // Local subscribers are reached through the listener like everyone
        // else: the server echoes the message back to this process.
        conn.publish::<_, _, ()>(room, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, room: &str, sink: EventSink) -> Result<SubscriptionId, BrokerError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // The sink map and the channel membership change under one lock:
        // otherwise a concurrent last-unsubscribe could observe the room
        // empty, drop the channel after this insert, and strand a live
        // sink with no server subscription behind it.
        let mut pubsub = self.pubsub.lock().await;
        let first_local = {
            let mut entry = self.subs.entry(room.to_string()).or_default();
            let first = entry.is_empty();
            entry.push((id, sink));
            first
        };

        // The first local subscriber joins the channel before this call
        // returns, so no event published afterwards can be missed.
        if first_local {
            if let Err(e) = pubsub.subscribe(room).await {
                if let Some(mut entry) = self.subs.get_mut(room) {
                    entry.retain(|(sid, _)| *sid != id);
                }
                self.subs.remove_if(room, |_, sinks| sinks.is_empty());
                return Err(e.into());
            }
        }
        Ok(id)
    }

    async fn unsubscribe(&self, room: &str, id: SubscriptionId) -> Result<(), BrokerError> {
        // Same lock as subscribe, so emptying the room and leaving the
        // channel are one step from any concurrent subscriber's view.
        let mut pubsub = self.pubsub.lock().await;
        let now_empty = match self.subs.get_mut(room) {
            Some(mut entry) => {
                entry.retain(|(sid, _)| *sid != id);
                entry.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.subs.remove_if(room, |_, sinks| sinks.is_empty());
            pubsub.unsubscribe(room).await?;
        }
        Ok(())
    }
}

/// Ephemeral state on redis-native TTLs: `SET PX`/`GET`/`DEL` plus a
/// cursor `SCAN` for prefix queries.
pub struct RedisStore {
    conn: ConnectionManager,
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        // Millisecond expiry, matching the in-process store: the typing
        // and presence TTLs are configured in milliseconds.
        let expiry = SetExpiry::PX(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1));
        conn.set_options::<_, _, ()>(key, value, SetOptions::default().with_expiration(expiry))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    /// `SCAN` with `MATCH <prefix>*`. Only trailing-wildcard matching is
    /// supported; `prefix` must not contain glob metacharacters.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let pattern = format!("{prefix}*");
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}
