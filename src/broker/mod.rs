//! Event broker: per-room fan-out plus the ephemeral TTL store, behind one
//! interface with two interchangeable backends.
//!
//! The in-process backend is for single-instance deployments only; the
//! redis backend uses the server's native channels and TTLs so any number
//! of instances agree on fan-out and ephemeral state. All call sites go
//! through [`Broker`] and never branch on the backend.

pub mod memory;
pub mod redis;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::events::Event;

use self::memory::{MemoryBus, MemoryStore};

/// Returned by a sink whose receiving side is gone. The only valid
/// reaction is to stop delivering to that subscriber.
#[derive(Debug)]
pub struct SinkClosed;

/// Where a subscription delivers its events: an async callback invoked
/// once per published event, in publish order.
pub type EventSink = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), SinkClosed>> + Send + Sync>;

/// Handle identifying one subscription within its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

#[derive(Debug)]
pub enum BrokerError {
    /// Backend connectivity or protocol failure. Never reported as an
    /// absent value.
    Backend(::redis::RedisError),
    /// An envelope could not be encoded or decoded for the wire.
    Codec(serde_json::Error),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Backend(e) => write!(f, "broker backend failure: {e}"),
            BrokerError::Codec(e) => write!(f, "event codec failure: {e}"),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Backend(e) => Some(e),
            BrokerError::Codec(e) => Some(e),
        }
    }
}

impl From<::redis::RedisError> for BrokerError {
    fn from(err: ::redis::RedisError) -> Self {
        BrokerError::Backend(err)
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Codec(err)
    }
}

/// Per-room publish/subscribe fan-out.
///
/// Delivery is best-effort and non-durable: a subscriber only sees events
/// published strictly between its subscribe and unsubscribe. Order is
/// preserved per publisher per subscriber; there is no total order.
#[async_trait]
pub trait RoomBus: Send + Sync {
    async fn publish(&self, room: &str, event: &Event) -> Result<(), BrokerError>;
    async fn subscribe(&self, room: &str, sink: EventSink) -> Result<SubscriptionId, BrokerError>;
    async fn unsubscribe(&self, room: &str, id: SubscriptionId) -> Result<(), BrokerError>;
}

/// TTL key/value store for typing and presence markers.
///
/// A read past expiry returns `None` even if nothing ever deleted the key,
/// and expired keys are eventually reclaimed even if never read.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError>;
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;
    /// Returns the live keys starting with `prefix`. Backends only support
    /// prefix-with-trailing-wildcard matching; `prefix` must not contain
    /// glob metacharacters.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;
}

/// Build a sink backed by an unbounded channel.
///
/// The receiving half goes to the subscriber's own task; the sink starts
/// failing once that half is dropped, which is how the bus learns a
/// subscriber is gone.
pub fn channel_sink() -> (EventSink, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: EventSink = Arc::new(move |event: Event| {
        let tx = tx.clone();
        async move { tx.send(event).map_err(|_| SinkClosed) }.boxed()
    });
    (sink, rx)
}

/// Composes a [`RoomBus`] and an [`EphemeralStore`] behind one interface,
/// and owns the backend's background tasks (ephemeral sweep or pub/sub
/// listener).
///
/// Constructed once at startup and passed through `AppState`; there is no
/// process-wide singleton.
pub struct Broker {
    bus: Arc<dyn RoomBus>,
    store: Arc<dyn EphemeralStore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// In-process backend: local fan-out and a swept in-memory TTL map.
    pub fn in_process() -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let store = Arc::new(MemoryStore::new());
        let sweep = tokio::spawn(memory::sweep_loop(store.clone(), shutdown_rx));
        Self {
            bus: Arc::new(MemoryBus::new()),
            store,
            shutdown,
            tasks: Mutex::new(vec![sweep]),
        }
    }

    /// Shared backend: fan-out over redis channels, ephemeral state with
    /// native TTLs. Fails if the server is unreachable.
    pub async fn shared(redis_url: &str) -> Result<Self, BrokerError> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (bus, store, listener) = self::redis::connect(redis_url, shutdown_rx).await?;
        Ok(Self {
            bus,
            store,
            shutdown,
            tasks: Mutex::new(vec![listener]),
        })
    }

    pub async fn publish(&self, room: &str, event: &Event) -> Result<(), BrokerError> {
        self.bus.publish(room, event).await
    }

    pub async fn subscribe(
        &self,
        room: &str,
        sink: EventSink,
    ) -> Result<SubscriptionId, BrokerError> {
        self.bus.subscribe(room, sink).await
    }

    pub async fn unsubscribe(&self, room: &str, id: SubscriptionId) -> Result<(), BrokerError> {
        self.bus.unsubscribe(room, id).await
    }

    pub async fn set_ephemeral(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        self.store.set(key, value, ttl).await
    }

    pub async fn get_ephemeral(&self, key: &str) -> Result<Option<String>, BrokerError> {
        self.store.get(key).await
    }

    pub async fn delete_ephemeral(&self, key: &str) -> Result<(), BrokerError> {
        self.store.delete(key).await
    }

    pub async fn scan_ephemeral(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        self.store.scan_prefix(prefix).await
    }

    /// Signal the background tasks and wait for them to finish before the
    /// backend connections drop. Nothing is abandoned mid-flight.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(?e, "broker background task failed during shutdown");
                }
            }
        }
    }
}

/// Sequential best-effort delivery to every local sink of a room.
///
/// A failing sink is logged, skipped, and removed; it never blocks other
/// sinks or the publisher.
pub(crate) async fn fan_out(
    subs: &dashmap::DashMap<String, Vec<(SubscriptionId, EventSink)>>,
    room: &str,
    event: &Event,
) {
    let sinks: Vec<(SubscriptionId, EventSink)> = match subs.get(room) {
        Some(entry) => entry.value().clone(),
        None => return,
    };

    let mut dead = Vec::new();
    for (id, sink) in sinks {
        if sink(event.clone()).await.is_err() {
            tracing::debug!(%room, subscription = id.0, "sink closed; dropping subscriber");
            dead.push(id);
        }
    }

    if !dead.is_empty() {
        if let Some(mut entry) = subs.get_mut(room) {
            entry.retain(|(id, _)| !dead.contains(id));
        }
    }
}
