//! In-process broker backends. Single instance only: nothing here crosses
//! a process boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::events::Event;

use super::{fan_out, BrokerError, EphemeralStore, EventSink, RoomBus, SubscriptionId};

/// How often the sweep task reclaims expired ephemeral entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Local fan-out over a subscriber map. Rooms exist implicitly while they
/// have at least one subscriber.
pub struct MemoryBus {
    subs: DashMap<String, Vec<(SubscriptionId, EventSink)>>,
    next_id: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            subs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl RoomBus for MemoryBus {
    async fn publish(&self, room: &str, event: &Event) -> Result<(), BrokerError> {
        fan_out(&self.subs, room, event).await;
        Ok(())
    }

    async fn subscribe(&self, room: &str, sink: EventSink) -> Result<SubscriptionId, BrokerError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subs.entry(room.to_string()).or_default().push((id, sink));
        Ok(id)
    }

    async fn unsubscribe(&self, room: &str, id: SubscriptionId) -> Result<(), BrokerError> {
        if let Some(mut entry) = self.subs.get_mut(room) {
            entry.retain(|(sid, _)| *sid != id);
        }
        self.subs.remove_if(room, |_, sinks| sinks.is_empty());
        Ok(())
    }
}

/// TTL map backed by `DashMap`. Uses the tokio clock so expiry is testable
/// under a paused runtime.
pub struct MemoryStore {
    data: DashMap<String, (String, Instant)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Drop every expired entry. Returns how many were reclaimed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, (_, expires_at)| *expires_at > now);
        before - self.data.len()
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.data
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let now = Instant::now();
        match self.data.get(key) {
            Some(entry) if entry.1 > now => Ok(Some(entry.0.clone())),
            Some(entry) => {
                // Expired but not yet swept: self-heal on read.
                drop(entry);
                self.data.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.data.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let now = Instant::now();
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().1 > now)
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// Periodic reclaim of expired ephemeral entries, one task per process.
/// Runs until the broker signals shutdown.
pub(crate) async fn sweep_loop(store: Arc<MemoryStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(SWEEP_INTERVAL);
    ticker.tick().await; // First tick fires immediately; skip it.
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "swept expired ephemeral keys");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
