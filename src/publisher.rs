//! Hand-off from synchronous write paths into the broker.
//!
//! The data API's post-commit hook must not block on fan-out, so publishes
//! go through a bounded channel drained by one pump task. A full queue
//! drops the event with a warning; delivery stays best-effort.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::events::Event;

/// Queue depth for in-flight publishes.
const PUBLISH_QUEUE_CAPACITY: usize = 1024;

/// Cloneable handle for fire-and-forget publishing.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<(String, Event)>,
}

impl EventPublisher {
    /// Start the pump task draining the queue into `broker.publish`.
    /// The task ends once every handle is dropped.
    pub fn spawn(broker: Arc<Broker>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<(String, Event)>(PUBLISH_QUEUE_CAPACITY);
        let pump = tokio::spawn(async move {
            while let Some((room, event)) = rx.recv().await {
                if let Err(e) = broker.publish(&room, &event).await {
                    tracing::warn!(%e, %room, "publish failed; event dropped");
                }
            }
        });
        (Self { tx }, pump)
    }

    /// Enqueue without waiting. Safe to call from any task or thread.
    pub fn try_publish(&self, room: String, event: Event) {
        if let Err(e) = self.tx.try_send((room, event)) {
            tracing::warn!(%e, "publish queue full or closed; event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::channel_sink;

    #[tokio::test]
    async fn queued_events_reach_subscribers() {
        let broker = Arc::new(Broker::in_process());
        let (sink, mut rx) = channel_sink();
        broker.subscribe("room-a", sink).await.unwrap();

        let (publisher, _pump) = EventPublisher::spawn(broker.clone());
        publisher.try_publish("room-a".to_string(), Event::subscribed("room-a"));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.payload["room"], "room-a");
        broker.shutdown().await;
    }
}
