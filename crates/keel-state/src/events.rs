use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

// ---------------------------------------------------------------------------
// StateEvent
// ---------------------------------------------------------------------------

/// One observed change on a key. `value`/`version` are `None` when the key
/// was deleted (or swept after TTL expiry).
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub key: String,
    pub value: Option<Value>,
    pub version: Option<u64>,
    pub at: DateTime<Utc>,
}

impl StateEvent {
    pub fn updated(key: &str, value: Value, version: u64) -> Self {
        Self {
            key: key.to_string(),
            value: Some(value),
            version: Some(version),
            at: Utc::now(),
        }
    }

    pub fn removed(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: None,
            version: None,
            at: Utc::now(),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.value.is_none()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving half of a per-key subscription. Dropping it unsubscribes; the
/// bus prunes the dead sender on the next publish for that key.
pub struct Subscription {
    receiver: flume::Receiver<StateEvent>,
}

impl Subscription {
    /// Wait for the next change. Returns `None` once the store is gone.
    pub async fn next(&self) -> Option<StateEvent> {
        self.receiver.recv_async().await.ok()
    }

    /// Non-blocking poll for an already-delivered change.
    pub fn try_next(&self) -> Option<StateEvent> {
        self.receiver.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Per-key fan-out of change events over unbounded flume channels.
pub(crate) struct EventBus {
    subscribers: DashMap<String, Vec<flume::Sender<StateEvent>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    pub(crate) fn subscribe(&self, key: &str) -> Subscription {
        let (tx, rx) = flume::unbounded();
        self.subscribers.entry(key.to_string()).or_default().push(tx);
        Subscription { receiver: rx }
    }

    pub(crate) fn publish(&self, event: StateEvent) {
        let Some(mut senders) = self.subscribers.get_mut(&event.key) else {
            return;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(key = %event.key, listeners = senders.len(), "state change published");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
