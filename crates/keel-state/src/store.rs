use std::sync::Arc;
use std::time::Duration;

use keel_core::backend::{KvBackend, StoreError, VersionGate, Versioned};
use keel_core::namespace;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{EventBus, StateEvent, Subscription};

/// What a read returns: value, monotonically increasing per-key version, and
/// timestamps.
pub type StateEntry = Versioned;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Callers must be able to tell a lost optimistic-concurrency race from the
/// store being unreachable — retrying a `VersionConflict` without re-reading
/// is a bug, retrying `Unavailable` is the correct move.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("version conflict on {key}: stored version is {found:?}")]
    VersionConflict { key: String, found: Option<u64> },
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for StateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { key, found } => StateError::VersionConflict {
                key: key
                    .strip_prefix(namespace::STATE_PREFIX)
                    .unwrap_or(&key)
                    .to_string(),
                found,
            },
            StoreError::Unavailable(msg) => StateError::Unavailable(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Shared state map with per-key versioning, TTL, and change notification.
///
/// Without an expected version, `set` is last-writer-wins. With one, the
/// write only lands if the stored version still matches, so two writers that
/// both read version `v` cannot both win. `expected_version = 0` means
/// create-only.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn KvBackend>,
    bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            bus: Arc::new(EventBus::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<StateEntry>> {
        Ok(self.backend.get(&namespace::state_key(key)).await?)
    }

    /// Write `value` at `key`, returning the new version.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        expected_version: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<u64> {
        let version = self
            .backend
            .put(&namespace::state_key(key), value.clone(), gate(expected_version), ttl)
            .await?;
        debug!(key, version, "state updated");
        self.bus.publish(StateEvent::updated(key, value, version));
        Ok(version)
    }

    pub async fn delete(&self, key: &str, expected_version: Option<u64>) -> Result<()> {
        self.backend
            .delete(&namespace::state_key(key), gate(expected_version))
            .await?;
        debug!(key, "state deleted");
        self.bus.publish(StateEvent::removed(key));
        Ok(())
    }

    /// Subscribe to future changes of `key`. No history replay: changes made
    /// before this call are never delivered. Drop the subscription to
    /// unsubscribe.
    pub fn subscribe(&self, key: &str) -> Subscription {
        self.bus.subscribe(key)
    }

    /// All live entries whose key starts with `prefix`, ordered by key.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, StateEntry)>> {
        let scan_prefix = namespace::state_key(prefix);
        let mut out = Vec::new();
        for (key, entry) in self.backend.scan(&scan_prefix).await? {
            let key = key
                .strip_prefix(namespace::STATE_PREFIX)
                .unwrap_or(&key)
                .to_string();
            out.push((key, entry));
        }
        Ok(out)
    }

    /// Physically remove TTL-expired entries. Reads already treat expired
    /// entries as absent; this just reclaims storage. Expiry is silent —
    /// subscribers observe the next write, not the sweep.
    pub async fn sweep_expired(&self) -> Result<usize> {
        Ok(self.backend.sweep_expired().await?)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) on a fixed interval until
    /// the returned handle is aborted or the runtime shuts down.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match store.sweep_expired().await {
                    Ok(0) => {}
                    Ok(swept) => debug!(swept, "ttl sweep removed expired entries"),
                    Err(e) => warn!(error = %e, "ttl sweep failed"),
                }
            }
        })
    }
}

fn gate(expected_version: Option<u64>) -> VersionGate {
    match expected_version {
        None => VersionGate::Any,
        Some(0) => VersionGate::Absent,
        Some(v) => VersionGate::Exactly(v),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
