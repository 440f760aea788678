use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::backend::{KvBackend, Result, StoreError, VersionGate, Versioned};

// ---------------------------------------------------------------------------
// MemoryKv
// ---------------------------------------------------------------------------

/// In-memory backing store.
///
/// Gate checks and the subsequent write happen under the dashmap entry lock,
/// so compare-and-swap is atomic per key. Used as the lock-store fleet in
/// tests and as a scratch backend for single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: DashMap<String, Versioned>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn conflict(key: &str, found: Option<u64>) -> StoreError {
    StoreError::VersionConflict {
        key: key.to_string(),
        found,
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let now = Utc::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        gate: VersionGate,
        ttl: Option<Duration>,
    ) -> Result<u64> {
        let now = Utc::now();
        let expires_at = ttl.map(|d| now + d);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = !occupied.get().is_expired(now);
                let found = live.then(|| occupied.get().version);
                match gate {
                    VersionGate::Absent if live => Err(conflict(key, found)),
                    VersionGate::Exactly(expected) if found != Some(expected) => {
                        Err(conflict(key, found))
                    }
                    _ => {
                        let next = found.map_or(1, |v| v + 1);
                        occupied.insert(Versioned {
                            value,
                            version: next,
                            updated_at: now,
                            expires_at,
                        });
                        Ok(next)
                    }
                }
            }
            Entry::Vacant(vacant) => match gate {
                VersionGate::Exactly(_) => Err(conflict(key, None)),
                VersionGate::Any | VersionGate::Absent => {
                    vacant.insert(Versioned {
                        value,
                        version: 1,
                        updated_at: now,
                        expires_at,
                    });
                    Ok(1)
                }
            },
        }
    }

    async fn delete(&self, key: &str, gate: VersionGate) -> Result<()> {
        let now = Utc::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let live = !occupied.get().is_expired(now);
                let found = live.then(|| occupied.get().version);
                match gate {
                    VersionGate::Exactly(expected) if found != Some(expected) => {
                        Err(conflict(key, found))
                    }
                    VersionGate::Absent if live => Err(conflict(key, found)),
                    _ => {
                        occupied.remove();
                        Ok(())
                    }
                }
            }
            Entry::Vacant(_) => match gate {
                VersionGate::Exactly(_) => Err(conflict(key, None)),
                VersionGate::Any | VersionGate::Absent => Ok(()),
            },
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let now = Utc::now();
        let mut out: Vec<(String, Versioned)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.is_expired(now))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - self.entries.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
