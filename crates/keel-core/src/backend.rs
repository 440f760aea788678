use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Versioned
// ---------------------------------------------------------------------------

/// A stored value together with its version metadata.
///
/// Versions increase by one on every successful write to a live entry. An
/// entry whose `expires_at` has passed behaves as absent everywhere: `get`
/// returns `None` for it, and a create-only write may replace it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned {
    pub value: Value,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Versioned {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

// ---------------------------------------------------------------------------
// VersionGate
// ---------------------------------------------------------------------------

/// Condition a write or delete must satisfy against the stored version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionGate {
    /// Unconditional — last writer wins.
    Any,
    /// Create-only: succeeds only when no live entry exists under the key.
    Absent,
    /// Succeeds only when the stored version matches exactly.
    Exactly(u64),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by a backing store.
///
/// Callers must be able to tell a concurrency collision apart from transient
/// infrastructure trouble: a `VersionConflict` means "re-read and retry your
/// merge", an `Unavailable` means "back off and try again".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The gate did not match the stored version. `found` is the live version
    /// at the time of the attempt (`None` when the entry was absent).
    #[error("version conflict on {key}: found version {found:?}")]
    VersionConflict { key: String, found: Option<u64> },
    /// The store could not be reached or failed transiently.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// KvBackend
// ---------------------------------------------------------------------------

/// Backing-store port shared by the lock stores, the task queue, and the
/// state store: read-with-version plus compare-and-swap writes.
///
/// Keys are flat strings; the kernel lays them out under the `locks/`,
/// `tasks/`, and `state/` namespaces (see [`crate::namespace`]). TTLs are
/// absolute at write time and evaluated lazily on read; [`sweep_expired`]
/// exists so an owner can reclaim space periodically.
///
/// [`sweep_expired`]: KvBackend::sweep_expired
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read the live entry under `key`. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` under `key` if `gate` matches, returning the new version.
    ///
    /// A write to an absent (or expired) key starts the version counter at 1.
    async fn put(
        &self,
        key: &str,
        value: Value,
        gate: VersionGate,
        ttl: Option<Duration>,
    ) -> Result<u64>;

    /// Delete the entry under `key` if `gate` matches.
    ///
    /// Deleting an absent key with `VersionGate::Any` is a no-op;
    /// with `VersionGate::Exactly` it is a conflict.
    async fn delete(&self, key: &str, gate: VersionGate) -> Result<()>;

    /// List live entries whose key starts with `prefix`, ordered by key.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Remove expired entries, returning how many were dropped.
    async fn sweep_expired(&self) -> Result<usize>;
}
