use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use keel_core::backend::{KvBackend, StoreError, VersionGate};
use keel_core::namespace;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Global budget for one acquisition attempt across all stores.
    pub acquire_timeout: Duration,
    /// Slack subtracted from the validity window to absorb clock drift
    /// between this process and the stores.
    pub clock_drift_allowance: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(500),
            clock_drift_allowance: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Records & outcomes
// ---------------------------------------------------------------------------

/// The record written to each lock store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub owner_token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// A held lock, as seen by its owner.
#[derive(Debug, Clone)]
pub struct Lock {
    pub resource: String,
    pub owner_token: Uuid,
    pub expires_at: DateTime<Utc>,
    /// Time remaining when the quorum was confirmed
    /// (`ttl − elapsed − clock_drift_allowance`).
    pub validity: Duration,
}

/// Result of an acquisition attempt.
///
/// `Denied` is the expected contention outcome ("resource busy"), never an
/// error: lost races, unavailable stores, and exhausted budgets all land
/// here, after partial writes have been rolled back best-effort.
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(Lock),
    Denied { resource: String },
}

impl AcquireOutcome {
    pub fn acquired(self) -> Option<Lock> {
        match self {
            AcquireOutcome::Acquired(lock) => Some(lock),
            AcquireOutcome::Denied { .. } => None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, AcquireOutcome::Denied { .. })
    }
}

/// Per-store view of a resource's current holder, for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreLockView {
    pub store_index: usize,
    /// `None` when the store has no live record (or could not be reached).
    pub holder: Option<LockRecord>,
    pub reachable: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The resource is held by someone else (or no quorum could be reached).
    #[error("resource busy: {resource}")]
    Denied { resource: String },
}

pub type Result<T> = std::result::Result<T, LockError>;

// ---------------------------------------------------------------------------
// QuorumLock
// ---------------------------------------------------------------------------

/// Redlock-style lock over N independent stores.
///
/// A strict majority (`N/2 + 1`) must accept the owner's record within the
/// acquisition budget, and the window left after the round trip must still be
/// positive, otherwise the attempt is rolled back and denied. Three or more
/// stores are required for the majority to mean anything.
#[derive(Clone)]
pub struct QuorumLock {
    stores: Arc<Vec<Arc<dyn KvBackend>>>,
    config: LockConfig,
}

impl QuorumLock {
    pub fn new(stores: Vec<Arc<dyn KvBackend>>, config: LockConfig) -> Self {
        Self {
            stores: Arc::new(stores),
            config,
        }
    }

    /// Strict majority of the store fleet.
    pub fn quorum(&self) -> usize {
        self.stores.len() / 2 + 1
    }

    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    /// Try to acquire `resource` for `ttl`.
    ///
    /// One pass over the stores, no internal retries. Store failures are
    /// absorbed by the quorum rule; they never surface as errors.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> AcquireOutcome {
        let token = Uuid::new_v4();
        let started = Instant::now();
        let key = namespace::lock_key(resource);
        let record = LockRecord {
            resource: resource.to_string(),
            owner_token: token,
            expires_at: Utc::now() + ttl,
        };
        let value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                warn!(resource, error = %e, "failed to encode lock record");
                return AcquireOutcome::Denied {
                    resource: resource.to_string(),
                };
            }
        };

        let mut wins = 0usize;
        for (idx, store) in self.stores.iter().enumerate() {
            let remaining = self.config.acquire_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                debug!(resource, "acquisition budget exhausted");
                break;
            }
            let attempt = store.put(&key, value.clone(), VersionGate::Absent, Some(ttl));
            match tokio::time::timeout(remaining, attempt).await {
                Ok(Ok(_)) => wins += 1,
                Ok(Err(StoreError::VersionConflict { .. })) => {
                    debug!(resource, store = idx, "lock already held on store");
                }
                Ok(Err(StoreError::Unavailable(e))) => {
                    warn!(resource, store = idx, error = %e, "lock store unavailable");
                }
                Err(_) => {
                    warn!(resource, store = idx, "lock store timed out");
                }
            }
        }

        let elapsed = started.elapsed();
        let validity = ttl.checked_sub(elapsed + self.config.clock_drift_allowance);

        match validity {
            Some(validity) if wins >= self.quorum() && !validity.is_zero() => {
                debug!(resource, wins, ?validity, "lock acquired");
                AcquireOutcome::Acquired(Lock {
                    resource: resource.to_string(),
                    owner_token: token,
                    expires_at: record.expires_at,
                    validity,
                })
            }
            _ => {
                debug!(resource, wins, quorum = self.quorum(), "lock denied");
                self.rollback(&key, token).await;
                AcquireOutcome::Denied {
                    resource: resource.to_string(),
                }
            }
        }
    }

    /// Push the lock's expiry forward by `ttl` from now.
    ///
    /// Only stores still carrying this owner's token accept the extension; a
    /// quorum of acceptances is required, otherwise `Denied` — the caller may
    /// treat that as advisory while the original validity window lasts.
    pub async fn extend(&self, lock: &mut Lock, ttl: Duration) -> Result<()> {
        let key = namespace::lock_key(&lock.resource);
        let expires_at = Utc::now() + ttl;
        let record = LockRecord {
            resource: lock.resource.clone(),
            owner_token: lock.owner_token,
            expires_at,
        };
        let value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(_) => {
                return Err(LockError::Denied {
                    resource: lock.resource.clone(),
                })
            }
        };

        let mut wins = 0usize;
        for (idx, store) in self.stores.iter().enumerate() {
            match self.owned_version(store.as_ref(), &key, lock.owner_token).await {
                Some(version) => {
                    match store
                        .put(&key, value.clone(), VersionGate::Exactly(version), Some(ttl))
                        .await
                    {
                        Ok(_) => wins += 1,
                        Err(e) => {
                            debug!(resource = %lock.resource, store = idx, error = %e, "extend rejected")
                        }
                    }
                }
                None => debug!(resource = %lock.resource, store = idx, "not the holder on store"),
            }
        }

        if wins >= self.quorum() {
            lock.expires_at = expires_at;
            Ok(())
        } else {
            warn!(resource = %lock.resource, wins, "lock extension denied");
            Err(LockError::Denied {
                resource: lock.resource.clone(),
            })
        }
    }

    /// Release the lock on every store still carrying this owner's token.
    ///
    /// Best-effort: unreachable stores will simply let their record expire.
    pub async fn release(&self, lock: &Lock) {
        let key = namespace::lock_key(&lock.resource);
        self.rollback(&key, lock.owner_token).await;
        debug!(resource = %lock.resource, "lock released");
    }

    /// Per-store view of the current holder, for inspection tooling.
    pub async fn inspect(&self, resource: &str) -> Vec<StoreLockView> {
        let key = namespace::lock_key(resource);
        let mut views = Vec::with_capacity(self.stores.len());
        for (idx, store) in self.stores.iter().enumerate() {
            let view = match store.get(&key).await {
                Ok(entry) => StoreLockView {
                    store_index: idx,
                    holder: entry.and_then(|e| serde_json::from_value(e.value).ok()),
                    reachable: true,
                },
                Err(_) => StoreLockView {
                    store_index: idx,
                    holder: None,
                    reachable: false,
                },
            };
            views.push(view);
        }
        views
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Delete the record from every store where `token` is still the owner.
    async fn rollback(&self, key: &str, token: Uuid) {
        for (idx, store) in self.stores.iter().enumerate() {
            if let Some(version) = self.owned_version(store.as_ref(), key, token).await {
                if let Err(e) = store.delete(key, VersionGate::Exactly(version)).await {
                    debug!(key, store = idx, error = %e, "rollback delete rejected");
                }
            }
        }
    }

    /// Version of the live record on `store` iff it belongs to `token`.
    async fn owned_version(&self, store: &dyn KvBackend, key: &str, token: Uuid) -> Option<u64> {
        let entry = store.get(key).await.ok()??;
        let record: LockRecord = serde_json::from_value(entry.value).ok()?;
        (record.owner_token == token).then_some(entry.version)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_core::backend::{Result as StoreResult, Versioned};
    use keel_core::MemoryKv;
    use serde_json::Value;

    fn fleet(n: usize) -> Vec<Arc<dyn KvBackend>> {
        (0..n)
            .map(|_| Arc::new(MemoryKv::new()) as Arc<dyn KvBackend>)
            .collect()
    }

    fn quick_config() -> LockConfig {
        LockConfig {
            acquire_timeout: Duration::from_millis(200),
            clock_drift_allowance: Duration::from_millis(5),
        }
    }

    /// A store that is always down.
    struct DownKv;

    #[async_trait]
    impl KvBackend for DownKv {
        async fn get(&self, _key: &str) -> StoreResult<Option<Versioned>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn put(
            &self,
            _key: &str,
            _value: Value,
            _gate: VersionGate,
            _ttl: Option<Duration>,
        ) -> StoreResult<u64> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _key: &str, _gate: VersionGate) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn scan(&self, _prefix: &str) -> StoreResult<Vec<(String, Versioned)>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn sweep_expired(&self) -> StoreResult<usize> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let lock = QuorumLock::new(fleet(3), quick_config());
        let held = lock
            .acquire("db-migration", Duration::from_secs(5))
            .await
            .acquired()
            .unwrap();
        assert_eq!(held.resource, "db-migration");
        assert!(held.validity > Duration::ZERO);

        lock.release(&held).await;
        assert!(lock
            .acquire("db-migration", Duration::from_secs(5))
            .await
            .acquired()
            .is_some());
    }

    #[tokio::test]
    async fn mutual_exclusion_concurrent_acquires() {
        let lock = QuorumLock::new(fleet(3), quick_config());

        let a = lock.clone();
        let b = lock.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.acquire("db-migration", Duration::from_secs(5)).await }),
            tokio::spawn(async move { b.acquire("db-migration", Duration::from_secs(5)).await }),
        );

        let wins = [ra.unwrap(), rb.unwrap()]
            .into_iter()
            .filter(|o| !o.is_denied())
            .count();
        assert_eq!(wins, 1, "exactly one concurrent acquirer may win");
    }

    #[tokio::test]
    async fn second_acquire_denied_while_held() {
        let lock = QuorumLock::new(fleet(3), quick_config());
        let _held = lock
            .acquire("res", Duration::from_secs(5))
            .await
            .acquired()
            .unwrap();

        assert!(lock.acquire("res", Duration::from_secs(5)).await.is_denied());
    }

    #[tokio::test]
    async fn tolerates_minority_store_down() {
        let mut stores = fleet(2);
        stores.push(Arc::new(DownKv));
        let lock = QuorumLock::new(stores, quick_config());

        assert!(lock
            .acquire("res", Duration::from_secs(5))
            .await
            .acquired()
            .is_some());
    }

    #[tokio::test]
    async fn denied_when_majority_down() {
        let healthy = Arc::new(MemoryKv::new());
        let stores: Vec<Arc<dyn KvBackend>> =
            vec![healthy.clone(), Arc::new(DownKv), Arc::new(DownKv)];
        let lock = QuorumLock::new(stores, quick_config());

        assert!(lock.acquire("res", Duration::from_secs(5)).await.is_denied());

        // The partial write on the healthy store must have been rolled back.
        let leftover = healthy.get("locks/res").await.unwrap();
        assert!(leftover.is_none(), "partial write was not rolled back");
    }

    #[tokio::test]
    async fn expired_lock_is_reacquirable() {
        let lock = QuorumLock::new(
            fleet(3),
            LockConfig {
                acquire_timeout: Duration::from_millis(200),
                clock_drift_allowance: Duration::from_millis(1),
            },
        );
        let _held = lock
            .acquire("res", Duration::from_millis(40))
            .await
            .acquired()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(lock
            .acquire("res", Duration::from_secs(5))
            .await
            .acquired()
            .is_some());
    }

    #[tokio::test]
    async fn extend_pushes_expiry_forward() {
        let lock = QuorumLock::new(fleet(3), quick_config());
        let mut held = lock
            .acquire("res", Duration::from_secs(1))
            .await
            .acquired()
            .unwrap();
        let before = held.expires_at;

        lock.extend(&mut held, Duration::from_secs(10)).await.unwrap();
        assert!(held.expires_at > before);
    }

    #[tokio::test]
    async fn extend_by_stranger_is_denied() {
        let lock = QuorumLock::new(fleet(3), quick_config());
        let held = lock
            .acquire("res", Duration::from_secs(5))
            .await
            .acquired()
            .unwrap();

        // A forged lock with a different token must not be able to extend.
        let mut forged = Lock {
            owner_token: Uuid::new_v4(),
            ..held.clone()
        };
        assert!(lock.extend(&mut forged, Duration::from_secs(10)).await.is_err());
    }

    #[tokio::test]
    async fn ttl_shorter_than_drift_is_denied() {
        let lock = QuorumLock::new(
            fleet(3),
            LockConfig {
                acquire_timeout: Duration::from_millis(200),
                clock_drift_allowance: Duration::from_millis(100),
            },
        );
        // Validity window would be non-positive before any work could happen.
        assert!(lock
            .acquire("res", Duration::from_millis(50))
            .await
            .is_denied());
    }

    #[tokio::test]
    async fn inspect_reports_holder() {
        let lock = QuorumLock::new(fleet(3), quick_config());
        let held = lock
            .acquire("res", Duration::from_secs(5))
            .await
            .acquired()
            .unwrap();

        let views = lock.inspect("res").await;
        assert_eq!(views.len(), 3);
        let holders = views.iter().filter_map(|v| v.holder.as_ref()).count();
        assert!(holders >= lock.quorum());
        assert!(views
            .iter()
            .filter_map(|v| v.holder.as_ref())
            .all(|h| h.owner_token == held.owner_token));
    }
}
