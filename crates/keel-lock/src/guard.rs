use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::quorum::{AcquireOutcome, Lock, LockError, QuorumLock, Result};

// ---------------------------------------------------------------------------
// LockHandle
// ---------------------------------------------------------------------------

/// Owner-side handle that ties a held [`Lock`] to its [`QuorumLock`].
///
/// Prefer the explicit [`release`](Self::release). If the handle is dropped
/// without it (early return, panic unwind), a best-effort release is spawned
/// onto the runtime; if no runtime is available the records simply expire.
pub struct LockHandle {
    lock: Option<Lock>,
    owner: QuorumLock,
}

impl LockHandle {
    pub fn new(lock: Lock, owner: QuorumLock) -> Self {
        Self {
            lock: Some(lock),
            owner,
        }
    }

    pub fn lock(&self) -> &Lock {
        self.lock.as_ref().expect("handle not yet released")
    }

    /// Extend the held lock; failures are advisory while validity remains.
    pub async fn extend(&mut self, ttl: Duration) -> Result<()> {
        let lock = self.lock.as_mut().expect("handle not yet released");
        self.owner.extend(lock, ttl).await
    }

    /// Release the lock on all stores.
    pub async fn release(mut self) {
        if let Some(lock) = self.lock.take() {
            self.owner.release(&lock).await;
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let owner = self.owner.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        debug!(resource = %lock.resource, "releasing lock from drop guard");
                        owner.release(&lock).await;
                    });
                }
                Err(_) => {
                    warn!(
                        resource = %lock.resource,
                        "no runtime for drop-release; lock will expire passively"
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scoped acquisition
// ---------------------------------------------------------------------------

impl QuorumLock {
    /// Run `f` while holding `resource`, releasing on every exit path.
    ///
    /// Returns `Err(Denied)` without running `f` when the lock cannot be
    /// acquired. The guarded block receives a copy of the held [`Lock`] so it
    /// can check `expires_at` for long sections.
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, ttl: Duration, f: F) -> Result<T>
    where
        F: FnOnce(Lock) -> Fut,
        Fut: Future<Output = T>,
    {
        match self.acquire(resource, ttl).await {
            AcquireOutcome::Denied { resource } => Err(LockError::Denied { resource }),
            AcquireOutcome::Acquired(lock) => {
                let guard = LockHandle::new(lock.clone(), self.clone());
                let out = f(lock).await;
                guard.release().await;
                Ok(out)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::LockConfig;
    use keel_core::backend::KvBackend;
    use keel_core::MemoryKv;
    use std::sync::Arc;

    fn quick_lock() -> QuorumLock {
        let stores: Vec<Arc<dyn KvBackend>> = (0..3)
            .map(|_| Arc::new(MemoryKv::new()) as Arc<dyn KvBackend>)
            .collect();
        QuorumLock::new(
            stores,
            LockConfig {
                acquire_timeout: Duration::from_millis(200),
                clock_drift_allowance: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn with_lock_runs_and_releases() {
        let lock = quick_lock();
        let out = lock
            .with_lock("res", Duration::from_secs(5), |held| async move {
                assert_eq!(held.resource, "res");
                42
            })
            .await
            .unwrap();
        assert_eq!(out, 42);

        // Released: immediately reacquirable.
        assert!(lock
            .acquire("res", Duration::from_secs(5))
            .await
            .acquired()
            .is_some());
    }

    #[tokio::test]
    async fn with_lock_denied_when_held() {
        let lock = quick_lock();
        let _held = lock
            .acquire("res", Duration::from_secs(5))
            .await
            .acquired()
            .unwrap();

        let attempt = lock
            .with_lock("res", Duration::from_secs(5), |_| async { 1 })
            .await;
        assert!(matches!(attempt, Err(LockError::Denied { .. })));
    }

    #[tokio::test]
    async fn drop_guard_releases_in_background() {
        let lock = quick_lock();
        {
            let held = lock
                .acquire("res", Duration::from_secs(5))
                .await
                .acquired()
                .unwrap();
            let _guard = LockHandle::new(held, lock.clone());
            // Dropped here without an explicit release.
        }
        // Give the spawned drop-release a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(lock
            .acquire("res", Duration::from_secs(5))
            .await
            .acquired()
            .is_some());
    }

    #[tokio::test]
    async fn handle_extend_delegates() {
        let lock = quick_lock();
        let held = lock
            .acquire("res", Duration::from_secs(1))
            .await
            .acquired()
            .unwrap();
        let before = held.expires_at;

        let mut guard = LockHandle::new(held, lock.clone());
        guard.extend(Duration::from_secs(10)).await.unwrap();
        assert!(guard.lock().expires_at > before);
        guard.release().await;
    }
}
