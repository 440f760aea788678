//! keel-lock
//!
//! Quorum-based distributed mutual exclusion. A lock is held when a strict
//! majority of independent backing stores accepted the holder's record before
//! the acquisition budget ran out and the remaining validity window is still
//! positive. No store ever trusts a caller without the owner token, so an
//! expired holder cannot clobber a successor.
//!
//! Acquisition never retries internally; callers own the retry/backoff
//! policy. For critical sections, [`QuorumLock::with_lock`] releases on every
//! exit path, including panics.

pub mod guard;
pub mod quorum;

pub use guard::LockHandle;
pub use quorum::{AcquireOutcome, Lock, LockConfig, LockError, LockRecord, QuorumLock, StoreLockView};
