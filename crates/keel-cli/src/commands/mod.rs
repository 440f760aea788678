pub mod approvals;
pub mod lock;
pub mod queue;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use keel_core::backend::KvBackend;
use keel_core::config::KernelConfig;
use keel_core::SqliteKv;
use keel_lock::{LockConfig, QuorumLock};
use keel_queue::TaskQueue;
use keel_safety::{JsonlAuditSink, SafetyController};
use keel_state::StateStore;

/// Everything a subcommand needs, wired from the config file. All commands
/// go through the same contract APIs the engine uses; the CLI never touches
/// the SQLite files directly.
pub struct Context {
    pub queue: TaskQueue,
    pub locks: QuorumLock,
    pub safety: SafetyController,
}

impl Context {
    pub async fn load(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => KernelConfig::load_from(path)?,
            None => KernelConfig::load()?,
        };
        std::fs::create_dir_all(&config.storage.data_dir)
            .with_context(|| format!("creating {}", config.storage.data_dir.display()))?;

        let queue_backend = SqliteKv::open(config.storage.queue_db())
            .await
            .context("opening queue store")?;
        let queue = TaskQueue::new(Arc::new(queue_backend));

        let state_backend = SqliteKv::open(config.storage.state_db())
            .await
            .context("opening state store")?;
        let state = StateStore::new(Arc::new(state_backend));

        let mut lock_stores: Vec<Arc<dyn KvBackend>> = Vec::new();
        for path in config.lock.store_paths(&config.storage) {
            let store = SqliteKv::open(&path)
                .await
                .with_context(|| format!("opening lock store {}", path.display()))?;
            lock_stores.push(Arc::new(store));
        }
        let locks = QuorumLock::new(
            lock_stores,
            LockConfig {
                acquire_timeout: Duration::from_millis(config.lock.acquire_timeout_ms),
                clock_drift_allowance: Duration::from_millis(config.lock.clock_drift_ms),
            },
        );

        let audit = JsonlAuditSink::open(config.safety.audit_log_path(&config.storage))
            .context("opening audit log")?;
        let safety = SafetyController::new(state, Arc::new(audit))
            .with_approval_timeout(Duration::from_millis(config.safety.approval_timeout_ms));

        Ok(Self {
            queue,
            locks,
            safety,
        })
    }
}
