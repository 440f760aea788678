//! Worker pool: N concurrent task slots over one `ExecutionEngine`.
//!
//! The pool claims under its worker id, runs each task on its own spawned
//! future gated by a semaphore, wakes on the queue's notification with a poll
//! fallback for tasks coming off a retry backoff, and periodically reclaims
//! stale claims left behind by crashed workers. Shutdown is cooperative: the
//! broadcast signal stops claiming, and the pool drains in-flight tasks
//! before returning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::ExecutionEngine;

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent task slots.
    pub max_concurrent: usize,
    /// Claim lease; must comfortably exceed expected task duration or the
    /// engine must extend via checkpointing cadence.
    pub claim_lease: Duration,
    /// Poll fallback when the queue is quiet.
    pub poll_interval: Duration,
    /// How often stale claims are swept back to Pending.
    pub reclaim_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            claim_lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            reclaim_interval: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool {
    engine: Arc<ExecutionEngine>,
    worker_id: String,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(engine: Arc<ExecutionEngine>, worker_id: impl Into<String>) -> Self {
        Self {
            engine,
            worker_id: worker_id.into(),
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Claim-and-run loop. Returns once `shutdown` fires and all in-flight
    /// tasks have finished.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let reclaimer = self.spawn_reclaimer(shutdown.resubscribe());
        info!(
            worker_id = %self.worker_id,
            slots = self.config.max_concurrent,
            "worker pool started"
        );

        loop {
            // A free slot first, then work for it.
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self
                .engine
                .queue()
                .claim(&self.worker_id, self.config.claim_lease)
                .await
            {
                Ok(Some(task)) => {
                    debug!(worker_id = %self.worker_id, task_id = %task.id, "slot assigned");
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        // Step-level failures are already routed through
                        // queue.fail by the engine; an Err here is an
                        // infrastructure fault, and the claim lease will
                        // bring the task back.
                        if let Err(e) = engine.run(&task).await {
                            warn!(task_id = %task.id, error = %e, "task run errored");
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = self.engine.queue().changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "claim failed");
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        // Drain: every slot back means every spawned task is done.
        let _ = semaphore
            .acquire_many(self.config.max_concurrent as u32)
            .await;
        reclaimer.abort();
        info!(worker_id = %self.worker_id, "worker pool drained");
    }

    fn spawn_reclaimer(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let queue = self.engine.queue().clone();
        let interval = self.config.reclaim_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        match queue.reclaim_stale().await {
                            Ok(0) => {}
                            Ok(reclaimed) => info!(reclaimed, "stale claims reclaimed"),
                            Err(e) => warn!(error = %e, "stale-claim sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
