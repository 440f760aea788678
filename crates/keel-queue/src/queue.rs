use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_core::backend::{KvBackend, StoreError, VersionGate};
use keel_core::namespace;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::retry::BackoffPolicy;
use crate::task::{TaskRecord, TaskStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("corrupt task record {0}: {1}")]
    Corrupt(Uuid, String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

// ---------------------------------------------------------------------------
// QueueCounts
// ---------------------------------------------------------------------------

/// Per-status totals for observability and the management surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub succeeded: usize,
    pub dead_lettered: usize,
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// Priority task queue over a single versioned backing store.
///
/// Every mutation is one compare-and-swap on the task record, keyed on the
/// version observed at read time; losing a race yields `VersionConflict`
/// inside and is handled by moving on to the next candidate (claims) or
/// surfacing to the caller (explicit transitions).
#[derive(Clone)]
pub struct TaskQueue {
    backend: Arc<dyn KvBackend>,
    backoff: BackoffPolicy,
    notify: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_backoff(backend, BackoffPolicy::default())
    }

    pub fn with_backoff(backend: Arc<dyn KvBackend>, backoff: BackoffPolicy) -> Self {
        Self {
            backend,
            backoff,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Wait until the queue signals that new work may be claimable.
    ///
    /// Purely advisory — spurious wakeups are fine, and callers should keep a
    /// poll fallback for tasks coming off a retry backoff.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Create a new Pending task. Lower `priority` dequeues first.
    pub async fn enqueue(
        &self,
        payload: Value,
        priority: i64,
        max_attempts: u32,
    ) -> Result<TaskRecord> {
        let task = TaskRecord::new(payload, priority, max_attempts);
        self.save(&task, VersionGate::Absent).await?;
        info!(task_id = %task.id, priority, "task enqueued");
        self.notify.notify_one();
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Claim the best eligible task under a lease, or return `None`.
    ///
    /// Non-blocking: an empty queue returns immediately. Eligibility is
    /// Pending status past any `not_before`; ordering is `(priority,
    /// created_at)` ascending. The status flip to Claimed is a conditional
    /// write, so concurrent claimers cannot both win the same task — the
    /// loser just tries the next candidate.
    pub async fn claim(
        &self,
        consumer_id: &str,
        lease: Duration,
    ) -> Result<Option<TaskRecord>> {
        let now = Utc::now();
        let mut candidates = Vec::new();
        for (key, entry) in self.backend.scan(namespace::TASK_PREFIX).await? {
            let task: TaskRecord = match serde_json::from_value(entry.value) {
                Ok(task) => task,
                Err(e) => {
                    warn!(key, error = %e, "skipping unreadable task record");
                    continue;
                }
            };
            if task.is_claimable(now) {
                candidates.push((task, entry.version));
            }
        }
        candidates.sort_by(|a, b| {
            (a.0.priority, a.0.created_at).cmp(&(b.0.priority, b.0.created_at))
        });

        for (mut task, version) in candidates {
            task.transition(TaskStatus::Claimed);
            task.claimed_by = Some(consumer_id.to_string());
            task.claim_expires_at = Some(Utc::now() + lease);

            match self.save(&task, VersionGate::Exactly(version)).await {
                Ok(_) => {
                    debug!(task_id = %task.id, consumer_id, "task claimed");
                    return Ok(Some(task));
                }
                Err(QueueError::Store(StoreError::VersionConflict { .. })) => {
                    // Lost the race for this one; try the next candidate.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Record that execution of a claimed task has started.
    pub async fn mark_running(&self, task_id: Uuid) -> Result<()> {
        let (mut task, version) = self.load(task_id).await?;
        if task.status != TaskStatus::Claimed {
            return Err(QueueError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        task.transition(TaskStatus::Running);
        self.save(&task, VersionGate::Exactly(version)).await?;
        Ok(())
    }

    /// Mark a task Succeeded and drop its claim.
    ///
    /// Completing an already-Succeeded task is a no-op, so redelivered work
    /// that raced its own completion cannot corrupt state.
    pub async fn complete(&self, task_id: Uuid) -> Result<()> {
        let (mut task, version) = self.load(task_id).await?;
        match task.status {
            TaskStatus::Succeeded => return Ok(()),
            TaskStatus::Claimed | TaskStatus::Running => {}
            from => {
                return Err(QueueError::InvalidTransition {
                    id: task_id,
                    from,
                    to: TaskStatus::Succeeded,
                })
            }
        }
        task.transition(TaskStatus::Succeeded);
        task.claimed_by = None;
        task.claim_expires_at = None;
        self.save(&task, VersionGate::Exactly(version)).await?;
        info!(task_id = %task_id, "task completed");
        Ok(())
    }

    /// Record a failed attempt: back off and retry, or dead-letter once the
    /// attempt budget is spent.
    pub async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        let (mut task, version) = self.load(task_id).await?;
        if task.is_terminal() {
            return Err(QueueError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::Failed,
            });
        }

        task.attempts += 1;
        task.last_error = Some(error.to_string());
        task.claimed_by = None;
        task.claim_expires_at = None;
        task.transition(TaskStatus::Failed);

        if task.attempts >= task.max_attempts {
            task.transition(TaskStatus::DeadLettered);
            warn!(
                task_id = %task_id,
                attempts = task.attempts,
                error,
                "task dead-lettered"
            );
        } else {
            let delay = self.backoff.jittered(task.attempts);
            task.not_before = Some(Utc::now() + delay);
            task.transition(TaskStatus::Pending);
            info!(
                task_id = %task_id,
                attempts = task.attempts,
                delay_ms = delay.as_millis() as u64,
                "task failed; retry scheduled"
            );
        }

        self.save(&task, VersionGate::Exactly(version)).await?;
        self.notify.notify_one();
        Ok(())
    }

    /// Reset Claimed tasks whose lease has lapsed, counting each attempt.
    ///
    /// This is the recovery path for consumers that crashed mid-task. A task
    /// whose budget is already spent goes straight to DeadLettered.
    pub async fn reclaim_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let mut reclaimed = 0usize;
        for (key, entry) in self.backend.scan(namespace::TASK_PREFIX).await? {
            let task: TaskRecord = match serde_json::from_value(entry.value) {
                Ok(task) => task,
                Err(e) => {
                    warn!(key, error = %e, "skipping unreadable task record");
                    continue;
                }
            };
            if !task.is_stale_claim(now) {
                continue;
            }

            let mut task = task;
            task.attempts += 1;
            task.claimed_by = None;
            task.claim_expires_at = None;
            if task.attempts >= task.max_attempts {
                task.transition(TaskStatus::DeadLettered);
            } else {
                task.transition(TaskStatus::Pending);
            }

            match self.save(&task, VersionGate::Exactly(entry.version)).await {
                Ok(_) => {
                    warn!(task_id = %task.id, attempts = task.attempts, "stale claim reclaimed");
                    reclaimed += 1;
                }
                Err(QueueError::Store(StoreError::VersionConflict { .. })) => {
                    // Someone else touched it first; leave it to them.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        if reclaimed > 0 {
            self.notify.notify_one();
        }
        Ok(reclaimed)
    }

    // -----------------------------------------------------------------------
    // Read APIs
    // -----------------------------------------------------------------------

    pub async fn get(&self, task_id: Uuid) -> Result<TaskRecord> {
        Ok(self.load(task_id).await?.0)
    }

    /// Dead-lettered tasks, oldest first, for the review workflow.
    pub async fn list_dead_lettered(&self) -> Result<Vec<TaskRecord>> {
        let mut out = Vec::new();
        for (_, entry) in self.backend.scan(namespace::TASK_PREFIX).await? {
            if let Ok(task) = serde_json::from_value::<TaskRecord>(entry.value) {
                if task.status == TaskStatus::DeadLettered {
                    out.push(task);
                }
            }
        }
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    pub async fn counts_by_status(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for (_, entry) in self.backend.scan(namespace::TASK_PREFIX).await? {
            if let Ok(task) = serde_json::from_value::<TaskRecord>(entry.value) {
                match task.status {
                    TaskStatus::Pending => counts.pending += 1,
                    TaskStatus::Claimed => counts.claimed += 1,
                    TaskStatus::Running => counts.running += 1,
                    TaskStatus::Succeeded => counts.succeeded += 1,
                    TaskStatus::DeadLettered => counts.dead_lettered += 1,
                    // Failed is only ever a transient history entry.
                    TaskStatus::Failed => {}
                }
            }
        }
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load(&self, task_id: Uuid) -> Result<(TaskRecord, u64)> {
        let key = namespace::task_key(task_id);
        let entry = self
            .backend
            .get(&key)
            .await?
            .ok_or(QueueError::NotFound(task_id))?;
        let task = serde_json::from_value(entry.value)
            .map_err(|e| QueueError::Corrupt(task_id, e.to_string()))?;
        Ok((task, entry.version))
    }

    async fn save(&self, task: &TaskRecord, gate: VersionGate) -> Result<u64> {
        let key = namespace::task_key(task.id);
        let value = serde_json::to_value(task)
            .map_err(|e| QueueError::Corrupt(task.id, e.to_string()))?;
        Ok(self.backend.put(&key, value, gate, None).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::MemoryKv;
    use serde_json::json;

    fn quick_queue() -> TaskQueue {
        TaskQueue::with_backoff(
            Arc::new(MemoryKv::new()),
            BackoffPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(100),
                multiplier: 2.0,
                jitter_ratio: 0.0,
            },
        )
    }

    #[tokio::test]
    async fn enqueue_then_claim() {
        let queue = quick_queue();
        let task = queue.enqueue(json!({"op": "a"}), 5, 3).await.unwrap();

        let claimed = queue
            .claim("worker-1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));

        // Nothing else to claim.
        assert!(queue
            .claim("worker-2", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let queue = quick_queue();
        let low = queue.enqueue(json!({}), 10, 3).await.unwrap();
        let high = queue.enqueue(json!({}), 1, 3).await.unwrap();

        let first = queue
            .claim("w", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, high.id);
        let second = queue
            .claim("w", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    async fn concurrent_claims_get_distinct_tasks() {
        let queue = quick_queue();
        queue.enqueue(json!({"n": 1}), 1, 3).await.unwrap();
        queue.enqueue(json!({"n": 2}), 1, 3).await.unwrap();

        let (a, b) = tokio::join!(
            queue.claim("w1", Duration::from_secs(30)),
            queue.claim("w2", Duration::from_secs(30)),
        );
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();
        assert_ne!(a.id, b.id, "two claimers must never own the same task");
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let queue = quick_queue();
        let task = queue.enqueue(json!({}), 0, 3).await.unwrap();
        queue.claim("w", Duration::from_secs(30)).await.unwrap();

        queue.complete(task.id).await.unwrap();
        // Second completion is a no-op, not an error.
        queue.complete(task.id).await.unwrap();
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn complete_unclaimed_task_is_rejected() {
        let queue = quick_queue();
        let task = queue.enqueue(json!({}), 0, 3).await.unwrap();
        assert!(matches!(
            queue.complete(task.id).await,
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn three_failures_dead_letter_at_attempts_three() {
        let queue = quick_queue();
        let task = queue.enqueue(json!({}), 0, 3).await.unwrap();

        for round in 1..=3u32 {
            // Wait out any retry backoff from the previous round.
            let claimed = loop {
                match queue.claim("w", Duration::from_secs(30)).await.unwrap() {
                    Some(t) => break t,
                    None => tokio::time::sleep(Duration::from_millis(15)).await,
                }
            };
            assert_eq!(claimed.id, task.id);
            queue.fail(task.id, &format!("boom {round}")).await.unwrap();
        }

        let after = queue.get(task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::DeadLettered);
        assert_eq!(after.attempts, 3);
        assert_eq!(after.last_error.as_deref(), Some("boom 3"));

        // Dead-lettered tasks are excluded from claim forever.
        assert!(queue
            .claim("w", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.list_dead_lettered().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_task_backs_off_before_retry() {
        let queue = TaskQueue::with_backoff(
            Arc::new(MemoryKv::new()),
            BackoffPolicy {
                base: Duration::from_millis(60),
                cap: Duration::from_secs(1),
                multiplier: 2.0,
                jitter_ratio: 0.0,
            },
        );
        let task = queue.enqueue(json!({}), 0, 5).await.unwrap();
        queue.claim("w", Duration::from_secs(30)).await.unwrap();
        queue.fail(task.id, "transient").await.unwrap();

        // Immediately after the failure the task is still backing off.
        assert!(queue
            .claim("w", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(90)).await;
        let retried = queue
            .claim("w", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.id, task.id);
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn stale_claims_are_reclaimed() {
        let queue = quick_queue();
        let task = queue.enqueue(json!({}), 0, 5).await.unwrap();
        queue
            .claim("crashed-worker", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.reclaim_stale().await.unwrap(), 1);

        let after = queue.get(task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Pending);
        assert_eq!(after.attempts, 1);

        // Claimable again by a healthy worker.
        assert!(queue
            .claim("w2", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn stale_claim_with_spent_budget_dead_letters() {
        let queue = quick_queue();
        let task = queue.enqueue(json!({}), 0, 1).await.unwrap();
        queue
            .claim("crashed", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.reclaim_stale().await.unwrap();
        assert_eq!(
            queue.get(task.id).await.unwrap().status,
            TaskStatus::DeadLettered
        );
    }

    #[tokio::test]
    async fn live_claims_are_not_reclaimed() {
        let queue = quick_queue();
        queue.enqueue(json!({}), 0, 3).await.unwrap();
        queue.claim("w", Duration::from_secs(30)).await.unwrap();
        assert_eq!(queue.reclaim_stale().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counts_reflect_statuses() {
        let queue = quick_queue();
        queue.enqueue(json!({}), 0, 3).await.unwrap();
        let b = queue.enqueue(json!({}), 1, 3).await.unwrap();
        queue.claim("w", Duration::from_secs(30)).await.unwrap();

        let counts = queue.counts_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.claimed, 1);

        // b is still pending; the claimed one was the priority-0 task.
        assert_eq!(queue.get(b.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn enqueue_wakes_waiters() {
        let queue = quick_queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.changed().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(json!({}), 0, 3).await.unwrap();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should wake after enqueue")
            .unwrap();
    }
}
