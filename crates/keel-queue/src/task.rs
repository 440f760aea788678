use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed (possibly under a retry backoff).
    Pending,
    /// Reserved by a consumer under a claim lease.
    Claimed,
    /// Execution has started.
    Running,
    /// Terminal success.
    Succeeded,
    /// An attempt failed; recorded in history before the task re-enters
    /// Pending or moves to DeadLettered.
    Failed,
    /// Retry budget exhausted. Terminal, inspectable, never auto-retried.
    DeadLettered,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskRecord
// ---------------------------------------------------------------------------

/// One status transition, retained for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

/// The persisted task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    /// Ordering key — lower claims first; ties broken by `created_at`.
    pub priority: i64,
    pub payload: Value,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// Earliest instant the task may be claimed again (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Every status transition, timestamped.
    pub history: Vec<StatusChange>,
}

impl TaskRecord {
    pub fn new(payload: Value, priority: i64, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            priority,
            payload,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            claimed_by: None,
            claim_expires_at: None,
            not_before: None,
            created_at: now,
            last_error: None,
            history: vec![StatusChange {
                status: TaskStatus::Pending,
                at: now,
            }],
        }
    }

    /// Move to `status`, appending to the transition history.
    pub fn transition(&mut self, status: TaskStatus) {
        self.status = status;
        self.history.push(StatusChange {
            status,
            at: Utc::now(),
        });
    }

    /// Claimable right now: Pending and past any retry backoff.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.not_before.map_or(true, |after| after <= now)
    }

    /// Claimed but the lease has lapsed — eligible for stale reclamation.
    pub fn is_stale_claim(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Claimed
            && self.claim_expires_at.map_or(true, |until| until < now)
    }

    /// Terminal states never leave the record again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded | TaskStatus::DeadLettered)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_task_is_pending_with_history() {
        let task = TaskRecord::new(json!({"op": "x"}), 5, 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.history.len(), 1);
        assert!(task.is_claimable(Utc::now()));
    }

    #[test]
    fn transitions_are_recorded() {
        let mut task = TaskRecord::new(json!({}), 0, 3);
        task.transition(TaskStatus::Claimed);
        task.transition(TaskStatus::Running);
        task.transition(TaskStatus::Succeeded);

        let statuses: Vec<TaskStatus> = task.history.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Pending,
                TaskStatus::Claimed,
                TaskStatus::Running,
                TaskStatus::Succeeded
            ]
        );
        assert!(task.is_terminal());
    }

    #[test]
    fn backoff_blocks_claimability() {
        let mut task = TaskRecord::new(json!({}), 0, 3);
        task.not_before = Some(Utc::now() + chrono::Duration::seconds(60));
        assert!(!task.is_claimable(Utc::now()));
    }

    #[test]
    fn lapsed_lease_is_stale() {
        let mut task = TaskRecord::new(json!({}), 0, 3);
        task.transition(TaskStatus::Claimed);
        task.claim_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(task.is_stale_claim(Utc::now()));
    }
}
