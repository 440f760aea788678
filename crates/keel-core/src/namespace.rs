//! Logical key layout shared across the kernel.
//!
//! Three top-level namespaces: `locks/{resource}`, `tasks/{taskId}`, and
//! `state/{key}`. Approval-wait records and agent task runs are plain state
//! entries under reserved sub-prefixes, so they survive component restarts
//! like any other state.

use uuid::Uuid;

pub const LOCK_PREFIX: &str = "locks/";
pub const TASK_PREFIX: &str = "tasks/";
pub const STATE_PREFIX: &str = "state/";

/// Sub-prefix (inside the state namespace) for approval-wait records.
pub const APPROVAL_PREFIX: &str = "approvals/";
/// Sub-prefix (inside the state namespace) for agent task runs.
pub const RUN_PREFIX: &str = "runs/";

pub fn lock_key(resource: &str) -> String {
    format!("{LOCK_PREFIX}{resource}")
}

pub fn task_key(task_id: Uuid) -> String {
    format!("{TASK_PREFIX}{task_id}")
}

pub fn state_key(key: &str) -> String {
    format!("{STATE_PREFIX}{key}")
}

/// State-store key (without the `state/` prefix) for an approval record.
pub fn approval_key(operation_id: Uuid) -> String {
    format!("{APPROVAL_PREFIX}{operation_id}")
}

/// State-store key (without the `state/` prefix) for an agent task run.
pub fn run_key(task_id: Uuid) -> String {
    format!("{RUN_PREFIX}{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let id = Uuid::nil();
        assert_eq!(lock_key("db-migration"), "locks/db-migration");
        assert_eq!(
            task_key(id),
            "tasks/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(state_key("config"), "state/config");
        assert!(approval_key(id).starts_with("approvals/"));
        assert!(run_key(id).starts_with("runs/"));
    }
}
