//! Durable task-run record: the plan, the per-step results, and the
//! checkpoint cursor. Persisted to the state store at `runs/{taskId}` after
//! every step, which is what bounds crash-recovery re-execution to at most
//! one in-flight step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::plan::Step;

// ---------------------------------------------------------------------------
// RunPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    AwaitingApproval,
    Executing,
    Aggregating,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepOutcome {
    Succeeded,
    /// Denied or rejected by the safety controller; the step never ran.
    FailedByPolicy { rationale: String },
    /// The executor ran and reported an error.
    FailedByError { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub name: String,
    pub outcome: StepOutcome,
    pub output: Option<Value>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// TaskRun
// ---------------------------------------------------------------------------

/// The persisted run. Only the engine instance that owns the task's claim
/// may advance `checkpoint_cursor`; everyone else reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: Uuid,
    pub phase: RunPhase,
    pub plan: Vec<Step>,
    /// When set, a resumed task replans instead of reusing this plan.
    pub plan_stale: bool,
    /// Index of the last step whose result is durably recorded.
    pub checkpoint_cursor: Option<usize>,
    pub step_results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn new(task_id: Uuid, plan: Vec<Step>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            phase: RunPhase::Planning,
            plan,
            plan_stale: false,
            checkpoint_cursor: None,
            step_results: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// First step index that still needs work.
    pub fn resume_index(&self) -> usize {
        self.checkpoint_cursor.map_or(0, |cursor| cursor + 1)
    }

    /// Record a step's result and advance the checkpoint to it.
    pub fn checkpoint(&mut self, result: StepResult) {
        self.checkpoint_cursor = Some(result.index);
        self.step_results.push(result);
        self.updated_at = Utc::now();
    }

    /// Record a failed step's result without moving the checkpoint, leaving
    /// the step in front of the cursor for the next delivery to retry.
    pub fn record_failure(&mut self, result: StepResult) {
        self.step_results.push(result);
        self.updated_at = Utc::now();
    }

    /// Drop recorded results past the checkpoint: failed attempts the run is
    /// about to retry. The retried step's result replaces them.
    pub fn discard_results_past_checkpoint(&mut self) {
        let resume = self.resume_index();
        self.step_results.retain(|result| result.index < resume);
        self.updated_at = Utc::now();
    }

    pub fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }

    /// Combine the recorded step results into the final summary.
    pub fn aggregate(&self) -> RunSummary {
        let mut summary = RunSummary {
            task_id: self.task_id,
            steps_total: self.plan.len(),
            ..RunSummary::default()
        };
        for result in &self.step_results {
            match &result.outcome {
                StepOutcome::Succeeded => {
                    summary.steps_succeeded += 1;
                    if let Some(output) = &result.output {
                        summary.outputs.push(output.clone());
                    }
                }
                StepOutcome::FailedByPolicy { .. } => summary.steps_denied += 1,
                StepOutcome::FailedByError { .. } => summary.steps_failed += 1,
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// Aggregated outcome of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub task_id: Uuid,
    pub steps_total: usize,
    pub steps_succeeded: usize,
    pub steps_denied: usize,
    pub steps_failed: usize,
    pub outputs: Vec<Value>,
}

impl RunSummary {
    /// A run with an executor failure is never clean; policy denials are
    /// tolerated only when the engine was configured to record-and-continue.
    pub fn is_clean(&self) -> bool {
        self.steps_failed == 0
    }
}
