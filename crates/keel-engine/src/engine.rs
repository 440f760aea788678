use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_core::namespace;
use keel_lock::{LockError, QuorumLock};
use keel_queue::{QueueError, TaskQueue, TaskRecord};
use keel_safety::{
    ActorRole, DecisionOutcome, OperationRequest, RiskLevel, SafetyController, SafetyError,
};
use keel_state::{StateError, StateStore};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::plan::{PlanError, Planner, Step, StepExecutor};
use crate::run::{RunPhase, RunSummary, StepOutcome, StepResult, TaskRun};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("corrupt run record {0}: {1}")]
    Corrupt(Uuid, String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Abort the whole task on the first safety denial instead of recording
    /// it and continuing with the remaining steps.
    pub abort_on_denial: bool,
    /// TTL for per-step resource locks.
    pub step_lock_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            abort_on_denial: true,
            step_lock_ttl: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

/// Runs one claimed task end to end: plan (or resume), safety-gate each step,
/// execute with a durable checkpoint after every step, aggregate, and close
/// the loop with the queue via `complete`/`fail`.
#[derive(Clone)]
pub struct ExecutionEngine {
    queue: TaskQueue,
    state: StateStore,
    safety: SafetyController,
    /// Optional lock manager for steps that name a `resource`.
    locks: Option<QuorumLock>,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn StepExecutor>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        queue: TaskQueue,
        state: StateStore,
        safety: SafetyController,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            queue,
            state,
            safety,
            locks: None,
            planner,
            executor,
            config: EngineConfig::default(),
        }
    }

    pub fn with_locks(mut self, locks: QuorumLock) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Execute a claimed task. Always closes the loop with the queue: the
    /// task ends up Succeeded, back in Pending for a retry, or DeadLettered.
    pub async fn run(&self, task: &TaskRecord) -> Result<RunSummary> {
        self.queue.mark_running(task.id).await?;

        let mut run = self.load_or_plan(task).await?;
        // Recorded attempts past the checkpoint failed; this delivery retries
        // them, so their results get replaced.
        run.discard_results_past_checkpoint();
        let start = run.resume_index();
        if start > 0 {
            info!(
                task_id = %task.id,
                resume_index = start,
                "resuming from checkpoint"
            );
        }

        for index in start..run.plan.len() {
            let step = run.plan[index].clone();
            let request = Self::step_request(&step);

            // A step whose assessed risk reaches the approval threshold can
            // park on an approval wait, even when it was declared lower;
            // surface that in the persisted phase so an operator can see why
            // the run stalled.
            if keel_safety::risk::assess(&request) >= RiskLevel::High {
                run.set_phase(RunPhase::AwaitingApproval);
                self.persist(&run).await?;
            }

            let result = match self.gate_step(&request).await? {
                Some(rationale) => {
                    warn!(
                        task_id = %task.id,
                        step = %step.name,
                        rationale = %rationale,
                        "step blocked by safety controller"
                    );
                    StepResult {
                        index,
                        name: step.name.clone(),
                        outcome: StepOutcome::FailedByPolicy { rationale },
                        output: None,
                        finished_at: Utc::now(),
                    }
                }
                None => match self.execute_step(task, &step).await {
                    Ok(output) => StepResult {
                        index,
                        name: step.name.clone(),
                        outcome: StepOutcome::Succeeded,
                        output: Some(output),
                        finished_at: Utc::now(),
                    },
                    Err(error) => StepResult {
                        index,
                        name: step.name.clone(),
                        outcome: StepOutcome::FailedByError { error },
                        output: None,
                        finished_at: Utc::now(),
                    },
                },
            };

            // The result goes down before anything else happens. Only a step
            // the run can move past advances the cursor; a failed step stays
            // in front of it so redelivery retries the step instead of
            // skipping it.
            let outcome = result.outcome.clone();
            run.set_phase(RunPhase::Executing);
            let advance = match &outcome {
                StepOutcome::Succeeded => true,
                StepOutcome::FailedByPolicy { .. } => !self.config.abort_on_denial,
                StepOutcome::FailedByError { .. } => false,
            };
            if advance {
                run.checkpoint(result);
            } else {
                run.record_failure(result);
            }
            self.persist(&run).await?;

            match outcome {
                StepOutcome::Succeeded => {}
                StepOutcome::FailedByPolicy { rationale } if self.config.abort_on_denial => {
                    return self
                        .fail_run(run, &format!("step {index} denied: {rationale}"))
                        .await;
                }
                StepOutcome::FailedByPolicy { .. } => {}
                StepOutcome::FailedByError { error } => {
                    return self
                        .fail_run(run, &format!("step {index} failed: {error}"))
                        .await;
                }
            }
        }

        run.set_phase(RunPhase::Aggregating);
        self.persist(&run).await?;

        let summary = run.aggregate();
        run.set_phase(RunPhase::Completed);
        self.persist(&run).await?;
        self.queue.complete(task.id).await?;
        info!(
            task_id = %task.id,
            steps_succeeded = summary.steps_succeeded,
            steps_denied = summary.steps_denied,
            "task completed"
        );
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Load the persisted run for this task, or plan it fresh. A run marked
    /// `plan_stale` is replanned from scratch.
    async fn load_or_plan(&self, task: &TaskRecord) -> Result<TaskRun> {
        let key = namespace::run_key(task.id);
        if let Some(entry) = self.state.get(&key).await? {
            let run: TaskRun = serde_json::from_value(entry.value)
                .map_err(|e| EngineError::Corrupt(task.id, e.to_string()))?;
            if !run.plan_stale {
                return Ok(run);
            }
            info!(task_id = %task.id, "plan marked stale; replanning");
        }

        let plan = self.planner.plan(task).await?;
        info!(task_id = %task.id, steps = plan.len(), "task planned");
        let run = TaskRun::new(task.id, plan);
        self.persist(&run).await?;
        Ok(run)
    }

    fn step_request(step: &Step) -> OperationRequest {
        OperationRequest {
            operation_id: step.operation_id,
            operation_type: step.operation_type.clone(),
            payload: step.payload.clone(),
            declared_risk: step.declared_risk,
            actor_role: ActorRole::Agent,
            approval_required: false,
        }
    }

    /// Safety-gate one step. `None` means cleared to execute; `Some` carries
    /// the denial/rejection rationale.
    async fn gate_step(&self, request: &OperationRequest) -> Result<Option<String>> {
        let decision = self.safety.evaluate(request).await?;
        Ok(match decision.outcome {
            DecisionOutcome::Allowed => None,
            DecisionOutcome::Denied { rule } => Some(rule),
            DecisionOutcome::Rejected { rationale } => Some(rationale),
        })
    }

    /// Run the executor, under the step's resource lock when it names one.
    /// Failure to acquire the lock counts as a step error (retryable), not an
    /// engine error.
    async fn execute_step(
        &self,
        task: &TaskRecord,
        step: &Step,
    ) -> std::result::Result<Value, String> {
        match (&self.locks, &step.resource) {
            (Some(locks), Some(resource)) => {
                match locks
                    .with_lock(resource, self.config.step_lock_ttl, |_held| async {
                        self.executor.execute(task, step).await
                    })
                    .await
                {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(LockError::Denied { resource }) => {
                        Err(format!("resource busy: {resource}"))
                    }
                }
            }
            _ => self
                .executor
                .execute(task, step)
                .await
                .map_err(|e| e.to_string()),
        }
    }

    async fn fail_run(&self, mut run: TaskRun, reason: &str) -> Result<RunSummary> {
        run.set_phase(RunPhase::Failed);
        self.persist(&run).await?;
        self.queue.fail(run.task_id, reason).await?;
        warn!(task_id = %run.task_id, reason, "task run failed");
        Ok(run.aggregate())
    }

    async fn persist(&self, run: &TaskRun) -> Result<()> {
        let value = serde_json::to_value(run)
            .map_err(|e| EngineError::Corrupt(run.task_id, e.to_string()))?;
        self.state
            .set(&namespace::run_key(run.task_id), value, None, None)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
