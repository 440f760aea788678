//! keel-engine
//!
//! Agent execution engine: claims tasks from the queue, plans them into
//! ordered steps, safety-gates every step, executes with durable per-step
//! checkpoints, and aggregates the results back to the queue. Crash recovery
//! resumes a task from its last checkpoint, so at most one in-flight step is
//! ever re-executed on redelivery.
//!
//! The engine is parameterized by two capability traits — `Planner` and
//! `StepExecutor` — rather than an agent-type hierarchy; what an agent *is*
//! lives entirely in the collaborators plugged into those seams.

pub mod engine;
pub mod plan;
pub mod run;
pub mod worker;

pub use engine::{EngineConfig, EngineError, ExecutionEngine};
pub use plan::{PlanError, Planner, Step, StepError, StepExecutor};
pub use run::{RunPhase, RunSummary, StepOutcome, StepResult, TaskRun};
pub use worker::{WorkerConfig, WorkerPool};
