//! Planning and execution seams.
//!
//! The engine treats both collaborators as opaque: `plan` is assumed free of
//! side effects, and `execute` owns whatever external effect the step has.

use async_trait::async_trait;
use keel_queue::TaskRecord;
use keel_safety::RiskLevel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One planned unit of work. The `operation_id` is fixed at plan time and
/// persisted with the plan, so a resumed task rejoins any approval wait it
/// started before the crash instead of filing a duplicate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub operation_id: Uuid,
    pub name: String,
    pub operation_type: String,
    pub payload: Value,
    pub declared_risk: RiskLevel,
    /// Resource to hold exclusively while the step runs, if any.
    pub resource: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, operation_type: impl Into<String>, payload: Value) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            name: name.into(),
            operation_type: operation_type.into(),
            payload,
            declared_risk: RiskLevel::Low,
            resource: None,
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.declared_risk = risk;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("planning failed: {0}")]
pub struct PlanError(pub String);

#[derive(Debug, thiserror::Error)]
#[error("step failed: {0}")]
pub struct StepError(pub String);

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Decomposes a task into an ordered list of steps.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &TaskRecord) -> Result<Vec<Step>, PlanError>;
}

/// Performs one step's side effect and returns its output.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, task: &TaskRecord, step: &Step) -> Result<Value, StepError>;
}
