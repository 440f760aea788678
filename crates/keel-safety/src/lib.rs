//! keel-safety
//!
//! Risk-gated safety controller. Every externally-visible operation passes
//! through `SafetyController::evaluate`: declared risk may be upgraded by
//! payload inspection, a pure policy check can deny outright, high-risk
//! operations block on an external approver, and the final decision is
//! appended to the audit sink before it is returned. Auditing is not
//! best-effort — if the append fails, the evaluation fails closed.

pub mod audit;
pub mod controller;
pub mod decision;
pub mod policy;
pub mod risk;

pub use audit::{AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use controller::{SafetyController, SafetyError};
pub use decision::{
    ActorRole, ApprovalRecord, ApprovalStatus, DecisionOutcome, OperationRequest, RiskLevel,
    SafetyDecision,
};
pub use policy::{Policy, PolicyVerdict};
