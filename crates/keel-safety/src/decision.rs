use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RiskLevel
// ---------------------------------------------------------------------------

/// Risk classification of an operation. The derived ordering matters: risk
/// assessment may move an operation up this scale, never down.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// ActorRole
// ---------------------------------------------------------------------------

/// Who is asking for the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Autonomous agent acting without a human in the loop.
    Agent,
    /// Human operator driving the platform interactively.
    Operator,
    /// Platform administrator.
    Admin,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ActorRole::Agent => "agent",
            ActorRole::Operator => "operator",
            ActorRole::Admin => "admin",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// OperationRequest
// ---------------------------------------------------------------------------

/// One operation submitted for safety evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation_id: Uuid,
    pub operation_type: String,
    /// Opaque operation arguments; inspected for risk signals.
    pub payload: Value,
    pub declared_risk: RiskLevel,
    pub actor_role: ActorRole,
    /// Force the approval step even below the risk threshold.
    pub approval_required: bool,
}

impl OperationRequest {
    pub fn new(operation_type: impl Into<String>, payload: Value) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            operation_type: operation_type.into(),
            payload,
            declared_risk: RiskLevel::Low,
            actor_role: ActorRole::Agent,
            approval_required: false,
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.declared_risk = risk;
        self
    }

    pub fn with_role(mut self, role: ActorRole) -> Self {
        self.actor_role = role;
        self
    }

    pub fn with_approval_required(mut self) -> Self {
        self.approval_required = true;
        self
    }
}

// ---------------------------------------------------------------------------
// SafetyDecision
// ---------------------------------------------------------------------------

/// Final verdict on an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DecisionOutcome {
    /// The operation may proceed.
    Allowed,
    /// Denied by the policy check; no approval step ran.
    Denied { rule: String },
    /// The approval step resolved against the operation (or timed out).
    Rejected { rationale: String },
}

impl DecisionOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, DecisionOutcome::Allowed)
    }
}

/// The audited record of one evaluation: what was asked, how the risk was
/// (re)assessed, and what was decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyDecision {
    pub operation_id: Uuid,
    pub operation_type: String,
    pub actor_role: ActorRole,
    pub declared_risk: RiskLevel,
    pub assessed_risk: RiskLevel,
    pub outcome: DecisionOutcome,
    pub decided_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ApprovalRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// The persisted approval-wait record. Lives in the state store so a pending
/// approval survives a controller restart and an approver can resolve it from
/// another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub operation_id: Uuid,
    pub operation_type: String,
    pub assessed_risk: RiskLevel,
    pub requested_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRecord {
    pub fn pending(operation_id: Uuid, operation_type: &str, risk: RiskLevel) -> Self {
        Self {
            operation_id,
            operation_type: operation_type.to_string(),
            assessed_risk: risk,
            requested_at: Utc::now(),
            status: ApprovalStatus::Pending,
            resolved_by: None,
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let denied = DecisionOutcome::Denied {
            rule: "critical_requires_admin".into(),
        };
        let json = serde_json::to_value(&denied).unwrap();
        assert_eq!(json["outcome"], "denied");
        assert_eq!(json["rule"], "critical_requires_admin");
    }
}
