//! Policy check: a pure function over `(operation_type, risk, role)`.
//!
//! Deny rules are evaluated first and short-circuit the rest of the pipeline;
//! a denied operation never reaches the approval step.

use std::collections::HashSet;

use crate::decision::{ActorRole, RiskLevel};

// ---------------------------------------------------------------------------
// PolicyVerdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Allowed,
    Denied { rule: String },
}

impl PolicyVerdict {
    pub fn is_denied(&self) -> bool {
        matches!(self, PolicyVerdict::Denied { .. })
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Deny rules plus per-role risk ceilings. `check` has no side effects and
/// consults nothing but its arguments and this table.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Operation types that are never allowed, for anyone.
    forbidden_operations: HashSet<String>,
    /// Highest risk an agent may carry without being denied outright.
    agent_risk_ceiling: RiskLevel,
    /// Highest risk an operator may carry without being denied outright.
    operator_risk_ceiling: RiskLevel,
}

impl Default for Policy {
    fn default() -> Self {
        let forbidden_operations = ["force_push", "credential_export", "disable_audit"]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            forbidden_operations,
            agent_risk_ceiling: RiskLevel::High,
            operator_risk_ceiling: RiskLevel::Critical,
        }
    }
}

impl Policy {
    pub fn forbid(mut self, operation_type: impl Into<String>) -> Self {
        self.forbidden_operations.insert(operation_type.into());
        self
    }

    pub fn with_agent_risk_ceiling(mut self, ceiling: RiskLevel) -> Self {
        self.agent_risk_ceiling = ceiling;
        self
    }

    /// Evaluate the deny rules in order; anything not denied is allowed.
    /// Allowed here does not mean the operation runs — high-risk operations
    /// still go through approval.
    pub fn check(&self, operation_type: &str, risk: RiskLevel, role: ActorRole) -> PolicyVerdict {
        if self.forbidden_operations.contains(operation_type) {
            return PolicyVerdict::Denied {
                rule: format!("operation_forbidden:{operation_type}"),
            };
        }

        let ceiling = match role {
            ActorRole::Agent => self.agent_risk_ceiling,
            ActorRole::Operator => self.operator_risk_ceiling,
            ActorRole::Admin => RiskLevel::Critical,
        };
        if risk > ceiling {
            return PolicyVerdict::Denied {
                rule: format!("risk_exceeds_role_ceiling:{role}:{risk}"),
            };
        }

        PolicyVerdict::Allowed
    }
}
