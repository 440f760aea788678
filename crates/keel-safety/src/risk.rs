//! Payload-based risk assessment.
//!
//! The caller declares a risk level; inspection of the payload may raise it,
//! never lower it. A caller that under-declares a destructive operation still
//! ends up on the approval path.

use serde_json::Value;

use crate::decision::{OperationRequest, RiskLevel};

/// Substrings in any payload string that mark an operation as destructive.
const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "delete",
    "drop",
    "truncate",
    "destroy",
    "purge",
    "wipe",
    "rm -rf",
    "force",
    "shutdown",
];

/// Operation types that mutate external state. An unscoped mutation (no
/// filter/target/scope field in the payload) is riskier than a scoped one.
const MUTATING_PREFIXES: &[&str] = &["write_", "update_", "deploy_", "exec_", "shell_"];

const SCOPE_FIELDS: &[&str] = &["scope", "filter", "target", "where"];

/// Assess the effective risk of `request`: the declared level, upgraded by
/// payload signals.
pub fn assess(request: &OperationRequest) -> RiskLevel {
    let mut risk = request.declared_risk;

    if contains_destructive_keyword(&request.payload) {
        risk = risk.max(RiskLevel::High);
    }

    if is_mutating(&request.operation_type) && !has_scope(&request.payload) {
        risk = risk.max(RiskLevel::Medium);
    }

    risk
}

fn contains_destructive_keyword(payload: &Value) -> bool {
    match payload {
        Value::String(s) => {
            let lowered = s.to_lowercase();
            DESTRUCTIVE_KEYWORDS.iter().any(|kw| lowered.contains(kw))
        }
        Value::Array(items) => items.iter().any(contains_destructive_keyword),
        Value::Object(map) => map.values().any(contains_destructive_keyword),
        _ => false,
    }
}

fn is_mutating(operation_type: &str) -> bool {
    MUTATING_PREFIXES
        .iter()
        .any(|prefix| operation_type.starts_with(prefix))
}

fn has_scope(payload: &Value) -> bool {
    payload
        .as_object()
        .is_some_and(|map| SCOPE_FIELDS.iter().any(|field| map.contains_key(*field)))
}
