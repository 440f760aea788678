use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_core::namespace;
use keel_state::{StateError, StateStore};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditError, AuditSink};
use crate::decision::{
    ApprovalRecord, ApprovalStatus, DecisionOutcome, OperationRequest, RiskLevel, SafetyDecision,
};
use crate::policy::{Policy, PolicyVerdict};
use crate::risk;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    /// The audit append failed; the evaluation fails closed and the caller
    /// must treat the operation as not allowed.
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("approval record not found: {0}")]
    ApprovalNotFound(Uuid),
    #[error("approval already resolved: {0}")]
    AlreadyResolved(Uuid),
    #[error("corrupt approval record {0}: {1}")]
    Corrupt(Uuid, String),
}

pub type Result<T> = std::result::Result<T, SafetyError>;

// ---------------------------------------------------------------------------
// SafetyController
// ---------------------------------------------------------------------------

/// Gates every externally-visible operation.
///
/// Pipeline: assess risk (upgrade-only) → policy check (deny rules first,
/// denial short-circuits) → approval wait for high-risk or explicitly flagged
/// operations → audit append → return. The audit append happens before the
/// decision is handed back on every path, and an append failure is an error,
/// never an `Allowed`.
#[derive(Clone)]
pub struct SafetyController {
    state: StateStore,
    audit: Arc<dyn AuditSink>,
    policy: Policy,
    approval_timeout: Duration,
    approval_poll_interval: Duration,
}

impl SafetyController {
    pub fn new(state: StateStore, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            state,
            audit,
            policy: Policy::default(),
            approval_timeout: Duration::from_secs(300),
            approval_poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_approval_poll_interval(mut self, interval: Duration) -> Self {
        self.approval_poll_interval = interval;
        self
    }

    /// Evaluate one operation to a final, audited decision.
    ///
    /// May block for up to the approval timeout when the operation needs an
    /// approver; dropping the future cancels the wait and leaves the pending
    /// record for a later resolution or retry.
    pub async fn evaluate(&self, request: &OperationRequest) -> Result<SafetyDecision> {
        let assessed = risk::assess(request);
        if assessed > request.declared_risk {
            info!(
                operation_id = %request.operation_id,
                declared = %request.declared_risk,
                assessed = %assessed,
                "risk upgraded by payload inspection"
            );
        }

        let verdict = self
            .policy
            .check(&request.operation_type, assessed, request.actor_role);
        if let PolicyVerdict::Denied { rule } = verdict {
            warn!(
                operation_id = %request.operation_id,
                rule = %rule,
                "operation denied by policy"
            );
            return self
                .finish(request, assessed, DecisionOutcome::Denied { rule })
                .await;
        }

        let needs_approval = assessed >= RiskLevel::High || request.approval_required;
        let outcome = if needs_approval {
            self.await_approval(request, assessed).await?
        } else {
            DecisionOutcome::Allowed
        };

        self.finish(request, assessed, outcome).await
    }

    /// Resolve a pending approval on behalf of `actor`. The waiting
    /// evaluation observes the update through its subscription.
    pub async fn resolve_approval(
        &self,
        operation_id: Uuid,
        approve: bool,
        actor: &str,
    ) -> Result<()> {
        let key = namespace::approval_key(operation_id);
        let entry = self
            .state
            .get(&key)
            .await?
            .ok_or(SafetyError::ApprovalNotFound(operation_id))?;
        let mut record: ApprovalRecord = serde_json::from_value(entry.value)
            .map_err(|e| SafetyError::Corrupt(operation_id, e.to_string()))?;
        if !record.is_pending() {
            return Err(SafetyError::AlreadyResolved(operation_id));
        }

        record.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        record.resolved_by = Some(actor.to_string());
        record.resolved_at = Some(Utc::now());

        self.state
            .set(&key, to_value(&record, operation_id)?, Some(entry.version), None)
            .await?;
        info!(operation_id = %operation_id, approve, actor, "approval resolved");
        Ok(())
    }

    /// Unresolved approval requests, for the management surface.
    pub async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRecord>> {
        let mut pending = Vec::new();
        for (_, entry) in self.state.list_prefix(namespace::APPROVAL_PREFIX).await? {
            if let Ok(record) = serde_json::from_value::<ApprovalRecord>(entry.value) {
                if record.is_pending() {
                    pending.push(record);
                }
            }
        }
        pending.sort_by_key(|r| r.requested_at);
        Ok(pending)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Persist the pending record (create-only, so a restarted evaluation
    /// rejoins an existing wait) and block until it is resolved or the
    /// timeout elapses.
    async fn await_approval(
        &self,
        request: &OperationRequest,
        assessed: RiskLevel,
    ) -> Result<DecisionOutcome> {
        let key = namespace::approval_key(request.operation_id);

        // Subscribe before reading so a resolution landing between the read
        // and the wait is not missed.
        let sub = self.state.subscribe(&key);

        let record = ApprovalRecord::pending(
            request.operation_id,
            &request.operation_type,
            assessed,
        );
        match self
            .state
            .set(&key, to_value(&record, request.operation_id)?, Some(0), None)
            .await
        {
            Ok(_) => {
                info!(
                    operation_id = %request.operation_id,
                    risk = %assessed,
                    "approval requested"
                );
            }
            Err(StateError::VersionConflict { .. }) => {
                // A previous evaluation of this operation already filed the
                // request; it may even be resolved already.
                if let Some(entry) = self.state.get(&key).await? {
                    let existing: ApprovalRecord = serde_json::from_value(entry.value)
                        .map_err(|e| {
                            SafetyError::Corrupt(request.operation_id, e.to_string())
                        })?;
                    if let Some(outcome) = resolution_outcome(&existing) {
                        return Ok(outcome);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }

        // The subscription only carries resolutions made in this process; a
        // resolution written to the shared store by another process (the CLI,
        // typically) is picked up by the periodic re-read.
        let wait = async {
            let mut poll = tokio::time::interval(self.approval_poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut sub_open = true;
            loop {
                tokio::select! {
                    event = sub.next(), if sub_open => {
                        match event {
                            None => sub_open = false,
                            Some(event) => {
                                let Some(value) = event.value else { continue };
                                let record: ApprovalRecord = serde_json::from_value(value)
                                    .map_err(|e| {
                                        SafetyError::Corrupt(request.operation_id, e.to_string())
                                    })?;
                                if let Some(outcome) = resolution_outcome(&record) {
                                    return Ok::<DecisionOutcome, SafetyError>(outcome);
                                }
                            }
                        }
                    }
                    _ = poll.tick() => {
                        if let Some(entry) = self.state.get(&key).await? {
                            let record: ApprovalRecord = serde_json::from_value(entry.value)
                                .map_err(|e| {
                                    SafetyError::Corrupt(request.operation_id, e.to_string())
                                })?;
                            if let Some(outcome) = resolution_outcome(&record) {
                                return Ok(outcome);
                            }
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(self.approval_timeout, wait).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Err(_) => {
                warn!(
                    operation_id = %request.operation_id,
                    "approval wait timed out"
                );
                Ok(DecisionOutcome::Rejected {
                    rationale: "Timeout".to_string(),
                })
            }
            Ok(Err(e)) => Err(e),
        }
    }

    /// Audit the decision, then return it. Order matters: a decision that is
    /// not on the audit trail was never made.
    async fn finish(
        &self,
        request: &OperationRequest,
        assessed: RiskLevel,
        outcome: DecisionOutcome,
    ) -> Result<SafetyDecision> {
        let decision = SafetyDecision {
            operation_id: request.operation_id,
            operation_type: request.operation_type.clone(),
            actor_role: request.actor_role,
            declared_risk: request.declared_risk,
            assessed_risk: assessed,
            outcome,
            decided_at: Utc::now(),
        };
        self.audit.append(&decision).await?;
        Ok(decision)
    }
}

fn resolution_outcome(record: &ApprovalRecord) -> Option<DecisionOutcome> {
    match record.status {
        ApprovalStatus::Pending => None,
        ApprovalStatus::Approved => Some(DecisionOutcome::Allowed),
        ApprovalStatus::Rejected => Some(DecisionOutcome::Rejected {
            rationale: match &record.resolved_by {
                Some(actor) => format!("rejected by {actor}"),
                None => "rejected".to_string(),
            },
        }),
    }
}

fn to_value(record: &ApprovalRecord, operation_id: Uuid) -> Result<Value> {
    serde_json::to_value(record).map_err(|e| SafetyError::Corrupt(operation_id, e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, MemoryAuditSink};
    use crate::decision::{ActorRole, RiskLevel};
    use async_trait::async_trait;
    use keel_core::MemoryKv;
    use serde_json::json;

    fn controller_with(sink: Arc<dyn AuditSink>) -> SafetyController {
        let state = StateStore::new(Arc::new(MemoryKv::new()));
        SafetyController::new(state, sink).with_approval_timeout(Duration::from_millis(100))
    }

    fn controller() -> (SafetyController, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (controller_with(sink.clone()), sink)
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn append(&self, _decision: &SafetyDecision) -> crate::audit::Result<()> {
            Err(AuditError::Append("disk full".into()))
        }
    }

    #[tokio::test]
    async fn low_risk_operation_is_allowed_and_audited() {
        let (controller, sink) = controller();
        let request = OperationRequest::new("read_config", json!({"path": "/etc"}));

        let decision = controller.evaluate(&request).await.unwrap();
        assert!(decision.outcome.is_allowed());
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn policy_denial_short_circuits_approval() {
        let (controller, sink) = controller();
        let request = OperationRequest::new("force_push", json!({}));

        let decision = controller.evaluate(&request).await.unwrap();
        assert!(matches!(decision.outcome, DecisionOutcome::Denied { .. }));
        // No approval record was filed.
        assert!(controller.list_pending_approvals().await.unwrap().is_empty());
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn high_risk_waits_for_approval_and_is_allowed_when_approved() {
        let (controller, sink) = controller();
        let request = OperationRequest::new("exec_command", json!({"cmd": "drop table t"}))
            .with_role(ActorRole::Operator);
        let operation_id = request.operation_id;

        let approver = {
            let controller = controller.clone();
            tokio::spawn(async move {
                // Wait for the pending record to appear, then approve it.
                loop {
                    let pending = controller.list_pending_approvals().await.unwrap();
                    if pending.iter().any(|r| r.operation_id == operation_id) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                controller
                    .resolve_approval(operation_id, true, "alice")
                    .await
                    .unwrap();
            })
        };

        let decision = controller.evaluate(&request).await.unwrap();
        approver.await.unwrap();

        assert!(decision.outcome.is_allowed());
        assert_eq!(decision.assessed_risk, RiskLevel::High);
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn rejection_carries_the_approver() {
        let (controller, _) = controller();
        let request = OperationRequest::new("read_config", json!({}))
            .with_approval_required()
            .with_role(ActorRole::Operator);
        let operation_id = request.operation_id;

        let rejecter = {
            let controller = controller.clone();
            tokio::spawn(async move {
                loop {
                    if !controller.list_pending_approvals().await.unwrap().is_empty() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                controller
                    .resolve_approval(operation_id, false, "bob")
                    .await
                    .unwrap();
            })
        };

        let decision = controller.evaluate(&request).await.unwrap();
        rejecter.await.unwrap();
        assert_eq!(
            decision.outcome,
            DecisionOutcome::Rejected {
                rationale: "rejected by bob".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unresolved_approval_times_out_to_rejected() {
        let (controller, sink) = controller();
        let request = OperationRequest::new("read_config", json!({})).with_approval_required();

        let decision = controller.evaluate(&request).await.unwrap();
        assert_eq!(
            decision.outcome,
            DecisionOutcome::Rejected {
                rationale: "Timeout".to_string()
            }
        );
        // Timed-out decisions are audited like any other.
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn audit_failure_fails_closed() {
        let controller = controller_with(Arc::new(FailingSink));
        let request = OperationRequest::new("read_config", json!({}));
        assert!(matches!(
            controller.evaluate(&request).await,
            Err(SafetyError::Audit(_))
        ));
    }

    #[tokio::test]
    async fn pre_resolved_approval_is_honored_on_reevaluation() {
        let (controller, _) = controller();
        let request = OperationRequest::new("read_config", json!({})).with_approval_required();
        let operation_id = request.operation_id;

        // First evaluation times out but leaves the pending record behind.
        controller.evaluate(&request).await.unwrap();
        controller
            .resolve_approval(operation_id, true, "alice")
            .await
            .unwrap();

        // A re-evaluation after restart sees the resolved record immediately.
        let decision = controller.evaluate(&request).await.unwrap();
        assert!(decision.outcome.is_allowed());
    }

    #[tokio::test]
    async fn resolving_twice_is_an_error() {
        let (controller, _) = controller();
        let request = OperationRequest::new("read_config", json!({})).with_approval_required();
        let operation_id = request.operation_id;

        let handle = {
            let controller = controller.clone();
            let request = request.clone();
            tokio::spawn(async move { controller.evaluate(&request).await })
        };
        loop {
            if !controller.list_pending_approvals().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controller
            .resolve_approval(operation_id, true, "alice")
            .await
            .unwrap();
        handle.await.unwrap().unwrap();

        assert!(matches!(
            controller.resolve_approval(operation_id, true, "bob").await,
            Err(SafetyError::AlreadyResolved(_))
        ));
    }

    #[tokio::test]
    async fn approval_resolved_through_the_shared_store_is_observed() {
        let backend = Arc::new(MemoryKv::new());
        let state = StateStore::new(backend.clone());
        let controller = SafetyController::new(state, Arc::new(MemoryAuditSink::new()))
            .with_approval_timeout(Duration::from_secs(2))
            .with_approval_poll_interval(Duration::from_millis(10));

        // A second process shares the backing store but not this process's
        // event bus; its resolution arrives by durable write only.
        let other_process = StateStore::new(backend);

        let request = OperationRequest::new("read_config", json!({})).with_approval_required();
        let operation_id = request.operation_id;

        let resolver = tokio::spawn(async move {
            let key = namespace::approval_key(operation_id);
            let entry = loop {
                if let Some(entry) = other_process.get(&key).await.unwrap() {
                    break entry;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            let mut record: ApprovalRecord = serde_json::from_value(entry.value).unwrap();
            record.status = ApprovalStatus::Approved;
            record.resolved_by = Some("ops".to_string());
            record.resolved_at = Some(Utc::now());
            other_process
                .set(
                    &key,
                    serde_json::to_value(&record).unwrap(),
                    Some(entry.version),
                    None,
                )
                .await
                .unwrap();
        });

        let decision = controller.evaluate(&request).await.unwrap();
        resolver.await.unwrap();
        assert!(decision.outcome.is_allowed());
    }

    #[tokio::test]
    async fn under_declared_destructive_payload_is_gated() {
        // Declared Low, but the payload carries a destructive verb: the
        // assessment upgrades it to High and the approval path engages.
        let (controller, _) = controller();
        let request =
            OperationRequest::new("exec_command", json!({"cmd": "rm -rf /data"}));

        let decision = controller.evaluate(&request).await.unwrap();
        assert_eq!(decision.assessed_risk, RiskLevel::High);
        // Nobody approved, so the timeout rejected it.
        assert!(matches!(decision.outcome, DecisionOutcome::Rejected { .. }));
    }
}
