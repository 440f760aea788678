//! Audit sinks. A decision only counts once it is on the audit trail, so
//! sinks are consulted before `evaluate` returns and their failures propagate.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::decision::SafetyDecision;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit append failed: {0}")]
    Append(String),
}

pub type Result<T> = std::result::Result<T, AuditError>;

// ---------------------------------------------------------------------------
// AuditSink
// ---------------------------------------------------------------------------

/// Append-only destination for safety decisions.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, decision: &SafetyDecision) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryAuditSink
// ---------------------------------------------------------------------------

/// In-memory sink for tests and embedded use.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<SafetyDecision>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SafetyDecision> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, decision: &SafetyDecision) -> Result<()> {
        self.records
            .lock()
            .map_err(|e| AuditError::Append(e.to_string()))?
            .push(decision.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonlAuditSink
// ---------------------------------------------------------------------------

/// One JSON object per line, appended and flushed per decision.
pub struct JsonlAuditSink {
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, decision: &SafetyDecision) -> Result<()> {
        let line = serde_json::to_string(decision)
            .map_err(|e| AuditError::Append(e.to_string()))?;
        let mut file = self
            .file
            .lock()
            .map_err(|e| AuditError::Append(e.to_string()))?;
        writeln!(file, "{}", line).map_err(|e| AuditError::Append(e.to_string()))?;
        file.flush().map_err(|e| AuditError::Append(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{ActorRole, DecisionOutcome, RiskLevel};
    use chrono::Utc;
    use uuid::Uuid;

    fn decision() -> SafetyDecision {
        SafetyDecision {
            operation_id: Uuid::new_v4(),
            operation_type: "read_config".into(),
            actor_role: ActorRole::Agent,
            declared_risk: RiskLevel::Low,
            assessed_risk: RiskLevel::Low,
            outcome: DecisionOutcome::Allowed,
            decided_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_sink_retains_appends() {
        let sink = MemoryAuditSink::new();
        sink.append(&decision()).await.unwrap();
        sink.append(&decision()).await.unwrap();
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test]
    async fn jsonl_sink_writes_one_line_per_decision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();

        sink.append(&decision()).await.unwrap();
        sink.append(&decision()).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: SafetyDecision = serde_json::from_str(line).unwrap();
            assert!(parsed.outcome.is_allowed());
        }
    }
}
