use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// KernelConfig
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from `~/.keel/config.toml`.
///
/// Every section has defaults, so a missing file (or any missing section)
/// yields a working single-host setup under the default data directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KernelConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub engine: EngineSection,
}

impl KernelConfig {
    /// Load from `~/.keel/config.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Self::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: KernelConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Canonical config path: `~/.keel/config.toml`.
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".keel").join("config.toml")
    }

    /// Semantic checks not expressible through types alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock.store_count() < 3 {
            return Err(ConfigError::Invalid(
                "lock requires at least 3 independent stores for a meaningful quorum".into(),
            ));
        }
        if self.queue.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "queue.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.queue.backoff_jitter_ratio) {
            return Err(ConfigError::Invalid(
                "queue.backoff_jitter_ratio must be within 0.0..=1.0".into(),
            ));
        }
        if self.engine.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_concurrent must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the SQLite files (`queue.db`, `state.db`, lock stores).
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: home.join(".keel").join("data"),
        }
    }
}

impl StorageConfig {
    pub fn queue_db(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }

    pub fn state_db(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    /// Global budget for one quorum acquisition attempt.
    pub acquire_timeout_ms: u64,
    /// Slack subtracted from the validity window for clock drift.
    pub clock_drift_ms: u64,
    /// Paths of the independent lock stores. Empty means "derive
    /// `lock-0.db` .. `lock-2.db` under the data directory".
    #[serde(default)]
    pub stores: Vec<PathBuf>,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 500,
            clock_drift_ms: 100,
            stores: Vec::new(),
        }
    }
}

impl LockSection {
    pub fn store_count(&self) -> usize {
        if self.stores.is_empty() {
            3
        } else {
            self.stores.len()
        }
    }

    /// Resolve the configured store paths against the data directory.
    pub fn store_paths(&self, storage: &StorageConfig) -> Vec<PathBuf> {
        if self.stores.is_empty() {
            (0..3)
                .map(|i| storage.data_dir.join(format!("lock-{i}.db")))
                .collect()
        } else {
            self.stores.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_jitter_ratio: f64,
    pub default_max_attempts: u32,
    pub claim_lease_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            backoff_multiplier: 2.0,
            backoff_jitter_ratio: 0.2,
            default_max_attempts: 5,
            claim_lease_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    /// Interval for the background TTL sweep.
    pub sweep_interval_ms: u64,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySection {
    /// How long an approval may stay pending before resolving to Rejected.
    pub approval_timeout_ms: u64,
    /// Audit log file (JSON lines). Empty means `audit.jsonl` in the data dir.
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            approval_timeout_ms: 300_000,
            audit_log: None,
        }
    }
}

impl SafetySection {
    pub fn audit_log_path(&self, storage: &StorageConfig) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| storage.data_dir.join("audit.jsonl"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Concurrent task slots per engine instance.
    pub max_concurrent: u32,
    /// Abort the whole task when a step is denied (vs. record and continue).
    pub abort_on_denial: bool,
    /// Claim-poll fallback interval when no queue notification arrives.
    pub poll_interval_ms: u64,
    /// Interval between stale-claim reclamation passes.
    pub reclaim_interval_ms: u64,
    /// TTL for per-step resource locks.
    pub step_lock_ttl_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            abort_on_denial: true,
            poll_interval_ms: 500,
            reclaim_interval_ms: 5_000,
            step_lock_ttl_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
