use prowes_backend::BackendConfig;
use prowes_contract::ServiceInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Gateway configuration file (JSON). Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub backend: BackendConfig,
    pub dispatch: DispatchConfig,
    pub reconcile: ReconcileConfig,
    pub post_runs: PostRunsConfig,
    pub list_runs: ListRunsConfig,
    pub service_info: ServiceInfo,
}

/// Submission retry policy and worker pool size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Concurrent dispatch workers (must be >= 1).
    pub workers: usize,
    /// Total submit attempts per run (must be >= 1).
    pub max_attempts: usize,
    /// Initial backoff for retries in milliseconds.
    pub initial_backoff_ms: u64,
    /// Max backoff cap in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
        }
    }
}

impl DispatchConfig {
    /// Wait before retry number `retry_index` (0-based): the initial backoff,
    /// doubling per retry, capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, retry_index: usize) -> u64 {
        let initial = self.initial_backoff_ms;
        let cap = self.max_backoff_ms.max(initial);
        if retry_index == 0 {
            return initial.min(cap);
        }
        let shift = retry_index.min(20) as u32;
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        initial.saturating_mul(factor).min(cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Delay between reconciliation passes.
    pub interval_ms: u64,
    /// Backend polls in flight at once.
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostRunsConfig {
    /// Attempts at finding an unused run id.
    pub id_insert_attempts: usize,
    /// Request body limit for run submissions, attachments included.
    pub max_body_bytes: usize,
}

impl Default for PostRunsConfig {
    fn default() -> Self {
        Self {
            id_insert_attempts: 10,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListRunsConfig {
    pub default_page_size: usize,
}

impl Default for ListRunsConfig {
    fn default() -> Self {
        Self {
            default_page_size: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config (JSON): {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.dispatch.workers == 0 {
            return invalid("dispatch.workers must be at least 1");
        }
        if self.dispatch.max_attempts == 0 {
            return invalid("dispatch.max_attempts must be at least 1");
        }
        if self.reconcile.interval_ms == 0 {
            return invalid("reconcile.interval_ms must be positive");
        }
        if self.reconcile.concurrency == 0 {
            return invalid("reconcile.concurrency must be at least 1");
        }
        if self.post_runs.id_insert_attempts == 0 {
            return invalid("post_runs.id_insert_attempts must be at least 1");
        }
        if !(1..=200).contains(&self.list_runs.default_page_size) {
            return invalid("list_runs.default_page_size must be within 1..=200");
        }
        if self.service_info.workflow_type_versions.is_empty() {
            return invalid("service_info.workflow_type_versions must not be empty");
        }
        Ok(())
    }
}
