//! Downstream execution backend contract.

use crate::run::{Attachment, BackendKind, Log, RunRequest};
use crate::state::State;
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Backend call failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached or did not answer in time.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request (4xx).
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The backend failed (5xx) or answered with something undecodable.
    #[error("backend fault ({status}): {message}")]
    Fault { status: u16, message: String },
}

impl BackendError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BackendError::Rejected { .. })
    }
}

/// What a backend reports about one run.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRunReport {
    pub state: State,
    pub run_log: Option<Log>,
    pub task_logs: Vec<Log>,
    pub outputs: Map<String, Value>,
}

impl BackendRunReport {
    pub fn new(state: State) -> Self {
        Self {
            state,
            run_log: None,
            task_logs: Vec::new(),
            outputs: Map::new(),
        }
    }
}

/// Submission handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub run_id: &'a str,
    pub request: &'a RunRequest,
    pub attachments: &'a [Attachment],
}

/// Client for a downstream WES or TES service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend family, recorded on the run once accepted.
    fn kind(&self) -> BackendKind;

    /// Submit a run; returns the backend's identifier for it.
    async fn submit(&self, submission: Submission<'_>) -> Result<String, BackendError>;

    /// Fetch the current state, logs and outputs of a backend run.
    async fn poll(&self, backend_run_id: &str) -> Result<BackendRunReport, BackendError>;

    /// Request cancellation. Cancelling a run that already finished or is
    /// already being cancelled succeeds.
    async fn cancel(&self, backend_run_id: &str) -> Result<(), BackendError>;
}
