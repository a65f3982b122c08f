//! WES response bodies.

use crate::run::{Log, Run, RunRequest};
use crate::state::State;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunId {
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub state: State,
}

impl From<&Run> for RunStatus {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.clone(),
            state: run.state,
        }
    }
}

/// Full run log (WES `RunLog`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub request: RunRequest,
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_log: Option<Log>,
    #[serde(default)]
    pub task_logs: Vec<Log>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

impl From<&Run> for RunLog {
    fn from(run: &Run) -> Self {
        let run_log = match (&run.run_log, run.system_logs.is_empty()) {
            (None, true) => None,
            (log, _) => {
                let mut log = log.clone().unwrap_or_default();
                log.system_logs.extend(run.system_logs.iter().cloned());
                Some(log)
            }
        };
        Self {
            run_id: run.run_id.clone(),
            request: run.request.clone(),
            state: run.state,
            run_log,
            task_logs: run.task_logs.clone(),
            outputs: run.outputs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunListResponse {
    pub runs: Vec<RunStatus>,
    /// Empty when there are no further pages.
    pub next_page_token: String,
}

/// WES error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub msg: String,
    pub status_code: u16,
}
