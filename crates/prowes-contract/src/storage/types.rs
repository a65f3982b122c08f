use crate::run::{now_millis, BackendKind, Log, Run};
use crate::state::State;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

// ============================================================================
// Versioning
// ============================================================================

/// Monotonically increasing version for optimistic concurrency.
pub type Version = u64;

/// Version check policy for update operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPrecondition {
    /// Skip version check before commit.
    #[default]
    Any,
    /// Require an exact version match before commit.
    Exact(Version),
}

impl VersionPrecondition {
    pub fn check(self, actual: Version) -> Result<(), RunStoreError> {
        match self {
            VersionPrecondition::Exact(expected) if expected != actual => {
                Err(RunStoreError::VersionConflict { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

/// Commit acknowledgement returned after a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub version: Version,
}

/// Run plus current storage version.
#[derive(Debug, Clone)]
pub struct RunHead {
    pub run: Run,
    pub version: Version,
}

// ============================================================================
// Partial updates
// ============================================================================

/// Atomic partial update of a stored run.
///
/// `None` fields are left untouched; `system_logs` entries are appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub state: Option<State>,
    pub backend: Option<BackendKind>,
    pub backend_run_id: Option<String>,
    pub run_log: Option<Log>,
    pub task_logs: Option<Vec<Log>>,
    pub outputs: Option<Map<String, Value>>,
    pub system_logs: Vec<String>,
}

impl RunPatch {
    pub fn state(state: State) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_system_log(mut self, line: impl Into<String>) -> Self {
        self.system_logs.push(line.into());
        self
    }

    /// Apply this patch to `run`, enforcing the run state machine and the
    /// set-once rule for `backend_run_id`. On error `run` is left unchanged.
    pub fn apply_to(&self, run: &mut Run) -> Result<(), RunStoreError> {
        if let Some(next) = self.state {
            if !run.state.can_transition_to(next) {
                return Err(RunStoreError::InvalidTransition {
                    run_id: run.run_id.clone(),
                    from: run.state,
                    to: next,
                });
            }
        }
        if let (Some(current), Some(incoming)) = (&run.backend_run_id, &self.backend_run_id) {
            if current != incoming {
                return Err(RunStoreError::BackendRunIdAlreadySet(run.run_id.clone()));
            }
        }

        if let Some(next) = self.state {
            run.state = next;
        }
        if let Some(backend) = self.backend {
            run.backend = Some(backend);
        }
        if let Some(id) = &self.backend_run_id {
            run.backend_run_id = Some(id.clone());
        }
        if let Some(log) = &self.run_log {
            run.run_log = Some(log.clone());
        }
        if let Some(task_logs) = &self.task_logs {
            run.task_logs = task_logs.clone();
        }
        if let Some(outputs) = &self.outputs {
            run.outputs = outputs.clone();
        }
        run.system_logs.extend(self.system_logs.iter().cloned());
        run.updated_at = now_millis().max(run.updated_at);
        Ok(())
    }
}

// ============================================================================
// Listing
// ============================================================================

/// Cursor-based pagination query for run lists.
#[derive(Debug, Clone)]
pub struct RunListQuery {
    /// Maximum number of runs to return (clamped to 1..=200).
    pub page_size: usize,
    /// Opaque cursor returned as `next_page_token` by the previous page.
    pub page_token: Option<String>,
    /// Only return runs in one of these states. Empty means all states.
    pub states: Vec<State>,
}

impl Default for RunListQuery {
    fn default() -> Self {
        Self {
            page_size: 50,
            page_token: None,
            states: Vec::new(),
        }
    }
}

/// One page of runs, newest first.
#[derive(Debug, Clone)]
pub struct RunListPage {
    pub items: Vec<Run>,
    /// `None` when there are no further pages.
    pub next_page_token: Option<String>,
}

/// Position of the last run on a page: `(created_at, run_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PageCursor {
    created_at: u64,
    run_id: String,
}

impl PageCursor {
    fn of(run: &Run) -> Self {
        Self {
            created_at: run.created_at,
            run_id: run.run_id.clone(),
        }
    }

    fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.created_at, self.run_id))
    }

    fn decode(token: &str) -> Result<Self, RunStoreError> {
        let invalid = || RunStoreError::InvalidPageToken(token.to_string());
        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (created_at, run_id) = raw.split_once(':').ok_or_else(invalid)?;
        if run_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            created_at: created_at.parse().map_err(|_| invalid())?,
            run_id: run_id.to_string(),
        })
    }
}

/// Paginate runs in memory, newest first by `(created_at, run_id)`.
///
/// The page token encodes the key of the last returned run, so runs inserted
/// between two page requests never shift or duplicate entries of later pages.
pub fn paginate_runs(
    runs: impl IntoIterator<Item = Run>,
    query: &RunListQuery,
) -> Result<RunListPage, RunStoreError> {
    let after = query
        .page_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(PageCursor::decode)
        .transpose()?;
    let limit = query.page_size.clamp(1, 200);

    let mut items: Vec<Run> = runs
        .into_iter()
        .filter(|run| query.states.is_empty() || query.states.contains(&run.state))
        .filter(|run| match &after {
            Some(cursor) => PageCursor::of(run) < *cursor,
            None => true,
        })
        .collect();
    items.sort_by(|a, b| PageCursor::of(b).cmp(&PageCursor::of(a)));

    let has_more = items.len() > limit;
    items.truncate(limit);
    let next_page_token = if has_more {
        items.last().map(|run| PageCursor::of(run).encode())
    } else {
        None
    };
    Ok(RunListPage {
        items,
        next_page_token,
    })
}

/// Count runs per state; every state is present, zero included.
pub fn count_states<'a>(runs: impl IntoIterator<Item = &'a Run>) -> BTreeMap<State, u64> {
    let mut counts: BTreeMap<State, u64> = State::ALL.into_iter().map(|s| (s, 0)).collect();
    for run in runs {
        *counts.entry(run.state).or_default() += 1;
    }
    counts
}

// ============================================================================
// Errors
// ============================================================================

/// Storage-level errors.
#[derive(Debug, Error)]
pub enum RunStoreError {
    /// Run not found.
    #[error("Run not found: {0}")]
    NotFound(String),

    /// A run with this id already exists.
    #[error("Run already exists")]
    AlreadyExists,

    /// Invalid run id (path traversal, control chars, etc.).
    #[error("Invalid run id: {0}")]
    InvalidId(String),

    /// The requested state change violates the run state machine.
    #[error("Invalid state transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: State,
        to: State,
    },

    /// A different backend run id is already recorded.
    #[error("Backend run id already set for run {0}")]
    BackendRunIdAlreadySet(String),

    /// Optimistic concurrency check failed.
    #[error("Version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: Version, actual: Version },

    /// Page token could not be decoded.
    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunRequest;

    fn run_at(id: &str, created_at: u64) -> Run {
        Run::new(id, RunRequest::default()).with_created_at(created_at)
    }

    #[test]
    fn patch_rejects_leaving_terminal_state() {
        let mut run = run_at("r1", 1);
        run.state = State::Complete;
        let err = RunPatch::state(State::Running).apply_to(&mut run).unwrap_err();
        assert!(matches!(
            err,
            RunStoreError::InvalidTransition {
                from: State::Complete,
                to: State::Running,
                ..
            }
        ));
        assert_eq!(run.state, State::Complete);
    }

    #[test]
    fn patch_sets_backend_run_id_once() {
        let mut run = run_at("r1", 1);
        let patch = RunPatch {
            state: Some(State::Initializing),
            backend_run_id: Some("b-1".into()),
            ..Default::default()
        };
        patch.apply_to(&mut run).unwrap();
        assert_eq!(run.backend_run_id.as_deref(), Some("b-1"));
        // Re-applying the same id is fine.
        patch.apply_to(&mut run).unwrap();

        let other = RunPatch {
            backend_run_id: Some("b-2".into()),
            ..Default::default()
        };
        assert!(matches!(
            other.apply_to(&mut run),
            Err(RunStoreError::BackendRunIdAlreadySet(_))
        ));
        assert_eq!(run.backend_run_id.as_deref(), Some("b-1"));
    }

    #[test]
    fn patch_appends_system_logs() {
        let mut run = run_at("r1", 1);
        RunPatch::default()
            .with_system_log("first")
            .apply_to(&mut run)
            .unwrap();
        RunPatch::state(State::SystemError)
            .with_system_log("second")
            .apply_to(&mut run)
            .unwrap();
        assert_eq!(run.system_logs, vec!["first", "second"]);
        assert_eq!(run.state, State::SystemError);
    }

    #[test]
    fn precondition_check() {
        assert!(VersionPrecondition::Any.check(7).is_ok());
        assert!(VersionPrecondition::Exact(7).check(7).is_ok());
        assert!(matches!(
            VersionPrecondition::Exact(6).check(7),
            Err(RunStoreError::VersionConflict {
                expected: 6,
                actual: 7
            })
        ));
    }

    #[test]
    fn paginate_orders_newest_first_with_id_tiebreak() {
        let runs = vec![run_at("a", 10), run_at("b", 30), run_at("c", 20), run_at("d", 30)];
        let page = paginate_runs(runs, &RunListQuery::default()).unwrap();
        let ids: Vec<_> = page.items.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "b", "c", "a"]);
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn paginate_rejects_garbage_token() {
        let query = RunListQuery {
            page_token: Some("not a token!".into()),
            ..Default::default()
        };
        assert!(matches!(
            paginate_runs(Vec::new(), &query),
            Err(RunStoreError::InvalidPageToken(_))
        ));
    }

    #[test]
    fn empty_page_token_means_first_page() {
        let query = RunListQuery {
            page_token: Some(String::new()),
            ..Default::default()
        };
        let page = paginate_runs(vec![run_at("a", 1)], &query).unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn count_states_lists_every_state() {
        let mut done = run_at("b", 2);
        done.state = State::Complete;
        let runs = [run_at("a", 1), done, run_at("c", 3)];
        let counts = count_states(runs.iter());
        assert_eq!(counts.len(), State::ALL.len());
        assert_eq!(counts[&State::Queued], 2);
        assert_eq!(counts[&State::Complete], 1);
        assert_eq!(counts[&State::Canceled], 0);
    }
}
