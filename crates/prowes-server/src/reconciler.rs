//! Periodic refresh of run state from the backend.

use crate::config::ReconcileConfig;
use futures::stream::{self, StreamExt};
use prowes_contract::storage::{
    RunPatch, RunReader, RunStore, RunStoreError, RunWriter, VersionPrecondition,
};
use prowes_contract::{Backend, BackendError, State};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// States whose runs are polled, given a backend run id.
const POLLED_STATES: [State; 5] = [
    State::Initializing,
    State::Running,
    State::Paused,
    State::Canceling,
    State::Unknown,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The run is not polled (not dispatched yet, or finished).
    Skipped,
    /// Logs were refreshed; the state did not change.
    Unchanged(State),
    Updated { from: State, to: State },
    /// Another writer got there first; retried on the next pass.
    Conflict,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("run not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] RunStoreError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub struct Reconciler {
    store: Arc<dyn RunStore>,
    backend: Arc<dyn Backend>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RunStore>,
        backend: Arc<dyn Backend>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            backend,
            config,
        }
    }

    /// Poll the backend for one run and store what it reports.
    pub async fn reconcile_run(&self, run_id: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let head = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(run_id.to_string()))?;
        let run = head.run;
        let Some(backend_run_id) = run.backend_run_id.as_deref() else {
            return Ok(ReconcileOutcome::Skipped);
        };
        if !run.state.is_pollable() {
            return Ok(ReconcileOutcome::Skipped);
        }

        let report = self.backend.poll(backend_run_id).await?;
        let reported = report.state;
        let next = if reported == State::Unknown || reported == run.state {
            None
        } else if run.state.can_transition_to(reported) {
            Some(reported)
        } else {
            tracing::debug!(
                run_id = %run_id,
                current = %run.state,
                reported = %reported,
                "ignoring backend state that would move the run backwards"
            );
            None
        };

        let patch = RunPatch {
            state: next,
            run_log: report.run_log,
            task_logs: Some(report.task_logs),
            outputs: Some(report.outputs),
            ..Default::default()
        };
        match self
            .store
            .update(run_id, &patch, VersionPrecondition::Exact(head.version))
            .await
        {
            Ok(_) => {}
            Err(RunStoreError::VersionConflict { .. }) => {
                tracing::debug!(
                    run_id = %run_id,
                    "run changed during reconcile; retrying next pass"
                );
                return Ok(ReconcileOutcome::Conflict);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(match next {
            Some(to) => {
                tracing::info!(
                    run_id = %run_id,
                    from = %run.state,
                    to = %to,
                    "run state updated from backend"
                );
                ReconcileOutcome::Updated {
                    from: run.state,
                    to,
                }
            }
            None => ReconcileOutcome::Unchanged(run.state),
        })
    }

    /// One pass over every polled run, with bounded parallelism.
    /// Returns the number of runs whose state changed.
    pub async fn reconcile_all(&self) -> Result<usize, RunStoreError> {
        let runs = self.store.list_all(&POLLED_STATES).await?;
        let ids: Vec<String> = runs
            .into_iter()
            .filter(|run| run.backend_run_id.is_some())
            .map(|run| run.run_id)
            .collect();

        let results: Vec<(String, Result<ReconcileOutcome, ReconcileError>)> = stream::iter(ids)
            .map(|run_id| async move {
                let result = self.reconcile_run(&run_id).await;
                (run_id, result)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut updated = 0;
        for (run_id, result) in results {
            match result {
                Ok(ReconcileOutcome::Updated { .. }) => updated += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    run_id = %run_id,
                    error = %e,
                    "reconcile failed; keeping last known state"
                ),
            }
        }
        Ok(updated)
    }

    /// Run [`Reconciler::reconcile_all`] every `interval_ms` until `shutdown`.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.interval_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("reconciler stopped");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                if let Err(e) = self.reconcile_all().await {
                    tracing::error!(error = %e, "reconcile pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prowes_contract::testing::ScriptedBackend;
    use prowes_contract::{BackendRunReport, Log, Run, RunRequest};
    use prowes_store_adapters::MemoryStore;
    use serde_json::json;

    async fn dispatched(store: &MemoryStore, run_id: &str, state: State) {
        store.create(&Run::new(run_id, RunRequest::default())).await.unwrap();
        let patch = RunPatch {
            state: Some(State::Initializing),
            backend_run_id: Some(format!("backend-{run_id}")),
            ..Default::default()
        };
        store.update(run_id, &patch, VersionPrecondition::Any).await.unwrap();
        if state != State::Initializing {
            store
                .update(run_id, &RunPatch::state(state), VersionPrecondition::Any)
                .await
                .unwrap();
        }
    }

    fn reconciler(store: Arc<MemoryStore>, backend: Arc<ScriptedBackend>) -> Reconciler {
        Reconciler::new(store, backend, ReconcileConfig::default())
    }

    #[tokio::test]
    async fn complete_report_is_applied_with_outputs() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        dispatched(&store, "r1", State::Running).await;
        let mut report = BackendRunReport::new(State::Complete);
        report.outputs = json!({"out": "result.txt"}).as_object().cloned().unwrap();
        report.task_logs = vec![Log {
            name: Some("step".into()),
            exit_code: Some(0),
            ..Default::default()
        }];
        backend.set_report("backend-r1", report);

        let outcome = reconciler(store.clone(), backend).reconcile_run("r1").await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                from: State::Running,
                to: State::Complete
            }
        );
        let run = store.load_run("r1").await.unwrap().unwrap();
        assert_eq!(run.state, State::Complete);
        assert_eq!(run.outputs["out"], json!("result.txt"));
        assert_eq!(run.task_logs.len(), 1);
    }

    #[tokio::test]
    async fn unknown_report_keeps_known_state_but_refreshes_logs() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        dispatched(&store, "r1", State::Running).await;
        let mut report = BackendRunReport::new(State::Unknown);
        report.run_log = Some(Log {
            stdout: Some("https://logs/r1".into()),
            ..Default::default()
        });
        backend.set_report("backend-r1", report);

        let outcome = reconciler(store.clone(), backend).reconcile_run("r1").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged(State::Running));
        let run = store.load_run("r1").await.unwrap().unwrap();
        assert_eq!(run.state, State::Running);
        assert_eq!(run.run_log.unwrap().stdout.as_deref(), Some("https://logs/r1"));
    }

    #[tokio::test]
    async fn backwards_report_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        dispatched(&store, "r1", State::Initializing).await;
        backend.set_report("backend-r1", BackendRunReport::new(State::Queued));

        let outcome = reconciler(store.clone(), backend).reconcile_run("r1").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged(State::Initializing));
    }

    #[tokio::test]
    async fn backend_errors_preserve_state() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        dispatched(&store, "r1", State::Running).await;
        backend.set_poll_error("backend-r1", BackendError::Unavailable("timeout".into()));

        let reconciler = reconciler(store.clone(), backend);
        assert!(matches!(
            reconciler.reconcile_run("r1").await,
            Err(ReconcileError::Backend(BackendError::Unavailable(_)))
        ));
        assert_eq!(reconciler.reconcile_all().await.unwrap(), 0);
        assert_eq!(store.load_run("r1").await.unwrap().unwrap().state, State::Running);
    }

    #[tokio::test]
    async fn queued_and_terminal_runs_are_not_polled() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        store.create(&Run::new("queued", RunRequest::default())).await.unwrap();
        dispatched(&store, "done", State::Complete).await;
        dispatched(&store, "live", State::Running).await;
        backend.set_report("backend-live", BackendRunReport::new(State::Paused));

        let reconciler = reconciler(store.clone(), backend.clone());
        assert_eq!(reconciler.reconcile_all().await.unwrap(), 1);
        assert_eq!(backend.polled(), vec!["backend-live"]);
        assert_eq!(
            reconciler.reconcile_run("queued").await.unwrap(),
            ReconcileOutcome::Skipped
        );
        assert_eq!(
            reconciler.reconcile_run("done").await.unwrap(),
            ReconcileOutcome::Skipped
        );
        assert!(matches!(
            reconciler.reconcile_run("ghost").await,
            Err(ReconcileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn canceling_run_settles_on_canceled() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        dispatched(&store, "r1", State::Canceling).await;
        backend.set_report("backend-r1", BackendRunReport::new(State::Canceled));

        let outcome = reconciler(store.clone(), backend).reconcile_run("r1").await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                from: State::Canceling,
                to: State::Canceled
            }
        );
    }
}
