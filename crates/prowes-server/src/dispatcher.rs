//! Background submission of queued runs to the backend.
//!
//! Run ids travel through an unbounded mpsc queue consumed by a fixed pool
//! of workers. A run is `pending` from enqueue until a worker picks it up and
//! `in_flight` while that worker submits it; a run is never in both sets.

use crate::config::DispatchConfig;
use prowes_contract::storage::{
    RunPatch, RunReader, RunStore, RunStoreError, RunWriter, VersionPrecondition,
};
use prowes_contract::{Backend, BackendError, State, Submission};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Store write attempts after a submit returned.
const RECORD_ATTEMPTS: usize = 3;

/// Where a run stood when its queued dispatch was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dequeue {
    /// Removed before any worker picked it up.
    Removed,
    /// A worker is submitting it right now.
    InFlight,
    /// Not known to the dispatcher.
    NotQueued,
}

/// How a single dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The backend accepted the run.
    Submitted { backend_run_id: String },
    /// The run ended in `SYSTEM_ERROR`.
    Failed,
    /// The run was cancelled before or during submission.
    Cancelled,
    /// The run was not `QUEUED` (or no longer exists).
    Skipped,
    /// Shutdown interrupted the retry loop; the run stays `QUEUED`.
    Interrupted,
}

#[derive(Default)]
struct DispatchSets {
    pending: HashSet<String>,
    in_flight: HashSet<String>,
}

struct Inner {
    store: Arc<dyn RunStore>,
    backend: Arc<dyn Backend>,
    config: DispatchConfig,
    sets: Mutex<DispatchSets>,
    tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

/// Cloneable handle to the dispatch queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create the queue and spawn `config.workers` workers.
    pub fn start(
        store: Arc<dyn RunStore>,
        backend: Arc<dyn Backend>,
        config: DispatchConfig,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = config.workers.max(1);
        let (dispatcher, rx) = Self::new(store, backend, config, shutdown);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers)
            .map(|worker| {
                let dispatcher = dispatcher.clone();
                let rx = rx.clone();
                tokio::spawn(async move { dispatcher.worker_loop(worker, rx).await })
            })
            .collect();
        (dispatcher, handles)
    }

    fn new(
        store: Arc<dyn RunStore>,
        backend: Arc<dyn Backend>,
        config: DispatchConfig,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            inner: Arc::new(Inner {
                store,
                backend,
                config,
                sets: Mutex::new(DispatchSets::default()),
                tx,
                shutdown,
            }),
        };
        (dispatcher, rx)
    }

    /// Queue `run_id` for submission. Returns `false` when the run is already
    /// pending or being submitted.
    pub fn enqueue(&self, run_id: &str) -> bool {
        {
            let mut sets = self.lock_sets();
            if sets.in_flight.contains(run_id) || !sets.pending.insert(run_id.to_string()) {
                return false;
            }
        }
        if self.inner.tx.send(run_id.to_string()).is_err() {
            self.lock_sets().pending.remove(run_id);
            tracing::warn!(run_id = %run_id, "dispatch queue closed; run stays queued");
            return false;
        }
        tracing::debug!(run_id = %run_id, "run enqueued for dispatch");
        true
    }

    /// Drop a pending run from the queue.
    pub fn dequeue(&self, run_id: &str) -> Dequeue {
        let mut sets = self.lock_sets();
        if sets.pending.remove(run_id) {
            Dequeue::Removed
        } else if sets.in_flight.contains(run_id) {
            Dequeue::InFlight
        } else {
            Dequeue::NotQueued
        }
    }

    pub fn is_pending(&self, run_id: &str) -> bool {
        self.lock_sets().pending.contains(run_id)
    }

    /// Re-enqueue every run still `QUEUED` in the store, and finish cancels
    /// that were interrupted before the run reached the backend. Returns the
    /// number of runs re-enqueued.
    pub async fn recover(&self) -> Result<usize, RunStoreError> {
        let canceling = self.inner.store.list_all(&[State::Canceling]).await?;
        let mut finished = 0;
        for run in canceling.iter().filter(|run| run.backend_run_id.is_none()) {
            if self.lock_sets().in_flight.contains(&run.run_id) {
                continue;
            }
            if self.finish_cancel(&run.run_id).await {
                finished += 1;
            }
        }
        if finished > 0 {
            tracing::info!(count = finished, "finished interrupted cancels");
        }

        let queued = self.inner.store.list_all(&[State::Queued]).await?;
        let mut enqueued = 0;
        // Oldest first.
        for run in queued.iter().rev() {
            if run.backend_run_id.is_none() && self.enqueue(&run.run_id) {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            tracing::info!(count = enqueued, "re-enqueued queued runs");
        }
        Ok(enqueued)
    }

    fn lock_sets(&self) -> std::sync::MutexGuard<'_, DispatchSets> {
        self.inner
            .sets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn worker_loop(
        &self,
        worker: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    ) {
        loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.cancelled() => None,
                next = async { rx.lock().await.recv().await } => next,
            };
            let Some(run_id) = next else {
                tracing::debug!(worker, "dispatch worker stopped");
                return;
            };

            {
                let mut sets = self.lock_sets();
                if !sets.pending.remove(&run_id) {
                    // Cancelled while queued.
                    continue;
                }
                sets.in_flight.insert(run_id.clone());
            }
            let outcome = self.dispatch_run(&run_id).await;
            self.lock_sets().in_flight.remove(&run_id);
            tracing::debug!(worker, run_id = %run_id, ?outcome, "dispatch finished");
        }
    }

    /// Submit one run with retries, recording the result in the store.
    pub async fn dispatch_run(&self, run_id: &str) -> DispatchOutcome {
        let max_attempts = self.inner.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let run = match self.inner.store.load_run(run_id).await {
                Ok(Some(run)) => run,
                Ok(None) => {
                    tracing::warn!(run_id = %run_id, "queued run disappeared from store");
                    return DispatchOutcome::Skipped;
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "failed to load queued run");
                    return DispatchOutcome::Skipped;
                }
            };
            match run.state {
                State::Queued => {}
                State::Canceling if run.backend_run_id.is_none() => {
                    self.finish_cancel(run_id).await;
                    return DispatchOutcome::Cancelled;
                }
                state => {
                    tracing::debug!(
                        run_id = %run_id,
                        %state,
                        "run no longer queued; skipping dispatch"
                    );
                    return if state == State::Canceled {
                        DispatchOutcome::Cancelled
                    } else {
                        DispatchOutcome::Skipped
                    };
                }
            }

            tracing::info!(run_id = %run_id, attempt, max_attempts, "submitting run to backend");
            let submitted = self
                .inner
                .backend
                .submit(Submission {
                    run_id,
                    request: &run.request,
                    attachments: &run.attachments,
                })
                .await;

            match submitted {
                Ok(backend_run_id) => return self.record_submitted(run_id, backend_run_id).await,
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let wait = self.inner.config.backoff_ms(attempt - 1);
                    tracing::warn!(
                        run_id = %run_id,
                        attempt,
                        max_attempts,
                        wait_ms = wait,
                        error = %e,
                        "backend submit failed; retrying"
                    );
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => return DispatchOutcome::Interrupted,
                        _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                    }
                }
                Err(e) => return self.record_failed(run_id, attempt, &e).await,
            }
        }
    }

    /// Record the backend run id. Retries on version conflicts and store
    /// errors; when the id cannot be recorded the backend run is cancelled so
    /// a later recovery does not submit the run twice.
    async fn record_submitted(&self, run_id: &str, backend_run_id: String) -> DispatchOutcome {
        let kind = self.inner.backend.kind();
        for attempt in 1..=RECORD_ATTEMPTS {
            let head = match self.inner.store.load(run_id).await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    tracing::warn!(
                        run_id = %run_id,
                        backend_run_id = %backend_run_id,
                        "submitted run disappeared from store; cancelling backend run"
                    );
                    self.cancel_backend_run(run_id, &backend_run_id).await;
                    return DispatchOutcome::Skipped;
                }
                Err(e) => {
                    tracing::warn!(run_id = %run_id, attempt, error = %e, "failed to load run");
                    self.record_backoff(attempt).await;
                    continue;
                }
            };
            if head.run.state != State::Queued {
                return self
                    .record_cancelled_submit(run_id, backend_run_id, head.run.state)
                    .await;
            }

            let patch = RunPatch {
                state: Some(State::Initializing),
                backend: Some(kind),
                backend_run_id: Some(backend_run_id.clone()),
                ..Default::default()
            };
            match self
                .inner
                .store
                .update(run_id, &patch, VersionPrecondition::Exact(head.version))
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        run_id = %run_id,
                        backend_run_id = %backend_run_id,
                        backend = %kind,
                        "run accepted by backend"
                    );
                    return DispatchOutcome::Submitted { backend_run_id };
                }
                Err(RunStoreError::VersionConflict { .. }) => {}
                Err(e) => {
                    tracing::warn!(
                        run_id = %run_id,
                        backend_run_id = %backend_run_id,
                        attempt,
                        error = %e,
                        "failed to record submitted run"
                    );
                    self.record_backoff(attempt).await;
                }
            }
        }

        tracing::error!(
            run_id = %run_id,
            backend_run_id = %backend_run_id,
            attempts = RECORD_ATTEMPTS,
            "could not record submitted run; cancelling backend run"
        );
        self.cancel_backend_run(run_id, &backend_run_id).await;
        DispatchOutcome::Failed
    }

    /// The run was cancelled while its submit was in flight: cancel the
    /// backend run and keep its id so the reconciler can follow it.
    async fn record_cancelled_submit(
        &self,
        run_id: &str,
        backend_run_id: String,
        state: State,
    ) -> DispatchOutcome {
        tracing::warn!(
            run_id = %run_id,
            backend_run_id = %backend_run_id,
            state = %state,
            "run cancelled during submit; cancelling backend run"
        );
        let mut patch = RunPatch {
            backend: Some(self.inner.backend.kind()),
            backend_run_id: Some(backend_run_id.clone()),
            ..Default::default()
        };
        if let Err(e) = self.inner.backend.cancel(&backend_run_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "backend cancel failed");
            patch
                .system_logs
                .push(format!("cancel of backend run {backend_run_id} failed: {e}"));
        }
        if let Err(e) = self
            .inner
            .store
            .update(run_id, &patch, VersionPrecondition::Any)
            .await
        {
            tracing::error!(run_id = %run_id, error = %e, "failed to record backend run id");
        }
        DispatchOutcome::Cancelled
    }

    /// Mark the run `SYSTEM_ERROR`, unless it was cancelled meanwhile; a
    /// cancelled run that never reached the backend ends `CANCELED`.
    async fn record_failed(
        &self,
        run_id: &str,
        attempts: usize,
        err: &BackendError,
    ) -> DispatchOutcome {
        let line = match err {
            BackendError::Rejected { .. } => format!("backend rejected run: {err}"),
            _ => format!("dispatch failed after {attempts} attempt(s): {err}"),
        };
        for _ in 0..RECORD_ATTEMPTS {
            let head = match self.inner.store.load(run_id).await {
                Ok(Some(head)) => head,
                Ok(None) => return DispatchOutcome::Skipped,
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "failed to load run");
                    return DispatchOutcome::Failed;
                }
            };
            match head.run.state {
                State::Queued => {}
                State::Canceling if head.run.backend_run_id.is_none() => {
                    tracing::info!(
                        run_id = %run_id,
                        error = %err,
                        "submit failed after cancel; marking run CANCELED"
                    );
                    self.finish_cancel(run_id).await;
                    return DispatchOutcome::Cancelled;
                }
                state => {
                    tracing::info!(run_id = %run_id, %state, "run left QUEUED during dispatch");
                    return DispatchOutcome::Skipped;
                }
            }

            tracing::warn!(
                run_id = %run_id,
                attempts,
                error = %err,
                "dispatch failed; marking run SYSTEM_ERROR"
            );
            let patch = RunPatch::state(State::SystemError).with_system_log(line.clone());
            match self
                .inner
                .store
                .update(run_id, &patch, VersionPrecondition::Exact(head.version))
                .await
            {
                Ok(_) => return DispatchOutcome::Failed,
                Err(RunStoreError::VersionConflict { .. }) => continue,
                Err(e) => {
                    tracing::error!(
                        run_id = %run_id,
                        error = %e,
                        "failed to record dispatch failure"
                    );
                    return DispatchOutcome::Failed;
                }
            }
        }
        tracing::error!(run_id = %run_id, "run kept changing while recording dispatch failure");
        DispatchOutcome::Failed
    }

    async fn cancel_backend_run(&self, run_id: &str, backend_run_id: &str) {
        if let Err(e) = self.inner.backend.cancel(backend_run_id).await {
            tracing::error!(
                run_id = %run_id,
                backend_run_id = %backend_run_id,
                error = %e,
                "backend cancel failed; backend run is orphaned"
            );
        }
    }

    async fn record_backoff(&self, attempt: usize) {
        if attempt < RECORD_ATTEMPTS {
            let wait = self.inner.config.backoff_ms(attempt - 1);
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
    }

    /// A run cancelled mid-dispatch that never reached the backend.
    async fn finish_cancel(&self, run_id: &str) -> bool {
        let patch = RunPatch::state(State::Canceled);
        match self
            .inner
            .store
            .update(run_id, &patch, VersionPrecondition::Any)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "failed to mark run CANCELED");
                false
            }
        }
    }
}
