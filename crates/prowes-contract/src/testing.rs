//! Shared test fixtures for crates that depend on `prowes-contract`.
//!
//! Gated behind the `test-support` cargo feature so production builds are
//! unaffected. Enable via
//! `[dev-dependencies] prowes-contract = { ..., features = ["test-support"] }`.

use crate::backend::{Backend, BackendError, BackendRunReport, Submission};
use crate::run::BackendKind;
use crate::state::State;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory [`Backend`] driven by scripted responses.
///
/// Submissions succeed with `backend-<run_id>` unless a failure was queued
/// with [`ScriptedBackend::push_submit_error`]. Polls return the report set
/// with [`ScriptedBackend::set_report`] (default `RUNNING`). Cancels mark the
/// backend run `CANCELED`.
#[derive(Default)]
pub struct ScriptedBackend {
    submit_errors: Mutex<VecDeque<BackendError>>,
    submit_delay: Mutex<Option<Duration>>,
    reports: Mutex<HashMap<String, Result<BackendRunReport, BackendError>>>,
    cancel_error: Mutex<Option<BackendError>>,
    submits: Mutex<Vec<String>>,
    polls: Mutex<Vec<String>>,
    cancels: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next submit with `err`. Queued errors are consumed in order.
    pub fn push_submit_error(&self, err: BackendError) {
        self.submit_errors.lock().unwrap().push_back(err);
    }

    /// Queue `n` transient submit failures.
    pub fn fail_submits(&self, n: usize) {
        for i in 0..n {
            self.push_submit_error(BackendError::Unavailable(format!("connection refused ({i})")));
        }
    }

    /// Sleep this long inside every submit.
    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_report(&self, backend_run_id: &str, report: BackendRunReport) {
        self.reports
            .lock()
            .unwrap()
            .insert(backend_run_id.to_string(), Ok(report));
    }

    pub fn set_poll_error(&self, backend_run_id: &str, err: BackendError) {
        self.reports
            .lock()
            .unwrap()
            .insert(backend_run_id.to_string(), Err(err));
    }

    pub fn set_cancel_error(&self, err: BackendError) {
        *self.cancel_error.lock().unwrap() = Some(err);
    }

    /// Run ids passed to `submit`, including failed attempts.
    pub fn submitted(&self) -> Vec<String> {
        self.submits.lock().unwrap().clone()
    }

    /// Backend run ids passed to `poll`.
    pub fn polled(&self) -> Vec<String> {
        self.polls.lock().unwrap().clone()
    }

    /// Backend run ids passed to `cancel`.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wes
    }

    async fn submit(&self, submission: Submission<'_>) -> Result<String, BackendError> {
        self.submits
            .lock()
            .unwrap()
            .push(submission.run_id.to_string());
        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.submit_errors.lock().unwrap().pop_front();
        match scripted {
            Some(err) => Err(err),
            None => Ok(format!("backend-{}", submission.run_id)),
        }
    }

    async fn poll(&self, backend_run_id: &str) -> Result<BackendRunReport, BackendError> {
        self.polls.lock().unwrap().push(backend_run_id.to_string());
        self.reports
            .lock()
            .unwrap()
            .get(backend_run_id)
            .cloned()
            .unwrap_or_else(|| Ok(BackendRunReport::new(State::Running)))
    }

    async fn cancel(&self, backend_run_id: &str) -> Result<(), BackendError> {
        self.cancels.lock().unwrap().push(backend_run_id.to_string());
        if let Some(err) = self.cancel_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.set_report(backend_run_id, BackendRunReport::new(State::Canceled));
        Ok(())
    }
}
