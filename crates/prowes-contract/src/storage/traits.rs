use crate::run::Run;
use crate::state::State;
use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{
    count_states, Committed, RunHead, RunListPage, RunListQuery, RunPatch, RunStoreError,
    VersionPrecondition,
};

#[async_trait]
pub trait RunReader: Send + Sync {
    /// Load a run and its current version.
    async fn load(&self, run_id: &str) -> Result<Option<RunHead>, RunStoreError>;

    /// Load a run without version info. Convenience wrapper.
    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, RunStoreError> {
        Ok(self.load(run_id).await?.map(|h| h.run))
    }

    /// List runs, newest first.
    async fn list_runs(&self, query: &RunListQuery) -> Result<RunListPage, RunStoreError>;

    /// Collect every run in one of `states` (all runs when empty) by walking
    /// all pages.
    async fn list_all(&self, states: &[State]) -> Result<Vec<Run>, RunStoreError> {
        let mut query = RunListQuery {
            page_size: 200,
            page_token: None,
            states: states.to_vec(),
        };
        let mut runs = Vec::new();
        loop {
            let page = self.list_runs(&query).await?;
            runs.extend(page.items);
            match page.next_page_token {
                Some(token) => query.page_token = Some(token),
                None => return Ok(runs),
            }
        }
    }

    /// Number of runs per state, every state included.
    async fn state_counts(&self) -> Result<BTreeMap<State, u64>, RunStoreError> {
        let runs = self.list_all(&[]).await?;
        Ok(count_states(runs.iter()))
    }
}

#[async_trait]
pub trait RunWriter: RunReader {
    /// Create a new run at version 0. Returns `AlreadyExists` if the id is taken.
    async fn create(&self, run: &Run) -> Result<Committed, RunStoreError>;

    /// Atomically apply `patch` to an existing run.
    ///
    /// Enforces the run state machine and `precondition`; each successful
    /// update increments the version.
    async fn update(
        &self,
        run_id: &str,
        patch: &RunPatch,
        precondition: VersionPrecondition,
    ) -> Result<Committed, RunStoreError>;
}

/// Full run store capability (read + write).
pub trait RunStore: RunWriter {}

impl<T: RunWriter + ?Sized> RunStore for T {}
