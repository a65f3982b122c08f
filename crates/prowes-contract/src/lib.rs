//! Shared contracts for the proWES gateway: run model, state machine, run
//! storage and downstream backends.
#![allow(missing_docs)]

pub mod backend;
pub mod run;
pub mod service_info;
pub mod state;
pub mod storage;
#[cfg(feature = "test-support")]
pub mod testing;
pub mod wire;

pub use backend::{Backend, BackendError, BackendRunReport, Submission};
pub use run::{now_millis, null_as_default, Attachment, BackendKind, Log, Run, RunRequest};
pub use service_info::{DefaultWorkflowEngineParameter, ServiceInfo, WorkflowTypeVersion};
pub use state::State;
pub use storage::{
    Committed, RunHead, RunListPage, RunListQuery, RunPatch, RunReader, RunStore, RunStoreError,
    RunWriter, Version, VersionPrecondition,
};
pub use wire::{ErrorResponse, RunId, RunListResponse, RunLog, RunStatus};
