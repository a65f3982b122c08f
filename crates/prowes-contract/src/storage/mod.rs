//! Persistent run storage contracts.

pub mod traits;
pub mod types;

pub use traits::{RunReader, RunStore, RunWriter};
pub use types::{
    count_states, paginate_runs, Committed, RunHead, RunListPage, RunListQuery, RunPatch,
    RunStoreError, Version, VersionPrecondition,
};
