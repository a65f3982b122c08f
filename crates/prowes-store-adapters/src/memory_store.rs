use async_trait::async_trait;
use prowes_contract::storage::{
    paginate_runs, Committed, RunHead, RunListPage, RunListQuery, RunPatch, RunReader,
    RunStoreError, RunWriter, Version, VersionPrecondition,
};
use prowes_contract::Run;

struct MemoryEntry {
    run: Run,
    version: Version,
}

/// In-memory storage for testing and local development.
#[derive(Default)]
pub struct MemoryStore {
    entries: tokio::sync::RwLock<std::collections::HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    /// Create a new in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunWriter for MemoryStore {
    async fn create(&self, run: &Run) -> Result<Committed, RunStoreError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&run.run_id) {
            return Err(RunStoreError::AlreadyExists);
        }
        entries.insert(
            run.run_id.clone(),
            MemoryEntry {
                run: run.clone(),
                version: 0,
            },
        );
        Ok(Committed { version: 0 })
    }

    async fn update(
        &self,
        run_id: &str,
        patch: &RunPatch,
        precondition: VersionPrecondition,
    ) -> Result<Committed, RunStoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(run_id)
            .ok_or_else(|| RunStoreError::NotFound(run_id.to_string()))?;

        precondition.check(entry.version)?;
        patch.apply_to(&mut entry.run)?;
        entry.version += 1;
        Ok(Committed {
            version: entry.version,
        })
    }
}

#[async_trait]
impl RunReader for MemoryStore {
    async fn load(&self, run_id: &str) -> Result<Option<RunHead>, RunStoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(run_id).map(|e| RunHead {
            run: e.run.clone(),
            version: e.version,
        }))
    }

    async fn list_runs(&self, query: &RunListQuery) -> Result<RunListPage, RunStoreError> {
        let entries = self.entries.read().await;
        paginate_runs(entries.values().map(|e| e.run.clone()), query)
    }
}
