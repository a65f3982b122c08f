use async_trait::async_trait;
use prowes_contract::storage::{
    paginate_runs, Committed, RunHead, RunListPage, RunListQuery, RunPatch, RunReader,
    RunStoreError, RunWriter, Version, VersionPrecondition,
};
use prowes_contract::Run;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One pretty-printed JSON document per run under `base_path`.
pub struct FileStore {
    base_path: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a new file storage with the given base path.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub(super) fn run_path(&self, run_id: &str) -> Result<PathBuf, RunStoreError> {
        Self::validate_run_id(run_id)?;
        Ok(self.base_path.join(format!("{run_id}.json")))
    }

    /// Validate that a run ID is safe for use as a filename.
    /// Rejects path separators, `..`, and control characters.
    fn validate_run_id(run_id: &str) -> Result<(), RunStoreError> {
        if run_id.is_empty() {
            return Err(RunStoreError::InvalidId("run id cannot be empty".to_string()));
        }
        if run_id.contains('/')
            || run_id.contains('\\')
            || run_id.contains("..")
            || run_id.starts_with('.')
        {
            return Err(RunStoreError::InvalidId(format!(
                "run id contains invalid characters: {run_id:?}"
            )));
        }
        if run_id.chars().any(|c| c.is_control()) {
            return Err(RunStoreError::InvalidId(format!(
                "run id contains control characters: {run_id:?}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RunWriter for FileStore {
    async fn create(&self, run: &Run) -> Result<Committed, RunStoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.run_path(&run.run_id)?;
        if tokio::fs::try_exists(&path).await? {
            return Err(RunStoreError::AlreadyExists);
        }
        let head = RunHead {
            run: run.clone(),
            version: 0,
        };
        self.save_head(&head).await?;
        Ok(Committed { version: 0 })
    }

    async fn update(
        &self,
        run_id: &str,
        patch: &RunPatch,
        precondition: VersionPrecondition,
    ) -> Result<Committed, RunStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut head = self
            .load_head(run_id)
            .await?
            .ok_or_else(|| RunStoreError::NotFound(run_id.to_string()))?;

        precondition.check(head.version)?;
        patch.apply_to(&mut head.run)?;
        head.version += 1;
        self.save_head(&head).await?;
        Ok(Committed {
            version: head.version,
        })
    }
}

#[async_trait]
impl RunReader for FileStore {
    async fn load(&self, run_id: &str) -> Result<Option<RunHead>, RunStoreError> {
        self.load_head(run_id).await
    }

    async fn list_runs(&self, query: &RunListQuery) -> Result<RunListPage, RunStoreError> {
        let mut runs = Vec::new();
        if tokio::fs::try_exists(&self.base_path).await? {
            let mut entries = tokio::fs::read_dir(&self.base_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !path.extension().is_some_and(|ext| ext == "json") {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if Self::validate_run_id(id).is_err() {
                    continue;
                }
                match self.load_head(id).await {
                    Ok(Some(head)) => runs.push(head.run),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(run_id = %id, error = %e, "skipping unreadable run record");
                    }
                }
            }
        }
        paginate_runs(runs, query)
    }
}

impl FileStore {
    /// Load a run head (run + version) from file.
    async fn load_head(&self, run_id: &str) -> Result<Option<RunHead>, RunStoreError> {
        let path = self.run_path(run_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RunStoreError::Io(e)),
        };
        let versioned: VersionedRun = serde_json::from_str(&content)
            .map_err(|e| RunStoreError::Serialization(e.to_string()))?;
        let run: Run = serde_json::from_str(&content)
            .map_err(|e| RunStoreError::Serialization(e.to_string()))?;
        Ok(Some(RunHead {
            run,
            version: versioned._version.unwrap_or(0),
        }))
    }

    /// Save a run head (run + version) to file atomically.
    async fn save_head(&self, head: &RunHead) -> Result<(), RunStoreError> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        let path = self.run_path(&head.run.run_id)?;

        // Embed version into the JSON
        let mut v = serde_json::to_value(&head.run)
            .map_err(|e| RunStoreError::Serialization(e.to_string()))?;
        if let Some(obj) = v.as_object_mut() {
            obj.insert("_version".to_string(), serde_json::json!(head.version));
        }
        let content = serde_json::to_string_pretty(&v)
            .map_err(|e| RunStoreError::Serialization(e.to_string()))?;

        let tmp_path = self.base_path.join(format!(
            ".{}.{}.tmp",
            head.run.run_id,
            uuid::Uuid::new_v4().simple()
        ));

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(RunStoreError::Io(e));
        }
        Ok(())
    }
}

/// Helper for extracting the `_version` field from serialized run JSON.
#[derive(Deserialize)]
struct VersionedRun {
    #[serde(default)]
    _version: Option<Version>,
}
