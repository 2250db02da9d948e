use crate::error::AdapterError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use strata_core::{SnapshotSink, VaultError, VaultSnapshot};
use tracing::debug;

/// Writes snapshots as pretty JSON, replacing the previous file atomically.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotSink {
    path: PathBuf,
}

impl JsonFileSnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last persisted snapshot, if the file exists.
    pub async fn load(&self) -> Result<Option<VaultSnapshot>, AdapterError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AdapterError::io(&self.path, err)),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn write(&self, snapshot: &VaultSnapshot) -> Result<(), AdapterError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AdapterError::io(parent, e))?;
            }
        }
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| AdapterError::io(&tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| AdapterError::io(&self.path, e))?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotSink for JsonFileSnapshotSink {
    async fn persist(&self, snapshot: &VaultSnapshot) -> Result<(), VaultError> {
        self.write(snapshot).await?;
        debug!(path = %self.path.display(), taken_at = %snapshot.taken_at, "Snapshot persisted");
        Ok(())
    }
}
