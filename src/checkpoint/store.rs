use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::MigrationProgress;
use crate::error::CheckpointError;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Previously saved progress, or the zero value when nothing was saved yet.
    async fn load(&self) -> Result<MigrationProgress, CheckpointError>;

    /// Durably replace the stored progress. Called after every record.
    async fn save(&self, progress: &MigrationProgress) -> Result<(), CheckpointError>;
}

/// JSON file on local disk. Writes go to a sibling temp file that is fsynced and
/// renamed over the target, so a crash leaves either the old or the new state.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointStore for JsonFileStore {
    async fn load(&self) -> Result<MigrationProgress, CheckpointError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint yet; starting fresh");
                return Ok(MigrationProgress::default());
            }
            Err(e) => return Err(self.io_err(e)),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(MigrationProgress::default());
        }
        serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Json {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, progress: &MigrationProgress) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec_pretty(progress).map_err(|source| CheckpointError::Json {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(&body).await.map_err(|e| self.io_err(e))?;
        file.sync_all().await.map_err(|e| self.io_err(e))?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))
    }
}

/// In-memory store for tests and dry runs. Can be told to fail saves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<MigrationProgress>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(progress: MigrationProgress) -> Self {
        Self {
            state: Mutex::new(Some(progress)),
            ..Self::default()
        }
    }

    /// Last saved (or seeded) progress.
    pub fn snapshot(&self) -> Option<MigrationProgress> {
        self.state.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self) -> Result<MigrationProgress, CheckpointError> {
        Ok(self.snapshot().unwrap_or_default())
    }

    async fn save(&self, progress: &MigrationProgress) -> Result<(), CheckpointError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable("memory store set to fail".into()));
        }
        let mut guard = self
            .state
            .lock()
            .map_err(|_| CheckpointError::Unavailable("memory store poisoned".into()))?;
        *guard = Some(progress.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_zero_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nope.json"));
        assert_eq!(store.load().await.unwrap(), MigrationProgress::default());
    }

    #[tokio::test]
    async fn save_then_load_in_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state/logos.json"));
        let mut progress = MigrationProgress::default();
        progress.total_records = 7;
        progress.processed_records.mark("rec1", "Logo");
        progress.upload_timestamps.push(1_700_000_000_000);
        store.save(&progress).await.unwrap();

        let reopened = JsonFileStore::new(store.path().to_path_buf());
        assert_eq!(reopened.load().await.unwrap(), progress);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = JsonFileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Json { .. }));
    }

    #[tokio::test]
    async fn memory_store_counts_and_fails_on_demand() {
        let store = MemoryStore::new();
        store.save(&MigrationProgress::default()).await.unwrap();
        assert_eq!(store.save_count(), 1);
        store.fail_saves(true);
        assert!(store.save(&MigrationProgress::default()).await.is_err());
        assert_eq!(store.save_count(), 1);
    }
}
