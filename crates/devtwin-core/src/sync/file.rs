// # File Sync Store
//
// File-based implementation of SyncStore with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: write-then-rename
// - Automatic backup: the previous file is kept as `.backup`
// - Recovery: falls back to the backup if the main file does not parse
//
// Losing records is safe (the next reconcile replays), keeping a version
// the edge never applied is not. Every accepted change is therefore
// persisted before `compare_and_set` returns.
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "records": [
//     {
//       "key": {
//         "target": "edge-a",
//         "scope": {"kind": "namespaced", "namespace": "default"},
//         "object_type": "configmap",
//         "object_name": "settings"
//       },
//       "resource_version": 42,
//       "last_updated": "2026-01-09T12:00:00Z"
//     }
//   ]
// }
// ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::memory::{apply_version, records_for_target};
use crate::Error;
use crate::config::SyncStoreConfig;
use crate::traits::sync_store::{ApplyOutcome, ObjectKey, SyncRecord, SyncStore, SyncStoreFactory};

/// Sync file format version
const SYNC_FILE_VERSION: &str = "1.0";

/// File-based sync store with crash recovery
#[derive(Debug)]
pub struct FileSyncStore {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
}

#[derive(Debug)]
struct FileState {
    records: HashMap<ObjectKey, SyncRecord>,
    dirty: bool,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SyncFileFormat {
    version: String,
    records: Vec<SyncRecord>,
}

impl FileSyncStore {
    /// Create or load a file sync store
    ///
    /// Creates parent directories, loads the existing file and falls back to
    /// the backup (or an empty store) when the file is corrupt.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to create sync directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let records = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(FileState {
                records,
                dirty: false,
            })),
        })
    }

    async fn load_with_recovery(path: &Path) -> Result<HashMap<ObjectKey, SyncRecord>, Error> {
        let err = match Self::load(path).await {
            Ok(records) => {
                tracing::debug!("Loaded {} sync records from {}", records.len(), path.display());
                return Ok(records);
            }
            Err(e @ Error::Json(_)) => e,
            Err(e) => return Err(e),
        };

        tracing::warn!("Sync file appears corrupted: {}. Attempting recovery from backup.", err);

        let backup_path = Self::backup_path(path);
        if !backup_path.exists() {
            tracing::warn!("No backup file found. Starting with empty sync state.");
            return Ok(HashMap::new());
        }

        match Self::load(&backup_path).await {
            Ok(records) => {
                tracing::info!("Recovered {} sync records from backup", records.len());
                if let Err(restore_err) = fs::copy(&backup_path, path).await {
                    tracing::error!("Failed to restore sync file from backup: {}", restore_err);
                }
                Ok(records)
            }
            Err(backup_err) => {
                tracing::error!(
                    "Backup also corrupted: {}. Starting with empty sync state.",
                    backup_err
                );
                Ok(HashMap::new())
            }
        }
    }

    /// Parse failures surface as `Error::Json`, everything else as `SyncStore`
    async fn load(path: &Path) -> Result<HashMap<ObjectKey, SyncRecord>, Error> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::sync_store(format!("Failed to read sync file {}: {}", path.display(), e))
        })?;
        let file: SyncFileFormat = serde_json::from_str(&content)?;

        if file.version != SYNC_FILE_VERSION {
            tracing::warn!(
                "Sync file version mismatch: expected {}, got {}. Attempting to load anyway.",
                SYNC_FILE_VERSION,
                file.version
            );
        }

        Ok(file
            .records
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect())
    }

    /// Write the state atomically; the caller holds the write lock
    async fn persist(&self, state: &mut FileState) -> Result<(), Error> {
        let mut records: Vec<SyncRecord> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        let file = SyncFileFormat {
            version: SYNC_FILE_VERSION.to_string(),
            records,
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::sync_store(format!("Failed to serialize sync state: {}", e)))?;

        let temp_path = self.temp_path();
        {
            let mut temp = fs::File::create(&temp_path).await.map_err(|e| {
                Error::sync_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            temp.write_all(json.as_bytes()).await.map_err(|e| {
                Error::sync_store(format!(
                    "Failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            temp.sync_all().await.map_err(|e| {
                Error::sync_store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await {
                tracing::warn!("Failed to create sync backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::sync_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        state.dirty = false;
        tracing::trace!("Sync state written to {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl SyncStore for FileSyncStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<SyncRecord>, Error> {
        Ok(self.state.read().await.records.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &ObjectKey,
        resource_version: u64,
    ) -> Result<ApplyOutcome, Error> {
        let mut guard = self.state.write().await;
        let outcome = apply_version(&mut guard.records, key, resource_version);
        if outcome.accepted() {
            guard.dirty = true;
            self.persist(&mut guard).await?;
        }
        Ok(outcome)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, Error> {
        let mut guard = self.state.write().await;
        if guard.records.remove(key).is_none() {
            return Ok(false);
        }
        guard.dirty = true;
        self.persist(&mut guard).await?;
        Ok(true)
    }

    async fn list_for_target(&self, target: &str) -> Result<Vec<SyncRecord>, Error> {
        let guard = self.state.read().await;
        Ok(records_for_target(&guard.records, target))
    }

    async fn flush(&self) -> Result<(), Error> {
        let mut guard = self.state.write().await;
        if guard.dirty {
            self.persist(&mut guard).await
        } else {
            Ok(())
        }
    }
}

/// Factory registered as `file`
pub struct FileSyncStoreFactory;

#[async_trait]
impl SyncStoreFactory for FileSyncStoreFactory {
    async fn create(&self, config: &serde_json::Value) -> Result<Box<dyn SyncStore>, Error> {
        match serde_json::from_value::<SyncStoreConfig>(config.clone())? {
            SyncStoreConfig::File { path } => Ok(Box::new(FileSyncStore::new(path).await?)),
            other => Err(Error::config(format!(
                "file sync store cannot be built from '{}' config",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::cluster("edge-a", "east", "crd", name)
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");

        let store = FileSyncStore::new(&path).await.unwrap();
        store.compare_and_set(&key("widgets"), 7).await.unwrap();
        assert!(path.exists());

        let reopened = FileSyncStore::new(&path).await.unwrap();
        let record = reopened.get(&key("widgets")).await.unwrap().unwrap();
        assert_eq!(record.resource_version, 7);
        assert_eq!(
            reopened.compare_and_set(&key("widgets"), 7).await.unwrap(),
            ApplyOutcome::Conflict { stored: 7 }
        );
    }

    #[tokio::test]
    async fn test_file_store_corruption_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");

        let store = FileSyncStore::new(&path).await.unwrap();
        store.compare_and_set(&key("widgets"), 1).await.unwrap();
        // Second write creates the backup holding version 1
        store.compare_and_set(&key("widgets"), 2).await.unwrap();
        assert!(FileSyncStore::backup_path(&path).exists());

        fs::write(&path, b"corrupted json data").await.unwrap();

        let recovered = FileSyncStore::new(&path).await.unwrap();
        let record = recovered.get(&key("widgets")).await.unwrap().unwrap();
        assert_eq!(record.resource_version, 1);
    }

    #[tokio::test]
    async fn test_conflict_does_not_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");

        let store = FileSyncStore::new(&path).await.unwrap();
        store.compare_and_set(&key("widgets"), 5).await.unwrap();
        let before = fs::read_to_string(&path).await.unwrap();

        store.compare_and_set(&key("widgets"), 4).await.unwrap();
        let after = fs::read_to_string(&path).await.unwrap();
        assert_eq!(before, after);
        assert!(!FileSyncStore::backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_factory_rejects_memory_config() {
        let config = serde_json::to_value(SyncStoreConfig::Memory).unwrap();
        let err = FileSyncStoreFactory.create(&config).await.err().unwrap();
        assert!(err.is_config());
    }
}
