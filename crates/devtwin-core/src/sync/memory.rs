// # Memory Sync Store
//
// In-memory implementation of SyncStore.
//
// ## Crash Behavior
//
// - All records are lost on restart
// - The first reconcile after a restart replays every live object to every
//   edge; edges deduplicate by resource version, so this is safe but noisy

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::sync_store::{ApplyOutcome, ObjectKey, SyncRecord, SyncStore, SyncStoreFactory};

/// In-memory sync store
///
/// Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemorySyncStore {
    inner: Arc<RwLock<HashMap<ObjectKey, SyncRecord>>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Apply a compare-and-set to a record map
///
/// Shared by the memory and file stores; callers hold the write lock.
pub(crate) fn apply_version(
    records: &mut HashMap<ObjectKey, SyncRecord>,
    key: &ObjectKey,
    resource_version: u64,
) -> ApplyOutcome {
    match records.get_mut(key) {
        None => {
            records.insert(key.clone(), SyncRecord::new(key.clone(), resource_version));
            ApplyOutcome::Created
        }
        Some(record) if resource_version > record.resource_version => {
            let previous = record.resource_version;
            record.resource_version = resource_version;
            record.last_updated = chrono::Utc::now();
            ApplyOutcome::Advanced { previous }
        }
        Some(record) => ApplyOutcome::Conflict {
            stored: record.resource_version,
        },
    }
}

pub(crate) fn records_for_target(
    records: &HashMap<ObjectKey, SyncRecord>,
    target: &str,
) -> Vec<SyncRecord> {
    let mut matching: Vec<SyncRecord> = records
        .values()
        .filter(|record| record.key.target == target)
        .cloned()
        .collect();
    matching.sort_by(|a, b| a.key.cmp(&b.key));
    matching
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<SyncRecord>, Error> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &ObjectKey,
        resource_version: u64,
    ) -> Result<ApplyOutcome, Error> {
        let mut guard = self.inner.write().await;
        Ok(apply_version(&mut guard, key, resource_version))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, Error> {
        Ok(self.inner.write().await.remove(key).is_some())
    }

    async fn list_for_target(&self, target: &str) -> Result<Vec<SyncRecord>, Error> {
        let guard = self.inner.read().await;
        Ok(records_for_target(&guard, target))
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Factory registered as `memory`
pub struct MemorySyncStoreFactory;

#[async_trait]
impl SyncStoreFactory for MemorySyncStoreFactory {
    async fn create(&self, _config: &serde_json::Value) -> Result<Box<dyn SyncStore>, Error> {
        Ok(Box::new(MemorySyncStore::new()))
    }
}
