// # Sync Store Trait
//
// Persistence for object sync records: the highest resource version of each
// object that an edge target is known to have applied.
//
// ## Purpose
//
// The store makes delivery idempotent and reorder-tolerant:
// - A record only ever moves forward (`compare_and_set`)
// - After a reconnect, records scoped to the edge are compared with the live
//   objects to decide what to replay and what to delete
//
// ## Implementations
//
// - Memory: tests and ephemeral controllers
// - File: JSON with atomic replace and backup recovery

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope of a synchronized object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectScope {
    /// Namespaced object (ObjectSync)
    Namespaced { namespace: String },
    /// Cluster-scoped object (ClusterObjectSync)
    Cluster { cluster: String },
}

/// Identity of one object as seen by one edge target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Edge node the object is dispatched to
    pub target: String,
    pub scope: ObjectScope,
    pub object_type: String,
    pub object_name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(
        target: impl Into<String>,
        namespace: impl Into<String>,
        object_type: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            scope: ObjectScope::Namespaced {
                namespace: namespace.into(),
            },
            object_type: object_type.into(),
            object_name: object_name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(
        target: impl Into<String>,
        cluster: impl Into<String>,
        object_type: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            scope: ObjectScope::Cluster {
                cluster: cluster.into(),
            },
            object_type: object_type.into(),
            object_name: object_name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ObjectScope::Namespaced { namespace } => write!(
                f,
                "{}/{}/{}/{}",
                self.target, namespace, self.object_type, self.object_name
            ),
            ObjectScope::Cluster { cluster } => write!(
                f,
                "{}/cluster:{}/{}/{}",
                self.target, cluster, self.object_type, self.object_name
            ),
        }
    }
}

/// Stored sync state of one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub key: ObjectKey,
    /// Highest resource version the edge has applied
    pub resource_version: u64,
    /// When the record last advanced
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

impl SyncRecord {
    pub(crate) fn new(key: ObjectKey, resource_version: u64) -> Self {
        Self {
            key,
            resource_version,
            last_updated: chrono::Utc::now(),
        }
    }
}

/// Result of a compare-and-set on a sync record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// No record existed; one was created
    Created,
    /// The record moved forward from `previous`
    Advanced { previous: u64 },
    /// Stale or duplicate version; the stored record was left untouched
    Conflict { stored: u64 },
}

impl ApplyOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, ApplyOutcome::Conflict { .. })
    }
}

/// Trait for sync store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently. `compare_and_set` must
/// be atomic per key: two concurrent calls never both observe the same
/// stored version and both write.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Get the record for a key
    async fn get(&self, key: &ObjectKey) -> Result<Option<SyncRecord>, crate::Error>;

    /// Store `resource_version` for `key` iff it is strictly greater than
    /// the stored version (or nothing is stored)
    async fn compare_and_set(
        &self,
        key: &ObjectKey,
        resource_version: u64,
    ) -> Result<ApplyOutcome, crate::Error>;

    /// Delete the record for a key
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: A record was removed
    /// - `Ok(false)`: Nothing was stored
    async fn delete(&self, key: &ObjectKey) -> Result<bool, crate::Error>;

    /// All records scoped to an edge target
    async fn list_for_target(&self, target: &str) -> Result<Vec<SyncRecord>, crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}

/// Helper trait for constructing sync stores from configuration
#[async_trait]
pub trait SyncStoreFactory: Send + Sync {
    /// Create a SyncStore instance
    ///
    /// # Parameters
    ///
    /// - `config`: The serialized [`SyncStoreConfig`](crate::config::SyncStoreConfig)
    async fn create(&self, config: &serde_json::Value)
    -> Result<Box<dyn SyncStore>, crate::Error>;
}
