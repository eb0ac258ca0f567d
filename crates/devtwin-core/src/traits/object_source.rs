// # Object Source Trait
//
// Read side of the persistence/API boundary: the live objects that should
// exist on an edge target right now, each with its current resource version.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::sync_store::ObjectKey;

/// An upstream object that must be present on an edge target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveObject {
    pub key: ObjectKey,
    pub resource_version: u64,
    /// Object body forwarded to the edge on replay
    pub payload: serde_json::Value,
}

impl LiveObject {
    pub fn new(key: ObjectKey, resource_version: u64, payload: serde_json::Value) -> Self {
        Self {
            key,
            resource_version,
            payload,
        }
    }
}

/// Lists live objects per edge target
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Every live object currently dispatched to `target`
    async fn list_for_target(&self, target: &str) -> Result<Vec<LiveObject>, crate::Error>;
}
