//! Object sync tracker
//!
//! Guarantees that every upstream object mutation eventually reaches its
//! edge target and is applied there at most once per resource version,
//! without relying on in-order or exactly-once delivery.
//!
//! ## Flow
//!
//! ```text
//!  upstream change ─▶ SyncMessage::Upsert ─▶ edge ─▶ SyncAck::Applied ─▶ record_applied
//!
//!  edge reconnect ─▶ reconcile_edge
//!                      ├─ live object, record absent/older ─▶ Upsert (replay)
//!                      └─ record, no live object ──────────▶ Delete (repeated)
//!
//!  edge ─▶ SyncAck::Removed ─▶ record dropped
//! ```
//!
//! Records change only on acknowledgements, never when a message is sent:
//! a lost upsert leaves the old record and the next reconcile replays it,
//! and a lost delete leaves the record so the next reconcile deletes again.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::traits::{ApplyOutcome, LiveObject, ObjectKey, ObjectSource, SyncStore, Transport};

/// Message sent to an edge target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Create or replace the object at `resource_version`
    Upsert {
        key: ObjectKey,
        resource_version: u64,
        payload: serde_json::Value,
    },
    /// Remove the object
    Delete { key: ObjectKey },
}

impl SyncMessage {
    pub fn key(&self) -> &ObjectKey {
        match self {
            SyncMessage::Upsert { key, .. } | SyncMessage::Delete { key } => key,
        }
    }

    /// JSON wire form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl From<&LiveObject> for SyncMessage {
    fn from(object: &LiveObject) -> Self {
        SyncMessage::Upsert {
            key: object.key.clone(),
            resource_version: object.resource_version,
            payload: object.payload.clone(),
        }
    }
}

/// Acknowledgement received from an edge target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncAck {
    /// The edge applied the object at `resource_version`
    Applied {
        key: ObjectKey,
        resource_version: u64,
    },
    /// The edge removed the object
    Removed { key: ObjectKey },
}

/// Outcome of one reconnect reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Upserts sent for absent or stale records
    pub replayed: usize,
    /// Deletes sent for vanished objects; records stay until `SyncAck::Removed`
    pub deleted: usize,
    /// Messages the transport failed to deliver
    pub failed: usize,
    /// Live objects whose record was already current
    pub up_to_date: usize,
}

/// Tracks the resource version each edge target has applied per object
#[derive(Clone)]
pub struct ObjectSyncTracker {
    store: Arc<dyn SyncStore>,
}

impl ObjectSyncTracker {
    pub fn new(store: Box<dyn SyncStore>) -> Self {
        Self {
            store: Arc::from(store),
        }
    }

    /// Record that `key` was applied at `resource_version`
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: The record was created or advanced
    /// - `Ok(false)`: Stale or duplicate version; nothing changed
    pub async fn record_applied(&self, key: &ObjectKey, resource_version: u64) -> Result<bool> {
        match self.store.compare_and_set(key, resource_version).await? {
            ApplyOutcome::Created => {
                debug!("Sync record created: {} @ {}", key, resource_version);
                Ok(true)
            }
            ApplyOutcome::Advanced { previous } => {
                debug!("Sync record advanced: {} {} -> {}", key, previous, resource_version);
                Ok(true)
            }
            ApplyOutcome::Conflict { stored } => {
                debug!(
                    "Dropping stale sync version for {}: {} <= stored {}",
                    key, resource_version, stored
                );
                Ok(false)
            }
        }
    }

    /// Whether the edge must be sent `key` at `current_resource_version`
    pub async fn needs_replay(&self, key: &ObjectKey, current_resource_version: u64) -> Result<bool> {
        Ok(match self.store.get(key).await? {
            Some(record) => record.resource_version < current_resource_version,
            None => true,
        })
    }

    /// Drop the record for `key`; `true` if there was one
    pub async fn forget(&self, key: &ObjectKey) -> Result<bool> {
        let removed = self.store.delete(key).await?;
        if removed {
            debug!("Sync record forgotten: {}", key);
        }
        Ok(removed)
    }

    /// Apply an acknowledgement from an edge
    ///
    /// Returns whether the store changed.
    pub async fn acknowledge(&self, ack: &SyncAck) -> Result<bool> {
        match ack {
            SyncAck::Applied {
                key,
                resource_version,
            } => self.record_applied(key, *resource_version).await,
            SyncAck::Removed { key } => self.forget(key).await,
        }
    }

    /// Bring an edge target up to date after a reconnect
    ///
    /// Replays every live object whose record is absent or older, and issues
    /// a delete for every record whose object no longer exists upstream.
    /// Such records are kept until the edge answers with `SyncAck::Removed`,
    /// so every reconcile before that repeats the delete. Delivery failures
    /// are counted and left for the next reconcile; store and source
    /// failures abort.
    pub async fn reconcile_edge(
        &self,
        edge: &str,
        source: &dyn ObjectSource,
        transport: &dyn Transport,
    ) -> Result<ReplayReport> {
        let live = source.list_for_target(edge).await?;
        let records = self.store.list_for_target(edge).await?;
        let stored: HashMap<&ObjectKey, u64> = records
            .iter()
            .map(|record| (&record.key, record.resource_version))
            .collect();

        let mut report = ReplayReport::default();

        for object in &live {
            if object.key.target != edge {
                warn!("Object source returned {} for edge {}, skipping", object.key, edge);
                continue;
            }
            let current = stored.get(&object.key).copied();
            if current.is_some_and(|v| v >= object.resource_version) {
                report.up_to_date += 1;
                continue;
            }
            debug!(
                "Replaying {} @ {} (edge has {:?})",
                object.key, object.resource_version, current
            );
            match self.deliver(edge, &SyncMessage::from(object), transport).await {
                Ok(()) => report.replayed += 1,
                Err(e) => {
                    warn!("Failed to replay {}: {}", object.key, e);
                    report.failed += 1;
                }
            }
        }

        let live_keys: HashSet<&ObjectKey> = live.iter().map(|object| &object.key).collect();
        for record in &records {
            if live_keys.contains(&record.key) {
                continue;
            }
            let message = SyncMessage::Delete {
                key: record.key.clone(),
            };
            match self.deliver(edge, &message, transport).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    warn!("Failed to delete {}: {}", record.key, e);
                    report.failed += 1;
                }
            }
        }

        self.store.flush().await?;

        info!(
            "Reconciled edge {}: {} replayed, {} deleted, {} up to date, {} failed",
            edge, report.replayed, report.deleted, report.up_to_date, report.failed
        );
        Ok(report)
    }

    async fn deliver(
        &self,
        edge: &str,
        message: &SyncMessage,
        transport: &dyn Transport,
    ) -> Result<()> {
        let bytes = message.to_bytes()?;
        transport.send(edge, &bytes).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}
