//! Configuration types for the device twin system
//!
//! Device, model and visitor specifications live next to their types in
//! [`crate::device`] and [`crate::model`]. This module holds the runtime
//! settings of the reconciler and the sync subsystem.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::device::PropertyVisitor;

/// Top-level core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Twin reconciler settings
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Object sync settings
    #[serde(default)]
    pub sync: SyncConfig,
}

impl CoreConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.reconciler.validate()?;
        self.sync.store.validate()
    }
}

/// Twin reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Capacity of the status event channel
    ///
    /// When full, new events are dropped (with a warning log). Twin state is
    /// never blocked on a slow consumer.
    ///
    /// Default: 1000 events
    #[serde(default = "default_status_channel_capacity")]
    pub status_channel_capacity: usize,

    /// First delay between retries, doubled after each failure (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound for the retry delay (milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Collect cycle for visitors that do not declare one (milliseconds)
    #[serde(default = "default_collect_cycle_ms")]
    pub default_collect_cycle_ms: u64,

    /// Report cycle for visitors that do not declare one (milliseconds)
    #[serde(default = "default_report_cycle_ms")]
    pub default_report_cycle_ms: u64,

    /// Retry count for visitors that do not declare `collectRetryTimes`
    #[serde(default = "default_collect_retry_times")]
    pub default_collect_retry_times: u32,

    /// How long a property may wait for the transport to come back before
    /// it is marked degraded (seconds, 0 = wait forever)
    #[serde(default)]
    pub reconnect_timeout_secs: u64,
}

impl ReconcilerConfig {
    /// Validate the reconciler configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.status_channel_capacity == 0 {
            return Err(crate::Error::config("status_channel_capacity must be > 0"));
        }
        if self.default_collect_cycle_ms == 0 || self.default_report_cycle_ms == 0 {
            return Err(crate::Error::config("default cycles must be > 0"));
        }
        if self.max_backoff_ms < self.retry_backoff_ms {
            return Err(crate::Error::config(
                "max_backoff_ms must not be smaller than retry_backoff_ms",
            ));
        }
        Ok(())
    }

    /// Effective collect cycle of a visitor
    pub fn collect_cycle(&self, visitor: &PropertyVisitor) -> Duration {
        Duration::from_millis(visitor.collect_cycle_ms.unwrap_or(self.default_collect_cycle_ms))
    }

    /// Effective report cycle of a visitor
    pub fn report_cycle(&self, visitor: &PropertyVisitor) -> Duration {
        Duration::from_millis(visitor.report_cycle_ms.unwrap_or(self.default_report_cycle_ms))
    }

    /// Effective retry count of a visitor
    pub fn retry_times(&self, visitor: &PropertyVisitor) -> u32 {
        visitor
            .collect_retry_times
            .unwrap_or(self.default_collect_retry_times)
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Reconnect timeout, `None` when waiting forever
    pub fn reconnect_timeout(&self) -> Option<Duration> {
        (self.reconnect_timeout_secs > 0).then(|| Duration::from_secs(self.reconnect_timeout_secs))
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            status_channel_capacity: default_status_channel_capacity(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            default_collect_cycle_ms: default_collect_cycle_ms(),
            default_report_cycle_ms: default_report_cycle_ms(),
            default_collect_retry_times: default_collect_retry_times(),
            reconnect_timeout_secs: 0,
        }
    }
}

fn default_status_channel_capacity() -> usize {
    1000
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_collect_cycle_ms() -> u64 {
    1000
}

fn default_report_cycle_ms() -> u64 {
    10_000
}

fn default_collect_retry_times() -> u32 {
    3
}

/// Object sync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Where sync records are kept
    #[serde(default)]
    pub store: SyncStoreConfig,
}

/// Sync store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncStoreConfig {
    /// File-based sync store
    File {
        /// Path to the sync state file
        path: String,
    },

    /// In-memory sync store (not persistent)
    #[default]
    Memory,

    /// Custom sync store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl SyncStoreConfig {
    /// Registry name of the factory that builds this store
    pub fn type_name(&self) -> &str {
        match self {
            SyncStoreConfig::File { .. } => "file",
            SyncStoreConfig::Memory => "memory",
            SyncStoreConfig::Custom { factory, .. } => factory,
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            SyncStoreConfig::File { path } => {
                if path.trim().is_empty() {
                    return Err(crate::Error::config("sync store path cannot be empty"));
                }
                Ok(())
            }
            SyncStoreConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("custom sync store factory cannot be empty"));
                }
                Ok(())
            }
            SyncStoreConfig::Memory => Ok(()),
        }
    }
}
