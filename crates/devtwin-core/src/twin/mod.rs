//! Device twins
//!
//! Each property of an admitted device carries a desired and a reported
//! value. The [`TwinReconciler`] drives one task per property that collects
//! the reported value, writes the desired one back when they differ, and
//! publishes every transition on a status stream.
//!
//! ## State machine
//!
//! ```text
//!   Unset ──set_desired──▶ Desired ──collect──▶ Reported ──collect (equal)──▶ Synced
//!     │                                           ▲   │
//!     └────────────────collect────────────────────┘   └─ write desired, await next collect
//!
//!   any collecting/writing state ──retries exhausted──▶ Degraded ──collect ok──▶ Reported/Synced
//! ```

pub mod property;
pub mod reconciler;

pub use property::PropertyTwin;
pub use reconciler::TwinReconciler;

use serde::{Deserialize, Serialize};

use crate::model::SemanticType;

/// Metadata attached to a twin value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinMetadata {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub value_type: SemanticType,
}

/// A canonical string value with its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinValue {
    pub value: String,
    pub metadata: TwinMetadata,
}

impl TwinValue {
    pub(crate) fn now(value: String, value_type: SemanticType) -> Self {
        Self {
            value,
            metadata: TwinMetadata {
                timestamp: chrono::Utc::now(),
                value_type,
            },
        }
    }
}

/// Desired and reported value of one property
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinProperty {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<TwinValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<TwinValue>,
}

/// Reconciliation state of one property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwinState {
    Unset,
    Desired,
    Reported,
    Synced,
    Degraded,
}

/// Health snapshot of one property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyStatus {
    pub state: TwinState,
    /// Human-readable cause while degraded
    pub cause: Option<String>,
    /// A write was issued and the next collection has not confirmed it yet
    pub pending_write: bool,
}

/// Status stream entry
#[derive(Debug, Clone, PartialEq)]
pub enum TwinEvent {
    /// A desired value was accepted (canonical form)
    DesiredAccepted {
        device_id: String,
        property_name: String,
        value: String,
    },

    /// A value was collected or received
    Reported {
        device_id: String,
        property_name: String,
        value: String,
    },

    /// Desired and reported agree
    Synced {
        device_id: String,
        property_name: String,
        value: String,
    },

    /// The desired value was written to the device
    WriteIssued {
        device_id: String,
        property_name: String,
        value: String,
    },

    /// The property stopped converging
    Degraded {
        device_id: String,
        property_name: String,
        cause: String,
    },

    /// Periodic upstream snapshot
    ReportPushed {
        device_id: String,
        property_name: String,
        twin: TwinProperty,
    },

    /// The task is waiting for the transport to come back
    Paused {
        device_id: String,
        property_name: String,
    },

    /// The transport came back
    Resumed {
        device_id: String,
        property_name: String,
    },
}

impl TwinEvent {
    pub fn device_id(&self) -> &str {
        match self {
            TwinEvent::DesiredAccepted { device_id, .. }
            | TwinEvent::Reported { device_id, .. }
            | TwinEvent::Synced { device_id, .. }
            | TwinEvent::WriteIssued { device_id, .. }
            | TwinEvent::Degraded { device_id, .. }
            | TwinEvent::ReportPushed { device_id, .. }
            | TwinEvent::Paused { device_id, .. }
            | TwinEvent::Resumed { device_id, .. } => device_id,
        }
    }

    pub fn property_name(&self) -> &str {
        match self {
            TwinEvent::DesiredAccepted { property_name, .. }
            | TwinEvent::Reported { property_name, .. }
            | TwinEvent::Synced { property_name, .. }
            | TwinEvent::WriteIssued { property_name, .. }
            | TwinEvent::Degraded { property_name, .. }
            | TwinEvent::ReportPushed { property_name, .. }
            | TwinEvent::Paused { property_name, .. }
            | TwinEvent::Resumed { property_name, .. } => property_name,
        }
    }
}
