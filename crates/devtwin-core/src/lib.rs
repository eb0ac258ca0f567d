// # devtwin-core
//
// Core library for device twin reconciliation and reliable object sync.
//
// ## Architecture Overview
//
// - **ModelRegistry**: Immutable property schemas per device model
// - **VisitorResolver**: Maps each device property to one protocol visitor
// - **ProtocolCodec**: Stateless decode/encode per protocol variant
// - **TwinReconciler**: One task per (device, property) converging desired
//   and reported state
// - **ObjectSyncTracker**: Monotonic per-object resource versions for
//   idempotent, reorder-tolerant delivery to edge targets
// - **PluginRegistry**: Customized protocol codecs and sync store backends
//
// ## Design Principles
//
// 1. **Library-First**: No connection management; the transport is a trait
// 2. **Fail Closed**: Anything that does not resolve at admission never runs
// 3. **Isolation**: A failing property never affects another one

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod registry;
pub mod sync;
pub mod traits;
pub mod twin;

// Re-export core types for convenience
pub use codec::{CodecFactory, ProtocolCodec};
pub use config::{CoreConfig, ReconcilerConfig, SyncConfig, SyncStoreConfig};
pub use device::{Device, PropertyVisitor, ProtocolConfig, VisitorConfig, VisitorResolver};
pub use error::{Error, Result};
pub use model::{DeviceModel, ModelRegistry, PropertyDefinition, PropertyValue, SemanticType};
pub use registry::PluginRegistry;
pub use sync::{FileSyncStore, MemorySyncStore, ObjectSyncTracker};
pub use traits::{ObjectSource, SyncStore, Transport};
pub use twin::{TwinEvent, TwinReconciler};
