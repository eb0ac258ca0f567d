//! Plugin registry
//!
//! Customized protocol codecs and sync store backends are registered by
//! name at runtime instead of being hardcoded.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use devtwin_core::registry::PluginRegistry;
//!
//! let registry = PluginRegistry::with_builtin_stores();
//!
//! // Devices declaring `customizedProtocol.protocolName: "acme-serial"`
//! registry.register_codec("acme-serial", Arc::new(AcmeSerialFactory));
//!
//! let store = registry.create_sync_store(&config.sync.store).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::codec::{CodecFactory, ProtocolCodec};
use crate::config::SyncStoreConfig;
use crate::device::{CustomizedProtocol, CustomizedVisitor};
use crate::error::{Error, Result};
use crate::sync::{FileSyncStoreFactory, MemorySyncStoreFactory};
use crate::traits::{SyncStore, SyncStoreFactory};

/// Registry of plugin factories
///
/// Uses interior mutability with `RwLock`, allowing concurrent lookups
/// during admission and exclusive registration.
#[derive(Default)]
pub struct PluginRegistry {
    /// Customized protocol codec factories, by protocol name
    codecs: RwLock<HashMap<String, Arc<dyn CodecFactory>>>,

    /// Sync store factories, by store type name
    sync_stores: RwLock<HashMap<String, Arc<dyn SyncStoreFactory>>>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the `memory` and `file` sync stores registered
    pub fn with_builtin_stores() -> Self {
        let registry = Self::new();
        registry.register_sync_store("memory", Arc::new(MemorySyncStoreFactory));
        registry.register_sync_store("file", Arc::new(FileSyncStoreFactory));
        registry
    }

    /// Register a codec factory for a customized protocol
    ///
    /// Replaces any factory previously registered under the same name.
    /// Devices admitted earlier keep the codec they were built with.
    pub fn register_codec(&self, protocol_name: impl Into<String>, factory: Arc<dyn CodecFactory>) {
        let protocol_name = protocol_name.into();
        tracing::debug!("Registered codec for customized protocol {}", protocol_name);
        self.codecs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol_name, factory);
    }

    /// Register a sync store factory
    pub fn register_sync_store(&self, name: impl Into<String>, factory: Arc<dyn SyncStoreFactory>) {
        self.sync_stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), factory);
    }

    /// Build a codec for a customized protocol visitor
    ///
    /// # Returns
    ///
    /// - `Ok(codec)`: Created by the registered factory
    /// - `Err(Error::Config)`: Nothing registered under the protocol name, or
    ///   the factory rejected the configuration
    pub fn create_codec(
        &self,
        protocol: &CustomizedProtocol,
        visitor: &CustomizedVisitor,
    ) -> Result<Box<dyn ProtocolCodec>> {
        let factory = self
            .codecs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&protocol.protocol_name)
            .cloned()
            .ok_or_else(|| {
                Error::config(format!(
                    "no codec registered for customized protocol '{}'",
                    protocol.protocol_name
                ))
            })?;

        factory.create(protocol, visitor)
    }

    /// Create a sync store from configuration
    pub async fn create_sync_store(&self, config: &SyncStoreConfig) -> Result<Box<dyn SyncStore>> {
        config.validate()?;
        let store_type = config.type_name();

        // Clone the factory out so the lock is not held across the await
        let factory = self
            .sync_stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(store_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown sync store type: {}", store_type)))?;

        let config_json = serde_json::to_value(config)?;
        factory.create(&config_json).await
    }

    /// List registered customized protocol names
    pub fn list_codecs(&self) -> Vec<String> {
        let codecs = self.codecs.read().unwrap_or_else(PoisonError::into_inner);
        codecs.keys().cloned().collect()
    }

    /// List registered sync store types
    pub fn list_sync_stores(&self) -> Vec<String> {
        let stores = self.sync_stores.read().unwrap_or_else(PoisonError::into_inner);
        stores.keys().cloned().collect()
    }

    pub fn has_codec(&self, protocol_name: &str) -> bool {
        let codecs = self.codecs.read().unwrap_or_else(PoisonError::into_inner);
        codecs.contains_key(protocol_name)
    }

    pub fn has_sync_store(&self, name: &str) -> bool {
        let stores = self.sync_stores.read().unwrap_or_else(PoisonError::into_inner);
        stores.contains_key(name)
    }
}
