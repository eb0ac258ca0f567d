//! Device models and the model registry
//!
//! A [`DeviceModel`] is the immutable schema of a device class: which
//! properties exist, their semantic type, access mode and valid range.
//! Devices reference models by name; the [`ModelRegistry`] refuses to drop
//! or redefine a model while any device still references it.

pub mod value;

pub use value::PropertyValue;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// Semantic type of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Int,
    Double,
    Float,
    String,
    Boolean,
    Bytes,
}

impl SemanticType {
    /// Whether `minimum`/`maximum` apply to this type
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::Double | Self::Float)
    }
}

/// Whether the controller may write a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// Schema of one property within a device model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    /// Property name, unique within the model
    pub name: String,

    /// Semantic type of the value
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,

    /// Access mode
    #[serde(default)]
    pub access_mode: AccessMode,

    /// Default value (string encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,

    /// Inclusive lower bound for numeric types
    #[serde(default, rename = "minimum", skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Inclusive upper bound for numeric types
    #[serde(default, rename = "maximum", skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Unit of measurement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl PropertyDefinition {
    /// Create a read-write property definition with no range
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            access_mode: AccessMode::ReadWrite,
            default_value: None,
            min: None,
            max: None,
            unit: None,
        }
    }

    /// Set the access mode
    pub fn with_access_mode(mut self, access_mode: AccessMode) -> Self {
        self.access_mode = access_mode;
        self
    }

    /// Set the inclusive numeric range
    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Set the default value
    pub fn with_default(mut self, default_value: impl Into<String>) -> Self {
        self.default_value = Some(default_value.into());
        self
    }

    /// Set the unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn is_writable(&self) -> bool {
        self.access_mode == AccessMode::ReadWrite
    }

    /// Check a typed value against the declared range
    ///
    /// Returns the human-readable violation, if any. Callers wrap it in the
    /// error kind that fits their path (decode vs. desired write).
    pub fn range_violation(&self, value: &PropertyValue) -> Option<String> {
        if !self.semantic_type.is_numeric() {
            return None;
        }
        let v = value.as_f64()?;
        if let Some(min) = self.min {
            if v < min {
                return Some(format!("{} is below minimum {} for '{}'", v, min, self.name));
            }
        }
        if let Some(max) = self.max {
            if v > max {
                return Some(format!("{} is above maximum {} for '{}'", v, max, self.name));
            }
        }
        None
    }

    /// Parse, range-check and canonicalize a string value
    ///
    /// Two values are considered equal by the reconciler iff their canonical
    /// strings are equal.
    pub fn canonicalize(&self, raw: &str) -> Result<String> {
        let value = PropertyValue::parse(self.semantic_type, raw)
            .map_err(|e| Error::config(format!("invalid value for '{}': {}", self.name, e)))?;
        if let Some(violation) = self.range_violation(&value) {
            return Err(Error::config(violation));
        }
        Ok(value.to_string())
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("property name cannot be empty"));
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(Error::config(format!(
                    "property '{}' has minimum {} greater than maximum {}",
                    self.name, min, max
                )));
            }
        }
        if let Some(default_value) = &self.default_value {
            self.canonicalize(default_value)?;
        }
        Ok(())
    }
}

/// Immutable schema of a device class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    /// Model name (the ID devices reference)
    pub name: String,

    /// Ordered property definitions
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

impl DeviceModel {
    /// Create an empty model
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    /// Append a property definition
    pub fn with_property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    /// Look up a property definition by name
    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Validate the model
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("model name cannot be empty"));
        }
        let mut seen = HashSet::new();
        for property in &self.properties {
            property.validate()?;
            if !seen.insert(property.name.as_str()) {
                return Err(Error::config(format!(
                    "model '{}' declares property '{}' more than once",
                    self.name, property.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    models: HashMap<String, Arc<DeviceModel>>,
    /// model name -> IDs of devices referencing it
    references: HashMap<String, HashSet<String>>,
}

/// Registry of device models
///
/// Reads vastly outnumber writes (every admission looks up a model), so the
/// state sits behind a single `RwLock`. Registration, binding and removal
/// take the write lock, which keeps "is it referenced?" and "drop it"
/// atomic with respect to each other.
#[derive(Default)]
pub struct ModelRegistry {
    state: RwLock<RegistryState>,
}

impl ModelRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) a device model
    ///
    /// Replacing is only allowed while no device references the model, or
    /// when the new definition is identical.
    pub fn register(&self, model: DeviceModel) -> Result<()> {
        model.validate()?;

        let mut state = self.write();
        let referenced = state
            .references
            .get(&model.name)
            .is_some_and(|devices| !devices.is_empty());
        if let Some(existing) = state.models.get(&model.name) {
            if referenced && **existing != model {
                return Err(Error::config(format!(
                    "model '{}' is referenced by devices and cannot be redefined",
                    model.name
                )));
            }
        }

        tracing::debug!("Registered device model {}", model.name);
        state.models.insert(model.name.clone(), Arc::new(model));
        Ok(())
    }

    /// Look up a model by name
    pub fn get(&self, name: &str) -> Option<Arc<DeviceModel>> {
        self.read().models.get(name).cloned()
    }

    /// Record that `device_id` references `model`
    pub fn bind(&self, model: &str, device_id: &str) -> Result<Arc<DeviceModel>> {
        let mut state = self.write();
        let found = state
            .models
            .get(model)
            .cloned()
            .ok_or_else(|| Error::config(format!("device model '{}' is not registered", model)))?;
        state
            .references
            .entry(model.to_string())
            .or_default()
            .insert(device_id.to_string());
        Ok(found)
    }

    /// Drop the reference from `device_id` to `model`
    pub fn unbind(&self, model: &str, device_id: &str) {
        let mut state = self.write();
        if let Some(devices) = state.references.get_mut(model) {
            devices.remove(device_id);
            if devices.is_empty() {
                state.references.remove(model);
            }
        }
    }

    /// Remove a model
    ///
    /// # Returns
    ///
    /// - `Ok(model)`: the removed model
    /// - `Err(Error::Config)`: devices still reference the model
    /// - `Err(Error::NotFound)`: no such model
    pub fn remove(&self, name: &str) -> Result<Arc<DeviceModel>> {
        let mut state = self.write();
        if let Some(devices) = state.references.get(name) {
            if !devices.is_empty() {
                let mut ids: Vec<_> = devices.iter().cloned().collect();
                ids.sort();
                return Err(Error::config(format!(
                    "model '{}' is still referenced by devices: {}",
                    name,
                    ids.join(", ")
                )));
            }
        }
        state
            .models
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("device model '{}'", name)))
    }

    /// List registered model names
    pub fn list(&self) -> Vec<String> {
        self.read().models.keys().cloned().collect()
    }

    /// IDs of devices referencing a model
    pub fn references(&self, name: &str) -> Vec<String> {
        self.read()
            .references
            .get(name)
            .map(|devices| devices.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thermometer() -> DeviceModel {
        DeviceModel::new("thermometer")
            .with_property(
                PropertyDefinition::new("temperature", SemanticType::Double)
                    .with_access_mode(AccessMode::ReadOnly)
                    .with_range(Some(-40.0), Some(125.0))
                    .with_unit("celsius"),
            )
            .with_property(
                PropertyDefinition::new("setpoint", SemanticType::Int)
                    .with_range(Some(0.0), Some(100.0))
                    .with_default("20"),
            )
    }

    #[test]
    fn test_duplicate_property_rejected() {
        let model = DeviceModel::new("dup")
            .with_property(PropertyDefinition::new("a", SemanticType::Int))
            .with_property(PropertyDefinition::new("a", SemanticType::String));
        assert!(model.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_default_outside_range_rejected() {
        let model = DeviceModel::new("m").with_property(
            PropertyDefinition::new("level", SemanticType::Int)
                .with_range(Some(0.0), Some(10.0))
                .with_default("11"),
        );
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_canonicalize() {
        let model = thermometer();
        let setpoint = model.property("setpoint").unwrap();
        assert_eq!(setpoint.canonicalize(" 42 ").unwrap(), "42");
        assert!(setpoint.canonicalize("101").unwrap_err().is_config());
        assert!(setpoint.canonicalize("warm").unwrap_err().is_config());
    }

    #[test]
    fn test_referenced_model_cannot_be_removed() {
        let registry = ModelRegistry::new();
        registry.register(thermometer()).unwrap();
        registry.bind("thermometer", "dev-1").unwrap();

        let err = registry.remove("thermometer").unwrap_err();
        assert!(err.is_config());
        assert!(registry.get("thermometer").is_some());

        registry.unbind("thermometer", "dev-1");
        assert!(registry.remove("thermometer").is_ok());
        assert!(registry.get("thermometer").is_none());
    }

    #[test]
    fn test_referenced_model_is_immutable() {
        let registry = ModelRegistry::new();
        registry.register(thermometer()).unwrap();
        registry.bind("thermometer", "dev-1").unwrap();

        // Identical re-registration is harmless
        assert!(registry.register(thermometer()).is_ok());

        let changed = thermometer()
            .with_property(PropertyDefinition::new("humidity", SemanticType::Double));
        assert!(registry.register(changed).unwrap_err().is_config());
    }

    #[test]
    fn test_bind_unknown_model() {
        let registry = ModelRegistry::new();
        assert!(registry.bind("ghost", "dev-1").unwrap_err().is_config());
    }

    #[test]
    fn test_model_deserializes_wire_names() {
        let json = serde_json::json!({
            "name": "switch",
            "properties": [
                {"name": "power", "type": "boolean", "accessMode": "ReadWrite"},
                {"name": "voltage", "type": "float", "accessMode": "ReadOnly",
                 "minimum": 0.0, "maximum": 250.0, "unit": "V"}
            ]
        });
        let model: DeviceModel = serde_json::from_value(json).unwrap();
        assert_eq!(model.properties.len(), 2);
        assert_eq!(model.properties[1].access_mode, AccessMode::ReadOnly);
        assert_eq!(model.properties[1].max, Some(250.0));
    }
}
