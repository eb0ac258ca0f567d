//! Protocol codec engine
//!
//! A [`ProtocolCodec`] converts between the raw bytes a device produces for
//! one property and a typed [`PropertyValue`]. Codecs are built once per
//! (device, property) at admission from the tagged visitor configuration and
//! are pure afterwards: no interior state, safe to call from any task.
//!
//! ```text
//!  ProtocolConfig ─┐
//!                  ├─ build_codec() ─▶ Arc<dyn ProtocolCodec>
//!  VisitorConfig ──┘        │
//!                           └─ Customized ─▶ PluginRegistry ─▶ CodecFactory
//! ```

pub mod bluetooth;
pub mod modbus;
pub mod opcua;

pub use bluetooth::BluetoothCodec;
pub use modbus::ModbusCodec;
pub use opcua::OpcuaCodec;

use std::sync::Arc;

use crate::device::{CustomizedProtocol, CustomizedVisitor, ProtocolConfig, VisitorConfig};
use crate::error::{Error, Result};
use crate::model::{PropertyDefinition, PropertyValue};
use crate::registry::PluginRegistry;

/// Decode/encode pair for one property's raw representation
///
/// # Contract
///
/// - Deterministic: the same bytes and property always yield the same result
/// - Stateless: implementations must not cache or mutate anything per call
/// - Fail with `Error::Decode`/`Error::Encode` for bad data and
///   `Error::Config` only for problems retrying cannot fix
pub trait ProtocolCodec: Send + Sync {
    /// Protocol name (for logging)
    fn protocol(&self) -> &str;

    /// Raw device bytes -> typed value of `property.semantic_type`
    fn decode(&self, property: &PropertyDefinition, raw: &[u8]) -> Result<PropertyValue>;

    /// Typed value -> raw bytes to write to the device
    fn encode(&self, property: &PropertyDefinition, value: &PropertyValue) -> Result<Vec<u8>>;
}

/// Builds codecs for a customized protocol
///
/// Implementations are registered in a [`PluginRegistry`] under the protocol
/// name devices declare in `customizedProtocol.protocolName`.
pub trait CodecFactory: Send + Sync {
    /// Create a codec for one property
    ///
    /// # Parameters
    ///
    /// - `protocol`: the device-level protocol block (opaque `configData`)
    /// - `visitor`: the property-level visitor block (opaque `configData`)
    fn create(
        &self,
        protocol: &CustomizedProtocol,
        visitor: &CustomizedVisitor,
    ) -> Result<Box<dyn ProtocolCodec>>;
}

/// Select and build the codec for a (protocol, visitor) pair
///
/// The device protocol and the visitor must be the same variant. Customized
/// protocols are resolved through `plugins` and fail closed when nothing is
/// registered under the protocol name.
pub fn build_codec(
    protocol: &ProtocolConfig,
    visitor: &VisitorConfig,
    plugins: &PluginRegistry,
) -> Result<Arc<dyn ProtocolCodec>> {
    match (protocol, visitor) {
        (ProtocolConfig::Bluetooth(_), VisitorConfig::Bluetooth(v)) => {
            Ok(Arc::new(BluetoothCodec::new(v)?))
        }
        (ProtocolConfig::Modbus(_), VisitorConfig::Modbus(v)) => Ok(Arc::new(ModbusCodec::new(v)?)),
        (ProtocolConfig::Opcua(_), VisitorConfig::Opcua(v)) => Ok(Arc::new(OpcuaCodec::new(v)?)),
        (ProtocolConfig::Customized(p), VisitorConfig::Customized(v)) => {
            if let Some(name) = &v.protocol_name {
                if name != &p.protocol_name {
                    return Err(Error::config(format!(
                        "visitor protocol '{}' does not match device protocol '{}'",
                        name, p.protocol_name
                    )));
                }
            }
            Ok(Arc::from(plugins.create_codec(p, v)?))
        }
        (p, v) => Err(Error::config(format!(
            "{} visitor cannot be used with a {} device",
            v.kind(),
            p.kind()
        ))),
    }
}

/// One-shot decode: build the codec for the pair and run it
pub fn decode(
    protocol: &ProtocolConfig,
    visitor: &VisitorConfig,
    plugins: &PluginRegistry,
    property: &PropertyDefinition,
    raw: &[u8],
) -> Result<PropertyValue> {
    build_codec(protocol, visitor, plugins)?.decode(property, raw)
}

/// One-shot encode: build the codec for the pair and run it
pub fn encode(
    protocol: &ProtocolConfig,
    visitor: &VisitorConfig,
    plugins: &PluginRegistry,
    property: &PropertyDefinition,
    value: &PropertyValue,
) -> Result<Vec<u8>> {
    build_codec(protocol, visitor, plugins)?.encode(property, value)
}

/// Turn a numeric codec result into a checked value of the property's type
pub(crate) fn numeric_value(property: &PropertyDefinition, value: f64) -> Result<PropertyValue> {
    let value = PropertyValue::from_number(property.semantic_type, value)?;
    check_range(property, value)
}

pub(crate) fn check_range(
    property: &PropertyDefinition,
    value: PropertyValue,
) -> Result<PropertyValue> {
    match property.range_violation(&value) {
        Some(violation) => Err(Error::decode(violation)),
        None => Ok(value),
    }
}
