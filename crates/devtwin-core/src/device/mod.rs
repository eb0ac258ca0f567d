//! Device and property visitor specifications
//!
//! A [`Device`] names its model, carries one protocol configuration and an
//! ordered list of [`PropertyVisitor`]s. Both the protocol and each visitor
//! are tagged variants: the shape of the parameters is fixed by the variant,
//! and [`resolver::VisitorResolver`] checks the combination at admission.

pub mod resolver;

pub use resolver::{ResolvedDevice, ResolvedProperty, VisitorResolver};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Protocol family of a device or visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Bluetooth,
    Modbus,
    Opcua,
    Customized,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bluetooth => "bluetooth",
            Self::Modbus => "modbus",
            Self::Opcua => "opcua",
            Self::Customized => "customized",
        };
        f.write_str(name)
    }
}

/// A managed device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Unique device ID
    pub id: String,

    /// Name of the referenced device model
    pub model: String,

    /// Protocol configuration
    pub protocol: ProtocolConfig,

    /// Node placement selector (label -> value)
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Ordered property visitors
    #[serde(default)]
    pub property_visitors: Vec<PropertyVisitor>,
}

impl Device {
    /// Create a device with no visitors
    pub fn new(id: impl Into<String>, model: impl Into<String>, protocol: ProtocolConfig) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            protocol,
            node_selector: BTreeMap::new(),
            property_visitors: Vec::new(),
        }
    }

    /// Append a property visitor
    pub fn with_visitor(mut self, visitor: PropertyVisitor) -> Self {
        self.property_visitors.push(visitor);
        self
    }

    /// Add a node selector label
    pub fn with_node_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_selector.insert(key.into(), value.into());
        self
    }

    /// Structural validation that needs no model lookup
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::config("device id cannot be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(Error::config(format!("device '{}' has no model", self.id)));
        }
        self.protocol.validate()
    }
}

/// Device-level protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolConfig {
    Bluetooth(BluetoothProtocol),
    Modbus(ModbusProtocol),
    Opcua(OpcuaProtocol),
    #[serde(rename = "customizedProtocol")]
    Customized(CustomizedProtocol),
}

impl ProtocolConfig {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Bluetooth(_) => ProtocolKind::Bluetooth,
            Self::Modbus(_) => ProtocolKind::Modbus,
            Self::Opcua(_) => ProtocolKind::Opcua,
            Self::Customized(_) => ProtocolKind::Customized,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Bluetooth(p) => {
                if p.mac_address.as_deref().is_none_or(|m| m.trim().is_empty()) {
                    return Err(Error::config("bluetooth protocol requires macAddress"));
                }
            }
            Self::Modbus(p) => {
                if p.slave_id.is_none() {
                    return Err(Error::config("modbus protocol requires slaveID"));
                }
            }
            Self::Opcua(p) => {
                if p.url.as_deref().is_none_or(|u| u.trim().is_empty()) {
                    return Err(Error::config("opcua protocol requires url"));
                }
            }
            Self::Customized(p) => {
                if p.protocol_name.trim().is_empty() {
                    return Err(Error::config("customized protocol requires protocolName"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BluetoothProtocol {
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModbusProtocol {
    #[serde(rename = "slaveID")]
    pub slave_id: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpcuaProtocol {
    /// Server endpoint, e.g. `opc.tcp://10.0.0.7:4840`
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomizedProtocol {
    /// Name the codec implementation is registered under
    pub protocol_name: String,
    /// Opaque configuration handed to the codec factory
    #[serde(default)]
    pub config_data: serde_json::Value,
}

/// How one property is read from and written to the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyVisitor {
    /// Name of the model property this visitor serves
    pub property_name: String,

    /// Collection interval in milliseconds
    #[serde(default, rename = "collectCycle", skip_serializing_if = "Option::is_none")]
    pub collect_cycle_ms: Option<u64>,

    /// Upstream report interval in milliseconds
    #[serde(default, rename = "reportCycle", skip_serializing_if = "Option::is_none")]
    pub report_cycle_ms: Option<u64>,

    /// Retries after a failed collection or write before the property degrades
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_retry_times: Option<u32>,

    /// Protocol-specific parameters
    pub visitor: VisitorConfig,
}

impl PropertyVisitor {
    pub fn new(property_name: impl Into<String>, visitor: VisitorConfig) -> Self {
        Self {
            property_name: property_name.into(),
            collect_cycle_ms: None,
            report_cycle_ms: None,
            collect_retry_times: None,
            visitor,
        }
    }

    pub fn with_collect_cycle(mut self, cycle: Duration) -> Self {
        self.collect_cycle_ms = Some(cycle.as_millis() as u64);
        self
    }

    pub fn with_report_cycle(mut self, cycle: Duration) -> Self {
        self.report_cycle_ms = Some(cycle.as_millis() as u64);
        self
    }

    pub fn with_retry_times(mut self, retries: u32) -> Self {
        self.collect_retry_times = Some(retries);
        self
    }

    fn validate_cycles(&self) -> Result<()> {
        if self.collect_cycle_ms == Some(0) {
            return Err(Error::config(format!(
                "property '{}' has a zero collectCycle",
                self.property_name
            )));
        }
        if self.report_cycle_ms == Some(0) {
            return Err(Error::config(format!(
                "property '{}' has a zero reportCycle",
                self.property_name
            )));
        }
        Ok(())
    }
}

/// Protocol-specific visitor parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VisitorConfig {
    Bluetooth(BluetoothVisitor),
    Modbus(ModbusVisitor),
    Opcua(OpcuaVisitor),
    #[serde(rename = "customizedProtocol")]
    Customized(CustomizedVisitor),
}

impl VisitorConfig {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Bluetooth(_) => ProtocolKind::Bluetooth,
            Self::Modbus(_) => ProtocolKind::Modbus,
            Self::Opcua(_) => ProtocolKind::Opcua,
            Self::Customized(_) => ProtocolKind::Customized,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BluetoothVisitor {
    /// GATT characteristic carrying the property
    #[serde(rename = "characteristicUUID")]
    pub characteristic_uuid: Option<String>,

    /// Token -> bytes written for that token
    #[serde(default)]
    pub data_write: BTreeMap<String, Vec<u8>>,

    /// How to turn the characteristic bytes into a value
    #[serde(default)]
    pub data_converter: BluetoothDataConverter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BluetoothDataConverter {
    pub start_index: Option<usize>,
    pub end_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_left: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_right: Option<u32>,
    /// Applied strictly in order
    #[serde(default)]
    pub order_of_operations: Vec<BluetoothOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BluetoothOperation {
    pub operation_type: ArithmeticOperation,
    pub operation_value: f64,
}

impl BluetoothOperation {
    pub fn new(operation_type: ArithmeticOperation, operation_value: f64) -> Self {
        Self {
            operation_type,
            operation_value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModbusRegisterKind {
    CoilRegister,
    DiscreteInputRegister,
    HoldingRegister,
    InputRegister,
}

impl ModbusRegisterKind {
    /// Coils and discrete inputs are bit-addressed
    pub fn is_bit(&self) -> bool {
        matches!(self, Self::CoilRegister | Self::DiscreteInputRegister)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Self::CoilRegister | Self::HoldingRegister)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusVisitor {
    pub register: Option<ModbusRegisterKind>,
    pub offset: Option<u16>,
    pub limit: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default)]
    pub is_swap: bool,
    #[serde(default)]
    pub is_register_swap: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpcuaVisitor {
    #[serde(rename = "nodeID")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browse_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomizedVisitor {
    /// Must match the device's protocol name when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_name: Option<String>,
    #[serde(default)]
    pub config_data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_deserializes_wire_names() {
        let json = serde_json::json!({
            "id": "pump-7",
            "model": "pump",
            "protocol": {"modbus": {"slaveID": 3}},
            "nodeSelector": {"edge": "plant-a"},
            "propertyVisitors": [{
                "propertyName": "pressure",
                "collectCycle": 500,
                "collectRetryTimes": 2,
                "visitor": {"modbus": {
                    "register": "HoldingRegister",
                    "offset": 10,
                    "limit": 2,
                    "isRegisterSwap": true
                }}
            }, {
                "propertyName": "mode",
                "visitor": {"customizedProtocol": {"configData": {"reg": "M1"}}}
            }]
        });
        let device: Device = serde_json::from_value(json).unwrap();
        assert_eq!(device.protocol.kind(), ProtocolKind::Modbus);
        let pressure = &device.property_visitors[0];
        assert_eq!(pressure.collect_cycle_ms, Some(500));
        match &pressure.visitor {
            VisitorConfig::Modbus(v) => {
                assert_eq!(v.register, Some(ModbusRegisterKind::HoldingRegister));
                assert!(v.is_register_swap);
                assert!(!v.is_swap);
            }
            other => panic!("unexpected visitor {:?}", other),
        }
        assert_eq!(device.property_visitors[1].visitor.kind(), ProtocolKind::Customized);
    }

    #[test]
    fn test_protocol_required_fields() {
        let device = Device::new("d", "m", ProtocolConfig::Modbus(ModbusProtocol::default()));
        assert!(device.validate().unwrap_err().is_config());

        let device = Device::new(
            "d",
            "m",
            ProtocolConfig::Opcua(OpcuaProtocol {
                url: Some("opc.tcp://plc:4840".to_string()),
                ..Default::default()
            }),
        );
        assert!(device.validate().is_ok());
    }
}
