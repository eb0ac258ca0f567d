// # Visitor Resolver
//
// Admission-time check of a device against its model: every visitor must
// name a property of the model, at most once, with parameters its
// protocol's codec accepts. The output pairs each property definition with
// its visitor and a ready-to-use codec. Read-write properties cannot sit on
// read-only Modbus tables.

use std::collections::HashSet;
use std::sync::Arc;

use super::{Device, ModbusVisitor, PropertyVisitor, VisitorConfig};
use crate::codec::{ProtocolCodec, build_codec};
use crate::error::{Error, Result};
use crate::model::{DeviceModel, ModelRegistry, PropertyDefinition};
use crate::registry::PluginRegistry;

/// One property of an admitted device
#[derive(Clone)]
pub struct ResolvedProperty {
    pub definition: PropertyDefinition,
    pub visitor: PropertyVisitor,
    pub codec: Arc<dyn ProtocolCodec>,
}

impl std::fmt::Debug for ResolvedProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedProperty")
            .field("definition", &self.definition)
            .field("visitor", &self.visitor)
            .field("codec", &self.codec.protocol())
            .finish()
    }
}

/// A device whose visitors all resolved
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub device: Device,
    pub model: Arc<DeviceModel>,
    /// In visitor order
    pub properties: Vec<ResolvedProperty>,
}

impl ResolvedDevice {
    pub fn property(&self, name: &str) -> Option<&ResolvedProperty> {
        self.properties.iter().find(|p| p.definition.name == name)
    }
}

pub struct VisitorResolver<'a> {
    models: &'a ModelRegistry,
    plugins: &'a PluginRegistry,
}

impl<'a> VisitorResolver<'a> {
    pub fn new(models: &'a ModelRegistry, plugins: &'a PluginRegistry) -> Self {
        Self { models, plugins }
    }

    /// Resolve every visitor of a device
    ///
    /// Fails with `Error::Config` on the first problem; nothing is started
    /// for a device that does not resolve completely.
    pub fn resolve(&self, device: &Device) -> Result<ResolvedDevice> {
        device.validate()?;

        let model = self.models.get(&device.model).ok_or_else(|| {
            Error::config(format!(
                "device '{}' references unknown model '{}'",
                device.id, device.model
            ))
        })?;

        let mut seen = HashSet::new();
        let mut properties = Vec::with_capacity(device.property_visitors.len());

        for visitor in &device.property_visitors {
            let name = visitor.property_name.as_str();
            if !seen.insert(name) {
                return Err(Error::config(format!(
                    "device '{}' declares more than one visitor for property '{}'",
                    device.id, name
                )));
            }

            let definition = model.property(name).ok_or_else(|| {
                Error::config(format!(
                    "device '{}': property '{}' does not exist in model '{}'",
                    device.id, name, model.name
                ))
            })?;

            visitor.validate_cycles()?;

            let codec = build_codec(&device.protocol, &visitor.visitor, self.plugins)
                .map_err(|e| match e {
                    Error::Config(msg) => Error::config(format!(
                        "device '{}' property '{}': {}",
                        device.id, name, msg
                    )),
                    other => other,
                })?;

            let read_only_table = match &visitor.visitor {
                VisitorConfig::Modbus(ModbusVisitor {
                    register: Some(kind),
                    ..
                }) if !kind.is_writable() => Some(kind),
                _ => None,
            };
            if let Some(kind) = read_only_table.filter(|_| definition.is_writable()) {
                return Err(Error::config(format!(
                    "device '{}': property '{}' is read-write but {:?} cannot be written",
                    device.id, name, kind
                )));
            }

            properties.push(ResolvedProperty {
                definition: definition.clone(),
                visitor: visitor.clone(),
                codec,
            });
        }

        Ok(ResolvedDevice {
            device: device.clone(),
            model,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        BluetoothDataConverter, BluetoothProtocol, BluetoothVisitor, ModbusProtocol,
        ModbusRegisterKind, ModbusVisitor, ProtocolConfig, VisitorConfig,
    };
    use crate::model::SemanticType;

    fn registry() -> ModelRegistry {
        let registry = ModelRegistry::new();
        registry
            .register(
                DeviceModel::new("meter")
                    .with_property(PropertyDefinition::new("voltage", SemanticType::Double))
                    .with_property(PropertyDefinition::new("relay", SemanticType::Boolean)),
            )
            .unwrap();
        registry
    }

    fn holding(offset: u16) -> VisitorConfig {
        VisitorConfig::Modbus(ModbusVisitor {
            register: Some(ModbusRegisterKind::HoldingRegister),
            offset: Some(offset),
            limit: Some(1),
            ..Default::default()
        })
    }

    fn meter() -> Device {
        Device::new(
            "meter-1",
            "meter",
            ProtocolConfig::Modbus(ModbusProtocol { slave_id: Some(1) }),
        )
    }

    #[test]
    fn test_resolves_in_visitor_order() {
        let models = registry();
        let plugins = PluginRegistry::new();
        let device = meter()
            .with_visitor(PropertyVisitor::new("relay", holding(1)))
            .with_visitor(PropertyVisitor::new("voltage", holding(0)));

        let resolved = VisitorResolver::new(&models, &plugins).resolve(&device).unwrap();
        let names: Vec<_> = resolved
            .properties
            .iter()
            .map(|p| p.definition.name.as_str())
            .collect();
        assert_eq!(names, vec!["relay", "voltage"]);
        assert_eq!(resolved.property("voltage").unwrap().codec.protocol(), "modbus");
    }

    #[test]
    fn test_rejections() {
        let models = registry();
        let plugins = PluginRegistry::new();
        let resolver = VisitorResolver::new(&models, &plugins);

        let duplicate = meter()
            .with_visitor(PropertyVisitor::new("voltage", holding(0)))
            .with_visitor(PropertyVisitor::new("voltage", holding(2)));
        assert!(resolver.resolve(&duplicate).unwrap_err().is_config());

        let unknown_property = meter().with_visitor(PropertyVisitor::new("current", holding(0)));
        assert!(resolver.resolve(&unknown_property).unwrap_err().is_config());

        let zero_cycle = meter().with_visitor(
            PropertyVisitor::new("voltage", holding(0))
                .with_collect_cycle(std::time::Duration::ZERO),
        );
        assert!(resolver.resolve(&zero_cycle).unwrap_err().is_config());

        let unknown_model = Device::new(
            "meter-2",
            "ghost",
            ProtocolConfig::Modbus(ModbusProtocol { slave_id: Some(1) }),
        );
        assert!(resolver.resolve(&unknown_model).unwrap_err().is_config());
    }

    #[test]
    fn test_read_write_property_on_input_register_is_refused() {
        let models = registry();
        let plugins = PluginRegistry::new();
        let resolver = VisitorResolver::new(&models, &plugins);
        let input = |kind| {
            VisitorConfig::Modbus(ModbusVisitor {
                register: Some(kind),
                offset: Some(0),
                limit: Some(1),
                ..Default::default()
            })
        };

        let device = meter().with_visitor(PropertyVisitor::new(
            "voltage",
            input(ModbusRegisterKind::InputRegister),
        ));
        let err = resolver.resolve(&device).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("voltage"), "{}", err);

        let device = meter().with_visitor(PropertyVisitor::new(
            "relay",
            input(ModbusRegisterKind::DiscreteInputRegister),
        ));
        assert!(resolver.resolve(&device).unwrap_err().is_config());

        // Read-only properties may use either table
        let models = ModelRegistry::new();
        models
            .register(DeviceModel::new("meter").with_property(
                PropertyDefinition::new("voltage", SemanticType::Double)
                    .with_access_mode(crate::model::AccessMode::ReadOnly),
            ))
            .unwrap();
        let device = meter().with_visitor(PropertyVisitor::new(
            "voltage",
            input(ModbusRegisterKind::InputRegister),
        ));
        assert!(VisitorResolver::new(&models, &plugins).resolve(&device).is_ok());
    }

    #[test]
    fn test_missing_uuid_names_device_and_property() {
        let models = registry();
        let plugins = PluginRegistry::new();
        let device = Device::new(
            "tag-9",
            "meter",
            ProtocolConfig::Bluetooth(BluetoothProtocol {
                mac_address: Some("AA:BB:CC:DD:EE:FF".to_string()),
            }),
        )
        .with_visitor(PropertyVisitor::new(
            "voltage",
            VisitorConfig::Bluetooth(BluetoothVisitor {
                characteristic_uuid: None,
                data_write: Default::default(),
                data_converter: BluetoothDataConverter {
                    start_index: Some(0),
                    end_index: Some(1),
                    ..Default::default()
                },
            }),
        ));

        let err = VisitorResolver::new(&models, &plugins).resolve(&device).unwrap_err();
        let message = err.to_string();
        assert!(err.is_config());
        assert!(message.contains("tag-9"));
        assert!(message.contains("characteristicUUID"));
    }
}
