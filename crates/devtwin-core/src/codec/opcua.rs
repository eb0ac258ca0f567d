// # OPC-UA Codec
//
// The transport reads a node's value attribute and hands it over as its
// UTF-8 text rendering. Decode parses that text into the property's type;
// encode renders the canonical text back. `bytes` properties pass through
// untouched in both directions.

use super::{ProtocolCodec, check_range};
use crate::device::OpcuaVisitor;
use crate::error::{Error, Result};
use crate::model::{PropertyDefinition, PropertyValue, SemanticType};

#[derive(Debug, Clone)]
pub struct OpcuaCodec {
    node_id: String,
}

impl OpcuaCodec {
    pub fn new(visitor: &OpcuaVisitor) -> Result<Self> {
        let node_id = visitor
            .node_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::config("opcua visitor requires nodeID"))?;
        Ok(Self {
            node_id: node_id.to_string(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl ProtocolCodec for OpcuaCodec {
    fn protocol(&self) -> &str {
        "opcua"
    }

    fn decode(&self, property: &PropertyDefinition, raw: &[u8]) -> Result<PropertyValue> {
        if property.semantic_type == SemanticType::Bytes {
            return check_range(property, PropertyValue::Bytes(raw.to_vec()));
        }
        let text = std::str::from_utf8(raw).map_err(|e| {
            Error::decode(format!("node {} returned non-UTF-8 data: {}", self.node_id, e))
        })?;
        let value = PropertyValue::parse(property.semantic_type, text)?;
        check_range(property, value)
    }

    fn encode(&self, _property: &PropertyDefinition, value: &PropertyValue) -> Result<Vec<u8>> {
        match value {
            PropertyValue::Bytes(bytes) => Ok(bytes.clone()),
            other => Ok(other.to_string().into_bytes()),
        }
    }
}
