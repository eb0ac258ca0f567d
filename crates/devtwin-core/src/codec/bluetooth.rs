// # Bluetooth Codec
//
// Reads a GATT characteristic value:
//
// 1. Slice `raw[startIndex..=endIndex]`; a reversed pair reverses the slice
// 2. Interpret the slice as a big-endian unsigned integer
// 3. Apply the arithmetic operations in the listed order
// 4. Apply `shiftLeft` / `shiftRight`
//
// Writes are a token lookup in `dataWrite`, configured independently of the
// converter. Nothing guarantees encode(decode(x)) == x.

use std::collections::BTreeMap;

use super::{ProtocolCodec, check_range, numeric_value};
use crate::device::{ArithmeticOperation, BluetoothOperation, BluetoothVisitor};
use crate::error::{Error, Result};
use crate::model::{PropertyDefinition, PropertyValue, SemanticType};

/// Widest slice that still fits a u64
const MAX_SLICE_LEN: usize = 8;

/// Shifts beyond this are configuration mistakes
const MAX_SHIFT: u32 = 63;

#[derive(Debug, Clone)]
pub struct BluetoothCodec {
    characteristic_uuid: String,
    start_index: usize,
    end_index: usize,
    operations: Vec<BluetoothOperation>,
    shift_left: Option<u32>,
    shift_right: Option<u32>,
    data_write: BTreeMap<String, Vec<u8>>,
}

impl BluetoothCodec {
    /// Validate a visitor and build its codec
    pub fn new(visitor: &BluetoothVisitor) -> Result<Self> {
        let characteristic_uuid = visitor
            .characteristic_uuid
            .as_deref()
            .map(str::trim)
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| Error::config("bluetooth visitor requires characteristicUUID"))?
            .to_string();

        let converter = &visitor.data_converter;
        let (start_index, end_index) = match (converter.start_index, converter.end_index) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return Err(Error::config(
                    "bluetooth dataConverter requires startIndex and endIndex",
                ));
            }
        };
        if start_index.abs_diff(end_index) + 1 > MAX_SLICE_LEN {
            return Err(Error::config(format!(
                "bluetooth slice [{}..={}] is wider than {} bytes",
                start_index, end_index, MAX_SLICE_LEN
            )));
        }

        for operation in &converter.order_of_operations {
            if !operation.operation_value.is_finite() {
                return Err(Error::config("bluetooth operation value must be finite"));
            }
            if operation.operation_type == ArithmeticOperation::Divide
                && operation.operation_value == 0.0
            {
                return Err(Error::config("bluetooth operation divides by zero"));
            }
        }

        for shift in [converter.shift_left, converter.shift_right].into_iter().flatten() {
            if shift > MAX_SHIFT {
                return Err(Error::config(format!("bluetooth shift {} exceeds {}", shift, MAX_SHIFT)));
            }
        }

        Ok(Self {
            characteristic_uuid,
            start_index,
            end_index,
            operations: converter.order_of_operations.clone(),
            shift_left: converter.shift_left,
            shift_right: converter.shift_right,
            data_write: visitor.data_write.clone(),
        })
    }

    pub fn characteristic_uuid(&self) -> &str {
        &self.characteristic_uuid
    }

    fn slice(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let low = self.start_index.min(self.end_index);
        let high = self.start_index.max(self.end_index);
        if high >= raw.len() {
            return Err(Error::decode(format!(
                "slice [{}..={}] exceeds {}-byte characteristic {}",
                self.start_index,
                self.end_index,
                raw.len(),
                self.characteristic_uuid
            )));
        }
        let mut slice = raw[low..=high].to_vec();
        if self.start_index > self.end_index {
            slice.reverse();
        }
        Ok(slice)
    }

    /// Steps 2-4 of the conversion, on an already extracted slice
    fn convert(&self, slice: &[u8]) -> f64 {
        let base = slice.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        let mut value = base as f64;
        for operation in &self.operations {
            value = apply(operation, value);
        }
        if let Some(bits) = self.shift_left {
            value *= 2f64.powi(bits as i32);
        }
        if let Some(bits) = self.shift_right {
            value = shift_right(value, bits);
        }
        value
    }
}

fn apply(operation: &BluetoothOperation, value: f64) -> f64 {
    let operand = operation.operation_value;
    match operation.operation_type {
        ArithmeticOperation::Add => value + operand,
        ArithmeticOperation::Subtract => value - operand,
        ArithmeticOperation::Multiply => value * operand,
        ArithmeticOperation::Divide => value / operand,
    }
}

/// Integer shift for non-negative whole values, scaling otherwise
fn shift_right(value: f64, bits: u32) -> f64 {
    if value >= 0.0 && value.fract() == 0.0 && value < u64::MAX as f64 {
        ((value as u64) >> bits) as f64
    } else {
        value / 2f64.powi(bits as i32)
    }
}

impl ProtocolCodec for BluetoothCodec {
    fn protocol(&self) -> &str {
        "bluetooth"
    }

    fn decode(&self, property: &PropertyDefinition, raw: &[u8]) -> Result<PropertyValue> {
        let slice = self.slice(raw)?;
        if property.semantic_type == SemanticType::Bytes {
            return check_range(property, PropertyValue::Bytes(slice));
        }
        numeric_value(property, self.convert(&slice))
    }

    fn encode(&self, _property: &PropertyDefinition, value: &PropertyValue) -> Result<Vec<u8>> {
        let token = value.to_string();
        if let Some(bytes) = self.data_write.get(&token) {
            return Ok(bytes.clone());
        }
        self.data_write
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(&token))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| {
                let known: Vec<_> = self.data_write.keys().map(String::as_str).collect();
                Error::encode(format!(
                    "no dataWrite entry for '{}' on {} (known: {})",
                    token,
                    self.characteristic_uuid,
                    known.join(", ")
                ))
            })
    }
}
