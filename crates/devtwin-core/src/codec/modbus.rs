// # Modbus Codec
//
// Raw data is the response payload for `limit` consecutive items starting
// at `offset`:
//
// - Holding/input registers: 2 bytes per register, big-endian
// - Coils/discrete inputs: packed bits, least significant bit first
//
// Register decode: optional register-order swap, optional byte swap within
// each register, big-endian assembly into an unsigned integer, then
// multiply by `scale`. Encode runs the same steps backwards.

use super::{ProtocolCodec, check_range, numeric_value};
use crate::device::{ModbusRegisterKind, ModbusVisitor};
use crate::error::{Error, Result};
use crate::model::{PropertyDefinition, PropertyValue, SemanticType};

/// Registers that still assemble into a u64
const MAX_REGISTERS: u16 = 4;

/// Bits that still assemble into a u64
const MAX_BITS: u16 = 64;

/// Payload of a "write single coil" request
const COIL_ON: [u8; 2] = [0xFF, 0x00];
const COIL_OFF: [u8; 2] = [0x00, 0x00];

#[derive(Debug, Clone)]
pub struct ModbusCodec {
    register: ModbusRegisterKind,
    offset: u16,
    limit: u16,
    scale: f64,
    is_swap: bool,
    is_register_swap: bool,
}

impl ModbusCodec {
    /// Validate a visitor and build its codec
    pub fn new(visitor: &ModbusVisitor) -> Result<Self> {
        let register = visitor
            .register
            .ok_or_else(|| Error::config("modbus visitor requires register"))?;
        let offset = visitor
            .offset
            .ok_or_else(|| Error::config("modbus visitor requires offset"))?;
        let limit = visitor
            .limit
            .ok_or_else(|| Error::config("modbus visitor requires limit"))?;

        let max = if register.is_bit() { MAX_BITS } else { MAX_REGISTERS };
        if limit == 0 || limit > max {
            return Err(Error::config(format!(
                "modbus limit {} for {:?} must be between 1 and {}",
                limit, register, max
            )));
        }

        let scale = visitor.scale.unwrap_or(1.0);
        if !scale.is_finite() || scale == 0.0 {
            return Err(Error::config(format!("modbus scale {} must be finite and non-zero", scale)));
        }

        Ok(Self {
            register,
            offset,
            limit,
            scale,
            is_swap: visitor.is_swap,
            is_register_swap: visitor.is_register_swap,
        })
    }

    pub fn register(&self) -> ModbusRegisterKind {
        self.register
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn limit(&self) -> u16 {
        self.limit
    }

    /// Registers in the order they are assembled, swaps applied
    fn registers(&self, raw: &[u8]) -> Result<Vec<u16>> {
        let needed = usize::from(self.limit) * 2;
        if raw.len() < needed {
            return Err(Error::decode(format!(
                "expected {} bytes for {} registers at offset {}, got {}",
                needed,
                self.limit,
                self.offset,
                raw.len()
            )));
        }
        let mut registers: Vec<u16> = raw[..needed]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.swap(&mut registers);
        Ok(registers)
    }

    /// Both swaps are involutions, so decode and encode share them
    fn swap(&self, registers: &mut [u16]) {
        if self.is_register_swap {
            registers.reverse();
        }
        if self.is_swap {
            for register in registers.iter_mut() {
                *register = register.swap_bytes();
            }
        }
    }

    fn bits(&self, raw: &[u8]) -> Result<u64> {
        let needed = usize::from(self.limit).div_ceil(8);
        if raw.len() < needed {
            return Err(Error::decode(format!(
                "expected {} bytes for {} bits at offset {}, got {}",
                needed,
                self.limit,
                self.offset,
                raw.len()
            )));
        }
        let value = (0..usize::from(self.limit))
            .filter(|bit| raw[bit / 8] & (1 << (bit % 8)) != 0)
            .fold(0u64, |acc, bit| acc | (1u64 << bit));
        Ok(value)
    }

    fn register_bits(&self) -> u32 {
        u32::from(self.limit) * 16
    }

    /// Scaled value -> unsigned register content, two's complement for negatives
    fn to_raw_integer(&self, value: f64) -> Result<u64> {
        let unscaled = (value / self.scale).round();
        let bits = self.register_bits();
        let (low, high) = if bits >= 64 {
            (i64::MIN as f64, u64::MAX as f64)
        } else {
            (-(2f64.powi(bits as i32 - 1)), 2f64.powi(bits as i32) - 1.0)
        };
        if unscaled < low || unscaled > high {
            return Err(Error::encode(format!(
                "{} does not fit in {} register(s)",
                value, self.limit
            )));
        }
        let raw = if unscaled < 0.0 {
            let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
            (unscaled as i64 as u64) & mask
        } else {
            unscaled as u64
        };
        Ok(raw)
    }

    fn encode_registers(&self, value: &PropertyValue) -> Result<Vec<u8>> {
        let mut registers: Vec<u16> = match value {
            PropertyValue::Bytes(bytes) => {
                if bytes.len() != usize::from(self.limit) * 2 {
                    return Err(Error::encode(format!(
                        "{} bytes cannot fill {} registers",
                        bytes.len(),
                        self.limit
                    )));
                }
                bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect()
            }
            other => {
                let number = other
                    .as_f64()
                    .ok_or_else(|| Error::encode(format!("'{}' is not numeric", other)))?;
                let raw = self.to_raw_integer(number)?;
                (0..self.limit)
                    .rev()
                    .map(|i| ((raw >> (16 * u32::from(i))) & 0xFFFF) as u16)
                    .collect()
            }
        };
        self.swap(&mut registers);
        Ok(registers.iter().flat_map(|r| r.to_be_bytes()).collect())
    }

    fn encode_coils(&self, value: &PropertyValue) -> Result<Vec<u8>> {
        let number = value
            .as_f64()
            .ok_or_else(|| Error::encode(format!("'{}' is not a coil state", value)))?;
        if self.limit == 1 {
            return Ok(if number != 0.0 { COIL_ON } else { COIL_OFF }.to_vec());
        }
        let raw = self.to_coil_mask(number)?;
        let bytes = usize::from(self.limit).div_ceil(8);
        Ok((0..bytes).map(|i| ((raw >> (8 * i)) & 0xFF) as u8).collect())
    }

    /// Scaled value -> bit pattern for `limit` coils; no sign, no truncation
    fn to_coil_mask(&self, value: f64) -> Result<u64> {
        let unscaled = (value / self.scale).round();
        let bits = u32::from(self.limit);
        let high = if bits >= 64 {
            u64::MAX as f64
        } else {
            ((1u64 << bits) - 1) as f64
        };
        if !unscaled.is_finite() || unscaled < 0.0 || unscaled > high {
            return Err(Error::encode(format!(
                "{} does not fit in {} coil(s)",
                value, self.limit
            )));
        }
        Ok(unscaled as u64)
    }
}

impl ProtocolCodec for ModbusCodec {
    fn protocol(&self) -> &str {
        "modbus"
    }

    fn decode(&self, property: &PropertyDefinition, raw: &[u8]) -> Result<PropertyValue> {
        if self.register.is_bit() {
            let bits = self.bits(raw)?;
            return numeric_value(property, bits as f64 * self.scale);
        }

        let registers = self.registers(raw)?;
        if property.semantic_type == SemanticType::Bytes {
            let bytes = registers.iter().flat_map(|r| r.to_be_bytes()).collect();
            return check_range(property, PropertyValue::Bytes(bytes));
        }
        let assembled = registers
            .iter()
            .fold(0u64, |acc, r| (acc << 16) | u64::from(*r));
        numeric_value(property, assembled as f64 * self.scale)
    }

    fn encode(&self, _property: &PropertyDefinition, value: &PropertyValue) -> Result<Vec<u8>> {
        if !self.register.is_writable() {
            return Err(Error::encode(format!(
                "{:?} at offset {} is read-only",
                self.register, self.offset
            )));
        }
        if self.register.is_bit() {
            self.encode_coils(value)
        } else {
            self.encode_registers(value)
        }
    }
}
