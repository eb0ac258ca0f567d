// # Semantic Property Values
//
// Typed representation of a property value. The twin stores values as
// strings; `PropertyValue` is what codecs produce and consume, and its
// `Display` output is the canonical string used when comparing desired and
// reported state.

use std::fmt;

use super::SemanticType;
use crate::error::{Error, Result};

/// A decoded, typed property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Double(f64),
    /// 32-bit float
    Float(f32),
    /// UTF-8 text
    String(String),
    /// Boolean
    Boolean(bool),
    /// Opaque bytes, canonically rendered as lower-case hex
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// Parse a string-encoded value into the given semantic type
    ///
    /// Booleans accept `true/false`, `1/0` and `on/off` in any case. Bytes
    /// accept hex with an optional `0x` prefix.
    pub fn parse(semantic_type: SemanticType, raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        match semantic_type {
            SemanticType::Int => trimmed
                .parse::<i64>()
                .map(Self::Int)
                .map_err(|e| Error::decode(format!("'{}' is not an int: {}", raw, e))),
            SemanticType::Double => parse_finite(trimmed).map(Self::Double),
            SemanticType::Float => parse_finite(trimmed).map(|v| Self::Float(v as f32)),
            SemanticType::String => Ok(Self::String(raw.to_string())),
            SemanticType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Ok(Self::Boolean(true)),
                "false" | "0" | "off" => Ok(Self::Boolean(false)),
                _ => Err(Error::decode(format!("'{}' is not a boolean", raw))),
            },
            SemanticType::Bytes => {
                let digits = trimmed
                    .strip_prefix("0x")
                    .or_else(|| trimmed.strip_prefix("0X"))
                    .unwrap_or(trimmed);
                hex::decode(digits)
                    .map(Self::Bytes)
                    .map_err(|e| Error::decode(format!("'{}' is not hex: {}", raw, e)))
            }
        }
    }

    /// Build a value of the given type from the result of a numeric codec
    ///
    /// Integers truncate toward zero. `bytes` cannot be produced from a number;
    /// codecs handle that type from the raw slice instead.
    pub fn from_number(semantic_type: SemanticType, value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::decode(format!("numeric result {} is not finite", value)));
        }
        match semantic_type {
            SemanticType::Int => {
                let truncated = value.trunc();
                if truncated < i64::MIN as f64 || truncated > i64::MAX as f64 {
                    return Err(Error::decode(format!("{} overflows int", value)));
                }
                Ok(Self::Int(truncated as i64))
            }
            SemanticType::Double => Ok(Self::Double(value)),
            SemanticType::Float => Ok(Self::Float(value as f32)),
            SemanticType::String => Ok(Self::String(format_number(value))),
            SemanticType::Boolean => Ok(Self::Boolean(value != 0.0)),
            SemanticType::Bytes => Err(Error::decode(
                "numeric result cannot be represented as bytes",
            )),
        }
    }

    /// Numeric view used by encoders
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            Self::Bytes(_) => None,
        }
    }

    /// The semantic type this value carries
    pub fn semantic_type(&self) -> SemanticType {
        match self {
            Self::Int(_) => SemanticType::Int,
            Self::Double(_) => SemanticType::Double,
            Self::Float(_) => SemanticType::Float,
            Self::String(_) => SemanticType::String,
            Self::Boolean(_) => SemanticType::Boolean,
            Self::Bytes(_) => SemanticType::Bytes,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Bytes(v) => f.write_str(&hex::encode(v)),
        }
    }
}

fn parse_finite(raw: &str) -> Result<f64> {
    let value = raw
        .parse::<f64>()
        .map_err(|e| Error::decode(format!("'{}' is not a number: {}", raw, e)))?;
    if !value.is_finite() {
        return Err(Error::decode(format!("'{}' is not finite", raw)));
    }
    Ok(value)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
