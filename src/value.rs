use std::fmt::Display;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A value read from, or to be written to, a packet buffer.
///
/// Integer variants compare equal across signedness and against integral floats so that
/// identification values declared in configuration (typically parsed as signed) match
/// unsigned reads.
#[derive(Debug, Clone, From, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Block(Vec<u8>),
    Array(Vec<Value>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Block(value.to_vec())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::UInt(value.into())
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::UInt(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::UInt(value.into())
    }
}

impl Value {
    /// Integer interpretation of this value.
    ///
    /// Floats are truncated and strings are parsed, accepting a `0x` prefix for hex.
    ///
    /// # Errors
    /// [Error::Configuration] if the value has no integer interpretation.
    pub fn to_i128(&self) -> Result<i128> {
        match self {
            Value::Int(v) => Ok(i128::from(*v)),
            Value::UInt(v) => Ok(i128::from(*v)),
            #[allow(clippy::cast_possible_truncation)]
            Value::Float(v) if v.is_finite() => Ok(v.trunc() as i128),
            Value::String(s) => parse_integer(s)
                .ok_or_else(|| Error::Configuration(format!("invalid value for integer: {s:?}"))),
            other => Err(Error::Configuration(format!(
                "invalid value for integer: {other}"
            ))),
        }
    }

    /// Float interpretation of this value.
    ///
    /// # Errors
    /// [Error::Configuration] if the value has no float interpretation.
    pub fn to_f64(&self) -> Result<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Value::Int(v) => Ok(*v as f64),
            #[allow(clippy::cast_precision_loss)]
            Value::UInt(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::Configuration(format!("invalid value for float: {s:?}"))),
            other => Err(Error::Configuration(format!("invalid value for float: {other}"))),
        }
    }

    /// Byte interpretation of this value as used by STRING and BLOCK fields.
    ///
    /// # Errors
    /// [Error::Configuration] for arrays.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Block(b) => Ok(b.clone()),
            Value::Array(_) => Err(Error::Configuration(
                "array value cannot be written as bytes".to_string(),
            )),
            other => Ok(other.to_string().into_bytes()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::UInt(_) | Value::Float(_))
    }
}

fn parse_integer(s: &str) -> Option<i128> {
    let s = s.trim();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i128::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i128>().ok()?
    };
    Some(if neg { -v } else { v })
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::{Array, Block, Float, Int, String, UInt};
        match (self, other) {
            (Int(_) | UInt(_), Int(_) | UInt(_)) => {
                self.to_i128().ok() == other.to_i128().ok()
            }
            #[allow(clippy::float_cmp)]
            (Float(_), Int(_) | UInt(_) | Float(_)) | (Int(_) | UInt(_), Float(_)) => {
                self.to_f64().ok() == other.to_f64().ok()
            }
            (String(a), String(b)) => a == b,
            (Block(a), Block(b)) => a == b,
            (String(a), Block(b)) | (Block(b), String(a)) => a.as_bytes() == b.as_slice(),
            (Array(a), Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Block(v) => write!(f, "{}", hex_summary(v, v.len())),
            Value::Array(v) => {
                write!(f, "[")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Render up to `max` bytes of `dat` as space separated upper-case hex, appending `..`
/// when bytes were left off.
#[must_use]
pub fn hex_summary(dat: &[u8], max: usize) -> String {
    let mut out = dat
        .iter()
        .take(max)
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");
    if dat.len() > max {
        out.push_str(" ..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_values_compare_across_signedness() {
        assert_eq!(Value::Int(5), Value::UInt(5));
        assert_ne!(Value::Int(-1), Value::UInt(u64::MAX));
        assert_eq!(Value::Float(5.0), Value::UInt(5));
    }

    #[test]
    fn string_parses_hex_integers() {
        assert_eq!(Value::from("0x1F").to_i128().unwrap(), 31);
        assert_eq!(Value::from("-12").to_i128().unwrap(), -12);
        assert!(Value::from("nope").to_i128().is_err());
    }

    #[test]
    fn hex_summary_truncates() {
        assert_eq!(hex_summary(&[0, 1, 0xab], 16), "00 01 AB");
        assert_eq!(hex_summary(&[0, 1, 0xab], 2), "00 01 ..");
    }

    #[test]
    fn untagged_deserialize() {
        let v: Value = serde_json::from_str("5").unwrap();
        assert!(matches!(v, Value::Int(5)));
        let v: Value = serde_json::from_str("\"ABC\"").unwrap();
        assert_eq!(v, Value::from("ABC"));
        let v: Value = serde_json::from_str("1.5").unwrap();
        assert!(matches!(v, Value::Float(_)));
    }
}
