use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Packet;
use crate::{Result, Value};

/// Maps a value read from (or written to) a packet buffer to another representation,
/// e.g., raw counts to engineering units.
pub trait Conversion: Debug + Send + Sync {
    /// Convert `value`. `packet` gives access to other items for derived conversions.
    ///
    /// # Errors
    /// When `value` cannot be converted.
    fn call(&self, value: &Value, packet: &Packet) -> Result<Value>;
}

/// `c0 + c1*x + c2*x^2 + ...`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialConversion {
    pub coeffs: Vec<f64>,
}

impl PolynomialConversion {
    #[must_use]
    pub fn new(coeffs: Vec<f64>) -> Self {
        Self { coeffs }
    }
}

impl Conversion for PolynomialConversion {
    fn call(&self, value: &Value, _packet: &Packet) -> Result<Value> {
        let x = value.to_f64()?;
        // Horner's method
        let y = self.coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c);
        Ok(Value::Float(y))
    }
}

type ConversionFn = dyn Fn(&Value, &Packet) -> Result<Value> + Send + Sync;

/// Conversion backed by a closure.
#[derive(Clone)]
pub struct FnConversion {
    name: String,
    func: Arc<ConversionFn>,
}

impl FnConversion {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&Value, &Packet) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            func: Arc::new(func),
        }
    }
}

impl Debug for FnConversion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnConversion({})", self.name)
    }
}

impl Conversion for FnConversion {
    fn call(&self, value: &Value, packet: &Packet) -> Result<Value> {
        (self.func)(value, packet)
    }
}

/// Conversions that can be declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversionDef {
    Polynomial { coeffs: Vec<f64> },
}

impl ConversionDef {
    #[must_use]
    pub fn build(&self) -> Arc<dyn Conversion> {
        match self {
            ConversionDef::Polynomial { coeffs } => {
                Arc::new(PolynomialConversion::new(coeffs.clone()))
            }
        }
    }
}
