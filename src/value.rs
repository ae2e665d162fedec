//! Value types flowing through trigger evaluation.
//!
//! Telemetry items carry [`TelemetryValue`] scalars in raw, converted, and
//! formatted forms. During evaluation each operand resolves to an
//! [`OperandValue`], which additionally covers limit-state labels, compiled
//! regex constants, and referenced trigger states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar value of a telemetry item.
///
/// # Examples
///
/// ```
/// use autonomic::TelemetryValue;
///
/// let v = TelemetryValue::Float(1.5);
/// assert!(v.is_numeric());
/// assert_eq!(v.as_f64(), Some(1.5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TelemetryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TelemetryValue {
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Numeric view of the value, coercing integers to floats.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// A fully resolved operand, ready for comparison.
///
/// Produced by operand resolution in the evaluator. Not serializable: regex
/// constants are compiled and trigger references are read from committed
/// runtime state at resolution time.
#[derive(Debug, Clone)]
pub enum OperandValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Limit-state label, e.g. `RED_HIGH` or `GREEN`.
    Limit(String),
    Regex(regex::Regex),
}

impl OperandValue {
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub const fn is_regex(&self) -> bool {
        matches!(self, Self::Regex(_))
    }

    /// Numeric view of the value, coercing integers to floats.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Textual view: strings and limit labels compare as text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) | Self::Limit(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<TelemetryValue> for OperandValue {
    fn from(value: TelemetryValue) -> Self {
        match value {
            TelemetryValue::Bool(v) => Self::Bool(v),
            TelemetryValue::Int(v) => Self::Int(v),
            TelemetryValue::Float(v) => Self::Float(v),
            TelemetryValue::Text(v) => Self::Text(v),
        }
    }
}

impl fmt::Display for OperandValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Limit(v) => write!(f, "{v}"),
            Self::Regex(v) => write!(f, "/{}/", v.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_value_coercion() {
        assert_eq!(TelemetryValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(TelemetryValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(TelemetryValue::Text("x".to_string()).as_f64(), None);
    }

    #[test]
    fn test_operand_value_text_covers_limits() {
        let limit = OperandValue::Limit("GREEN_HIGH".to_string());
        assert_eq!(limit.as_text(), Some("GREEN_HIGH"));
        assert!(!limit.is_numeric());
    }

    #[test]
    fn test_operand_value_from_telemetry() {
        let v: OperandValue = TelemetryValue::Int(7).into();
        assert_eq!(v.as_f64(), Some(7.0));
    }

    #[test]
    fn test_serde_round_trip() {
        let v = TelemetryValue::Float(6.9e5);
        let json = serde_json::to_string(&v).unwrap();
        let back: TelemetryValue = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
