//! Opaque values carried between nodes.
//!
//! Node payloads, constants, outputs, and execution context are all
//! [`Value`]s. The engine never inspects them; it only moves them from a
//! predecessor's output into a successor's input bundle and in and out of
//! the repository.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A mapping of string keys to values, used for node constants, input
/// bundles, and the execution context.
pub type ValueMap = BTreeMap<String, Value>;

/// An opaque, cheaply clonable tagged value.
///
/// This is the single data shape the engine shuttles around. Adapters
/// serialize it with serde; no wire format leaks into the engine API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Integer(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Ordered sequence of values
    Sequence(Vec<Value>),
    /// String-keyed mapping of values
    Mapping(ValueMap),
}

impl Value {
    /// Returns the contained string, if this is a `String` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained mapping, if this is a `Mapping` value.
    pub fn as_mapping(&self) -> Option<&ValueMap> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// True for `Value::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl<V: Into<Value>> FromIterator<(String, V)> for Value {
    fn from_iter<T: IntoIterator<Item = (String, V)>>(iter: T) -> Self {
        Value::Mapping(iter.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}
