//! Defines the dynamically-typed property values mirrored from the daemon.
//!
//! BlueZ property dictionaries are keyed by string and loosely typed. The
//! closed [`Value`] variant set covers everything the daemon sends for the
//! interfaces this crate mirrors, with typed accessors so callers never do
//! untyped downcasting.

use std::collections::HashMap;

/// A single dynamically-typed property value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum Value {
    /// Boolean property, e.g. `Connected`.
    Bool(bool),
    /// Integer property, e.g. `RSSI` or `MTU`. All daemon integer widths
    /// are widened to `i64`.
    Int(i64),
    /// String property, e.g. `Address` or `UUID`.
    Str(String),
    /// Raw byte payload, e.g. a characteristic `Value`.
    Bytes(Vec<u8>),
    /// Homogeneous or mixed list, e.g. the `UUIDs` string list.
    List(Vec<Value>),
    /// Nested dictionary, e.g. `ManufacturerData` or `ServiceData`.
    Map(HashMap<String, Value>),
}

/// Property-name to value mapping for one interface on one object.
pub type Properties = HashMap<String, Value>;

/// Interface-name to properties mapping for one object path.
pub type InterfaceProperties = HashMap<String, Properties>;

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Interprets a list value as a list of strings, skipping any entries
    /// of another type.
    pub fn as_str_list(&self) -> Option<Vec<String>> {
        self.as_list().map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
    }

    /// Interprets a map value as identifier-keyed byte buffers, skipping
    /// entries whose value is not a byte payload.
    pub fn as_byte_map(&self) -> Option<HashMap<String, Vec<u8>>> {
        self.as_map().map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_bytes().map(|b| (k.clone(), b.to_vec())))
                .collect()
        })
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::Str).collect())
    }
}
