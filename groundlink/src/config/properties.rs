//! Dynamic configuration property values.
//!
//! Remote configuration arrives as a JSON object; its values are modeled as
//! a tagged sum instead of a type-erased container so the coercing getters
//! on [`Config`](super::Config) can match on structure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from property key to dynamic value. Ordering is irrelevant; the
/// sorted map only makes serialization deterministic.
pub type Properties = BTreeMap<String, PropertyValue>;

/// A single dynamic configuration value.
///
/// JSON decoding never produces `Bytes`; that variant exists for values
/// injected programmatically by embedders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Array(Vec<PropertyValue>),
    Object(BTreeMap<String, PropertyValue>),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// Human-readable type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::Uint(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        Self::Uint(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}
