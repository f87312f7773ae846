//! Remote configuration: typed access, persistence, and reconciliation.

pub mod properties;
pub mod service;
pub mod storage;

pub use properties::{Properties, PropertyValue};
pub use service::{ConfigService, ConfigServiceBuilder, ConfigServiceError};
pub use storage::{ConfigStorage, FileStorage, MemoryStorage, StorageError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the typed getters on [`Config`].
#[derive(Debug, Error)]
pub enum ConfigValueError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("wrong type for key {key}: expected {expected} but got {actual}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("cannot convert value of {key} to int: {source}")]
    ParseInt {
        key: String,
        source: std::num::ParseIntError,
    },

    #[error("cannot convert value of {key} to float: {source}")]
    ParseFloat {
        key: String,
        source: std::num::ParseFloatError,
    },

    #[error("cannot convert value of {key} to bool: {value:?}")]
    ParseBool { key: String, value: String },
}

/// A verified configuration snapshot.
///
/// `version` and `hash` are bound to the manifest that produced the
/// snapshot; `properties` is the decoded artifact content, possibly
/// overlaid with environment variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub hash: String,
    pub properties: Properties,
}

impl Config {
    fn property(&self, key: &str) -> Result<&PropertyValue, ConfigValueError> {
        self.properties
            .get(key)
            .ok_or_else(|| ConfigValueError::KeyNotFound(key.to_string()))
    }

    fn wrong_type(key: &str, expected: &'static str, value: &PropertyValue) -> ConfigValueError {
        ConfigValueError::WrongType {
            key: key.to_string(),
            expected,
            actual: value.type_name(),
        }
    }

    /// Returns a string property.
    ///
    /// Accepts strings and UTF-8 byte sequences.
    pub fn get_string(&self, key: &str) -> Result<String, ConfigValueError> {
        let value = self.property(key)?;
        match value {
            PropertyValue::String(s) => Ok(s.clone()),
            PropertyValue::Bytes(b) => String::from_utf8(b.clone())
                .map_err(|_| Self::wrong_type(key, "string", value)),
            _ => Err(Self::wrong_type(key, "string", value)),
        }
    }

    /// Returns an integer property.
    ///
    /// Accepts integers, floats (truncating), and base-10 strings. A string
    /// that does not parse is a parse error, not a type error.
    pub fn get_int(&self, key: &str) -> Result<i64, ConfigValueError> {
        let value = self.property(key)?;
        match value {
            PropertyValue::Int(v) => Ok(*v),
            PropertyValue::Uint(v) => {
                i64::try_from(*v).map_err(|_| Self::wrong_type(key, "int", value))
            }
            PropertyValue::Float(v) => Ok(*v as i64),
            PropertyValue::String(s) => {
                s.parse::<i64>().map_err(|source| ConfigValueError::ParseInt {
                    key: key.to_string(),
                    source,
                })
            }
            _ => Err(Self::wrong_type(key, "int", value)),
        }
    }

    /// Returns a boolean property.
    ///
    /// Accepts booleans and the strings `true`/`1`/`yes` and
    /// `false`/`0`/`no`.
    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigValueError> {
        let value = self.property(key)?;
        match value {
            PropertyValue::Bool(v) => Ok(*v),
            PropertyValue::String(s) => match s.as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(ConfigValueError::ParseBool {
                    key: key.to_string(),
                    value: s.clone(),
                }),
            },
            _ => Err(Self::wrong_type(key, "bool", value)),
        }
    }

    /// Returns a float property.
    ///
    /// Accepts floats, integers, and decimal strings.
    pub fn get_float(&self, key: &str) -> Result<f64, ConfigValueError> {
        let value = self.property(key)?;
        match value {
            PropertyValue::Float(v) => Ok(*v),
            PropertyValue::Int(v) => Ok(*v as f64),
            PropertyValue::Uint(v) => Ok(*v as f64),
            PropertyValue::String(s) => {
                s.parse::<f64>()
                    .map_err(|source| ConfigValueError::ParseFloat {
                        key: key.to_string(),
                        source,
                    })
            }
            _ => Err(Self::wrong_type(key, "float", value)),
        }
    }
}
