//! Closed key/value metadata attached to ledger transactions.
//!
//! Values are restricted to scalars so the audit trail stays queryable.
//! Nested objects and arrays are rejected at construction time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_METADATA_ENTRIES: usize = 32;
pub const MAX_KEY_LEN: usize = 64;
pub const MAX_TEXT_LEN: usize = 512;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetadataError {
    #[error("invalid metadata key '{key}': keys are 1-{MAX_KEY_LEN} chars of [a-z0-9_.-]")]
    InvalidKey { key: String },

    #[error("metadata value for '{key}' is too long ({len} > {MAX_TEXT_LEN})")]
    ValueTooLong { key: String, len: usize },

    #[error("metadata value for '{key}' must be a finite number")]
    NonFiniteNumber { key: String },

    #[error("metadata value for '{key}' must be a string, number, bool or null")]
    NestedValue { key: String },

    #[error("metadata exceeds {MAX_METADATA_ENTRIES} entries")]
    TooManyEntries,

    #[error("metadata must be a JSON object")]
    NotAnObject,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<MetadataValue>> From<Option<T>> for MetadataValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, MetadataValue>")]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), MetadataError> {
        let key = key.into();
        let value = value.into();
        validate_entry(&key, &value)?;
        if !self.0.contains_key(&key) && self.0.len() >= MAX_METADATA_ENTRIES {
            return Err(MetadataError::TooManyEntries);
        }
        self.0.insert(key, value);
        Ok(())
    }

    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Result<Self, MetadataError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Converts a JSON object, rejecting nested values.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, MetadataError> {
        let object = value.as_object().ok_or(MetadataError::NotAnObject)?;
        let mut metadata = Self::new();
        for (key, raw) in object {
            let value = match raw {
                serde_json::Value::Null => MetadataValue::Null,
                serde_json::Value::Bool(b) => MetadataValue::Bool(*b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => MetadataValue::Int(i),
                    None => MetadataValue::Float(n.as_f64().unwrap_or(f64::NAN)),
                },
                serde_json::Value::String(s) => MetadataValue::Text(s.clone()),
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                    return Err(MetadataError::NestedValue { key: key.clone() });
                }
            };
            metadata.insert(key.clone(), value)?;
        }
        Ok(metadata)
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Null)
    }
}

impl TryFrom<BTreeMap<String, MetadataValue>> for Metadata {
    type Error = MetadataError;

    fn try_from(map: BTreeMap<String, MetadataValue>) -> Result<Self, Self::Error> {
        if map.len() > MAX_METADATA_ENTRIES {
            return Err(MetadataError::TooManyEntries);
        }
        for (key, value) in &map {
            validate_entry(key, value)?;
        }
        Ok(Self(map))
    }
}

fn validate_entry(key: &str, value: &MetadataValue) -> Result<(), MetadataError> {
    let key_ok = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'));
    if !key_ok {
        return Err(MetadataError::InvalidKey {
            key: key.to_string(),
        });
    }

    match value {
        MetadataValue::Float(f) if !f.is_finite() => Err(MetadataError::NonFiniteNumber {
            key: key.to_string(),
        }),
        MetadataValue::Text(s) if s.len() > MAX_TEXT_LEN => Err(MetadataError::ValueTooLong {
            key: key.to_string(),
            len: s.len(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_accepts_scalars() {
        let metadata = Metadata::new()
            .with("report_id", "r-1")
            .unwrap()
            .with("process_count", 12i64)
            .unwrap()
            .with("retry", false)
            .unwrap();

        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata.get("process_count"), Some(&MetadataValue::Int(12)));
    }

    #[test]
    fn test_rejects_nested_json() {
        let err = Metadata::from_json(&json!({ "payload": { "deep": 1 } })).unwrap_err();
        assert_eq!(
            err,
            MetadataError::NestedValue {
                key: "payload".into()
            }
        );
    }

    #[test]
    fn test_rejects_bad_keys_and_values() {
        assert!(Metadata::new().with("Has Space", 1i64).is_err());
        assert!(Metadata::new().with("ratio", f64::NAN).is_err());
        assert!(Metadata::new().with("note", "x".repeat(600)).is_err());
    }

    #[test]
    fn test_entry_limit() {
        let mut metadata = Metadata::new();
        for i in 0..MAX_METADATA_ENTRIES {
            metadata.insert(format!("k{}", i), i as i64).unwrap();
        }
        assert_eq!(
            metadata.insert("overflow", 1i64),
            Err(MetadataError::TooManyEntries)
        );
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Metadata = serde_json::from_value(json!({ "a": 1, "b": "x", "c": null })).unwrap();
        assert_eq!(ok.len(), 3);

        let bad = serde_json::from_value::<Metadata>(json!({ "a": [1, 2] }));
        assert!(bad.is_err());
    }
}
