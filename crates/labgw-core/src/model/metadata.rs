//! Free-form metadata bags.
//!
//! Device, session, measurement, command, and alert records all carry a
//! mapping from string keys to loosely typed values. No schema is enforced
//! beyond length bounds; nested maps and lists are allowed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::limits;

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<MetadataValue>),
    Map(HashMap<String, MetadataValue>),
}

/// Metadata mapping attached to domain entities.
pub type Metadata = HashMap<String, MetadataValue>;

impl MetadataValue {
    /// Render the value in string form, used for length validation and for
    /// flattening into wire-level `map<string, string>` responses.
    pub fn as_display_string(&self) -> String {
        match self {
            MetadataValue::Null => String::new(),
            MetadataValue::Bool(b) => b.to_string(),
            MetadataValue::Number(n) => n.to_string(),
            MetadataValue::String(s) => s.clone(),
            MetadataValue::List(_) | MetadataValue::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<f64> for MetadataValue {
    fn from(n: f64) -> Self {
        MetadataValue::Number(n)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Validate a metadata mapping against the shared length bounds.
pub fn validate_metadata(metadata: &Metadata) -> GatewayResult<()> {
    for (key, value) in metadata {
        if key.len() > limits::MAX_METADATA_KEY_LEN {
            return Err(GatewayError::validation(format!(
                "metadata key too long: {} (max {} characters)",
                key,
                limits::MAX_METADATA_KEY_LEN
            )));
        }
        if value.as_display_string().len() > limits::MAX_METADATA_VALUE_LEN {
            return Err(GatewayError::validation(format!(
                "metadata value too long for key {} (max {} characters)",
                key,
                limits::MAX_METADATA_VALUE_LEN
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_serde_round_trip() {
        let mut meta = Metadata::new();
        meta.insert("location".into(), "bench 4".into());
        meta.insert("channels".into(), MetadataValue::Number(8.0));
        meta.insert(
            "calibrated".into(),
            MetadataValue::List(vec![MetadataValue::Bool(true), MetadataValue::Null]),
        );

        let json = serde_json::to_string(&meta).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn test_key_length_rejected() {
        let mut meta = Metadata::new();
        meta.insert("k".repeat(101), "v".into());
        assert!(validate_metadata(&meta).is_err());
    }

    #[test]
    fn test_value_length_rejected() {
        let mut meta = Metadata::new();
        meta.insert("key".into(), "v".repeat(1001).into());
        assert!(validate_metadata(&meta).is_err());
    }
}
