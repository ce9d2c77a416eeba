//! Layered parameter maps
//!
//! Stages see one merged map: pipeline-global values, overridden by the
//! stage's own values, overridden by `key:value` pairs from the command line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Parse command-line overrides of the form `key:value`.
    ///
    /// Values that parse as JSON scalars keep their type (`batch:10` is a
    /// number, `dry_run:true` a bool); anything else is a string.
    pub fn from_overrides<S: AsRef<str>>(pairs: &[S]) -> Result<Self, ConfigError> {
        let mut params = Params::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, raw) = pair
                .split_once(':')
                .filter(|(key, _)| !key.trim().is_empty())
                .ok_or_else(|| ConfigError::Override(pair.to_string()))?;

            let value = match serde_json::from_str::<Value>(raw) {
                Ok(v) if !v.is_object() && !v.is_array() => v,
                _ => Value::String(raw.to_string()),
            };
            params.insert(key.trim(), value);
        }
        Ok(params)
    }

    /// Merge layers left to right; later layers win key by key.
    pub fn layered(layers: &[&Params]) -> Params {
        let mut merged = Params::new();
        for layer in layers {
            for (key, value) in &layer.0 {
                merged.0.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Fetch a mandatory string parameter
    pub fn require_str(&self, key: &'static str) -> Result<&str, ConfigError> {
        self.get_str(key).ok_or(ConfigError::MissingField {
            context: "stage parameters".to_string(),
            field: key,
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_global_stage_cli() {
        let global = Params::new().with("source", "global").with("limit", 10);
        let stage = Params::new().with("source", "stage").with("table", "dns");
        let cli = Params::from_overrides(&["source:cli"]).unwrap();

        let merged = Params::layered(&[&global, &stage, &cli]);
        assert_eq!(merged.get_str("source"), Some("cli"));
        assert_eq!(merged.get_str("table"), Some("dns"));
        assert_eq!(merged.get_u64("limit"), Some(10));
    }

    #[test]
    fn test_override_value_types() {
        let params =
            Params::from_overrides(&["batch:25", "dry_run:true", "host:10.0.0.1:22"]).unwrap();
        assert_eq!(params.get_u64("batch"), Some(25));
        assert_eq!(params.get_bool("dry_run"), Some(true));
        // only the first colon separates key from value
        assert_eq!(params.get_str("host"), Some("10.0.0.1:22"));
    }

    #[test]
    fn test_malformed_override() {
        assert!(matches!(
            Params::from_overrides(&["novalue"]),
            Err(ConfigError::Override(_))
        ));
        assert!(Params::from_overrides(&[":value"]).is_err());
    }

    #[test]
    fn test_require_str() {
        let params = Params::new().with("record_type", "port_scan");
        assert_eq!(params.require_str("record_type").unwrap(), "port_scan");
        assert!(params.require_str("missing").is_err());
    }
}
