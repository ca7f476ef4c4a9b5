use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::path::Path;

/// User-supplied connector configuration (the `--config` JSON object).
///
/// Immutable for the duration of a sync; exposed to templates as `config`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorConfig {
    values: Map<String, Value>,
}

impl ConnectorConfig {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            other => bail!("connector config must be a JSON object, got {}", kind(&other)),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Self::from_value(value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Requested worker count, accepting numbers or numeric strings.
    pub fn num_workers(&self) -> Option<u64> {
        match self.values.get("num_workers")? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_from_value_requires_object() {
        assert!(ConnectorConfig::from_value(json!({"start_date": "2024-07-01"})).is_ok());
        let err = ConnectorConfig::from_value(json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("got an array"));
    }

    #[test]
    fn test_num_workers_accepts_strings() {
        let config = ConnectorConfig::from_value(json!({"num_workers": "20"})).unwrap();
        assert_eq!(config.num_workers(), Some(20));
        let config = ConnectorConfig::from_value(json!({"num_workers": 3})).unwrap();
        assert_eq!(config.num_workers(), Some(3));
        let config = ConnectorConfig::from_value(json!({})).unwrap();
        assert_eq!(config.num_workers(), None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"api_key": "secret", "start_date": "2024-07-01"}}"#).unwrap();
        let config = ConnectorConfig::load(file.path()).unwrap();
        assert_eq!(config.get_str("start_date"), Some("2024-07-01"));
    }
}
