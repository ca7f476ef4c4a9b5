use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::protocol::{StateMessage, StateType, StreamDescriptor};

/// Incoming checkpoint state, indexed by stream.
///
/// Built once per read from the `--state` payload. Only per-stream state is
/// understood; global and legacy entries are skipped with a warning.
#[derive(Debug, Default, Clone)]
pub struct StateManager {
    streams: HashMap<StreamDescriptor, Value>,
}

impl StateManager {
    pub fn new(messages: Vec<StateMessage>) -> Self {
        let mut streams = HashMap::new();
        for message in messages {
            match (message.state_type, message.stream) {
                (StateType::Stream, Some(stream)) => {
                    if stream.stream_state.is_null() {
                        continue;
                    }
                    streams.insert(stream.stream_descriptor, stream.stream_state);
                }
                (state_type, _) => {
                    warn!(state_type = ?state_type, "Ignoring unsupported state entry");
                }
            }
        }
        Self { streams }
    }

    /// Parse a state file: a JSON array of STATE payloads. Full STATE
    /// envelopes (`{"type": "STATE", "state": {...}}`) are unwrapped.
    pub fn from_value(value: Value) -> Result<Self> {
        let entries = match value {
            Value::Array(entries) => entries,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = match entry.get("type").and_then(Value::as_str) {
                Some("STATE") => entry.get("state").cloned().unwrap_or(Value::Null),
                _ => entry,
            };
            let message: StateMessage =
                serde_json::from_value(payload).context("Malformed state entry")?;
            messages.push(message);
        }
        Ok(Self::new(messages))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse state {}", path.display()))?;
        Self::from_value(value)
    }

    pub fn get(&self, descriptor: &StreamDescriptor) -> Option<&Value> {
        self.streams.get(descriptor)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_indexes_stream_states() {
        let manager = StateManager::from_value(json!([
            {
                "type": "STREAM",
                "stream": {
                    "stream_descriptor": {"name": "party_members"},
                    "stream_state": {"updated_at": "2024-08-01"}
                }
            },
            {"type": "GLOBAL"}
        ]))
        .unwrap();

        assert_eq!(manager.len(), 1);
        assert_eq!(
            manager.get(&StreamDescriptor::new("party_members")),
            Some(&json!({"updated_at": "2024-08-01"}))
        );
        assert!(manager.get(&StreamDescriptor::new("palaces")).is_none());
    }

    #[test]
    fn test_unwraps_state_envelopes() {
        let manager = StateManager::from_value(json!([{
            "type": "STATE",
            "state": {
                "type": "STREAM",
                "stream": {"stream_descriptor": {"name": "palaces"}, "stream_state": {"a": 1}}
            }
        }]))
        .unwrap();
        assert_eq!(manager.get(&StreamDescriptor::new("palaces")), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_null_state_is_empty() {
        let manager = StateManager::from_value(Value::Null).unwrap();
        assert!(manager.is_empty());
    }

    #[test]
    fn test_malformed_entry_is_an_error() {
        let err = StateManager::from_value(json!([{"type": "NOPE"}])).unwrap_err();
        assert!(err.to_string().contains("Malformed state entry"));
    }
}
