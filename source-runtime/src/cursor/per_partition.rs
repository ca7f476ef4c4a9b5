use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use tributary::error::{Result, SourceError};
use tributary::record::partition_key;
use tributary::StreamSlice;

use super::Cursor;

/// Builds the cursor used inside one partition, seeded with that
/// partition's saved state.
pub type InnerCursorFactory = Arc<dyn Fn(Option<&Value>) -> Result<Box<dyn Cursor>> + Send + Sync>;

struct Entry {
    partition: Map<String, Value>,
    cursor: Box<dyn Cursor>,
}

/// One inner cursor per partition, keyed by the partition's canonical JSON.
pub struct PerPartitionCursor {
    factory: InnerCursorFactory,
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    parent_state: Option<Value>,
}

impl PerPartitionCursor {
    pub fn new(factory: InnerCursorFactory, state: Option<&Value>) -> Result<Self> {
        let mut cursor = Self {
            factory,
            order: Vec::new(),
            entries: HashMap::new(),
            parent_state: None,
        };

        let state = match state {
            Some(Value::Object(map)) if !map.is_empty() => map,
            _ => return Ok(cursor),
        };
        let states = match state.get("states") {
            Some(Value::Array(states)) => states,
            Some(_) => return Err(SourceError::State("'states' must be a list".into())),
            None => {
                let ignored = Value::Object(state.clone());
                warn!(state = %ignored, "Ignoring state without per-partition entries");
                return Ok(cursor);
            }
        };

        for entry in states {
            let partition = entry
                .get("partition")
                .and_then(Value::as_object)
                .cloned()
                .ok_or_else(|| SourceError::State(format!("state entry without partition: {}", entry)))?;
            let inner = (cursor.factory)(entry.get("cursor"))?;
            cursor.insert(partition, inner);
        }
        cursor.parent_state = state.get("parent_state").cloned();
        Ok(cursor)
    }

    /// Parent state carried in the incoming checkpoint, if any.
    pub fn parent_state(&self) -> Option<&Value> {
        self.parent_state.as_ref()
    }

    fn insert(&mut self, partition: Map<String, Value>, inner: Box<dyn Cursor>) {
        let key = partition_key(&partition);
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(key, Entry { partition, cursor: inner });
    }
}

impl Cursor for PerPartitionCursor {
    fn stream_slices(&mut self, partition: &StreamSlice) -> Result<Vec<StreamSlice>> {
        let key = partition.partition_key();
        if !self.entries.contains_key(&key) {
            let inner = (self.factory)(None)?;
            self.insert(partition.partition.clone(), inner);
        }
        match self.entries.get_mut(&key) {
            Some(entry) => entry.cursor.stream_slices(partition),
            None => Ok(Vec::new()),
        }
    }

    fn close_partition(&mut self, slice: &StreamSlice, most_recent: Option<DateTime<Utc>>) -> Result<bool> {
        let key = slice.partition_key();
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| SourceError::State(format!("closing unknown partition {}", key)))?;
        entry.cursor.close_partition(slice, most_recent)
    }

    fn state(&self) -> Option<Value> {
        let states: Vec<Value> = self
            .order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .filter_map(|entry| {
                entry
                    .cursor
                    .state()
                    .map(|cursor| json!({"partition": entry.partition, "cursor": cursor}))
            })
            .collect();
        if states.is_empty() && self.parent_state.is_none() {
            return None;
        }
        let mut state = Map::new();
        state.insert("states".into(), Value::Array(states));
        if let Some(parent) = &self.parent_state {
            state.insert("parent_state".into(), parent.clone());
        }
        Some(Value::Object(state))
    }

    fn template_state(&self, slice: &StreamSlice) -> Value {
        self.entries
            .get(&slice.partition_key())
            .map(|entry| entry.cursor.template_state(slice))
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    fn set_parent_state(&mut self, parent_state: Value) {
        self.parent_state = Some(parent_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FullRefreshCursor;

    fn factory() -> InnerCursorFactory {
        Arc::new(|_state: Option<&Value>| Ok(Box::new(FullRefreshCursor::new()) as Box<dyn Cursor>))
    }

    fn partition(id: &str) -> StreamSlice {
        StreamSlice::from_partition(json!({"id": id}).as_object().cloned().unwrap())
    }

    #[test]
    fn test_states_accumulate_in_first_seen_order() {
        let mut cursor = PerPartitionCursor::new(factory(), None).unwrap();
        assert_eq!(cursor.state(), None);

        for id in ["nijima", "amamiya"] {
            let slices = cursor.stream_slices(&partition(id)).unwrap();
            cursor.close_partition(&slices[0], None).unwrap();
        }
        assert_eq!(
            cursor.state(),
            Some(json!({"states": [
                {"partition": {"id": "nijima"}, "cursor": {"__ab_full_refresh_sync_complete": true}},
                {"partition": {"id": "amamiya"}, "cursor": {"__ab_full_refresh_sync_complete": true}}
            ]}))
        );
    }

    #[test]
    fn test_state_without_partition_entries_is_ignored() {
        let state = json!({"updated_at": "2024-08-06"});
        let cursor = PerPartitionCursor::new(factory(), Some(&state)).unwrap();
        assert_eq!(cursor.state(), None);
    }

    #[test]
    fn test_unclosed_partition_is_not_published() {
        let mut cursor = PerPartitionCursor::new(factory(), None).unwrap();
        cursor.stream_slices(&partition("a")).unwrap();
        assert_eq!(cursor.state(), None);
    }

    #[test]
    fn test_seeded_entries_and_parent_state_survive() {
        let seeded: InnerCursorFactory = Arc::new(|state: Option<&Value>| {
            let mut inner = FullRefreshCursor::new();
            if state.is_some() {
                let slices = inner.stream_slices(&StreamSlice::default())?;
                inner.close_partition(&slices[0], None)?;
            }
            Ok(Box::new(inner) as Box<dyn Cursor>)
        });
        let incoming = json!({
            "states": [{"partition": {"id": "old"}, "cursor": {"__ab_full_refresh_sync_complete": true}}],
            "parent_state": {"parents": {"updated_at": "2024-08-01"}}
        });
        let mut cursor = PerPartitionCursor::new(seeded, Some(&incoming)).unwrap();
        assert_eq!(cursor.parent_state(), Some(&json!({"parents": {"updated_at": "2024-08-01"}})));
        assert_eq!(cursor.state(), Some(incoming.clone()));

        cursor.set_parent_state(json!({"parents": {"updated_at": "2024-09-01"}}));
        let state = cursor.state().unwrap();
        assert_eq!(state["parent_state"]["parents"]["updated_at"], json!("2024-09-01"));
        assert_eq!(state["states"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_closing_unknown_partition_fails() {
        let mut cursor = PerPartitionCursor::new(factory(), None).unwrap();
        let err = cursor.close_partition(&partition("ghost"), None).unwrap_err();
        assert!(matches!(err, SourceError::State(_)));
    }
}
