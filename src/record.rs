use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::Message;

/// Unit of work dispatched to a worker.
///
/// `partition` identifies a logical sub-resource (an account, a parent
/// record); `cursor_slice` bounds the cursor range within it. Either may be
/// empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSlice {
    #[serde(default)]
    pub partition: Map<String, Value>,

    #[serde(default)]
    pub cursor_slice: Map<String, Value>,

    /// Lineage carried alongside the slice; never part of the partition key
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_fields: Map<String, Value>,
}

impl StreamSlice {
    pub fn new(partition: Map<String, Value>, cursor_slice: Map<String, Value>) -> Self {
        Self {
            partition,
            cursor_slice,
            extra_fields: Map::new(),
        }
    }

    pub fn from_partition(partition: Map<String, Value>) -> Self {
        Self::new(partition, Map::new())
    }

    /// Same partition and lineage, new cursor bounds.
    pub fn with_cursor_slice(&self, cursor_slice: Map<String, Value>) -> Self {
        Self {
            partition: self.partition.clone(),
            cursor_slice,
            extra_fields: self.extra_fields.clone(),
        }
    }

    /// Looks a key up in the cursor slice first, then the partition.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.cursor_slice
            .get(key)
            .or_else(|| self.partition.get(key))
    }

    /// Flattened view exposed to templates as `stream_slice`.
    pub fn to_value(&self) -> Value {
        let mut merged = self.partition.clone();
        for (k, v) in &self.cursor_slice {
            merged.insert(k.clone(), v.clone());
        }
        Value::Object(merged)
    }

    pub fn partition_key(&self) -> String {
        partition_key(&self.partition)
    }
}

/// Canonical key for a partition: its JSON encoding with sorted keys.
pub fn partition_key(partition: &Map<String, Value>) -> String {
    // serde_json's default Map is ordered by key, so encoding is canonical.
    Value::Object(partition.clone()).to_string()
}

/// A record extracted from a response, tagged with the slice that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub stream: String,
    pub data: Map<String, Value>,
    pub associated_slice: StreamSlice,
}

impl Record {
    pub fn new(stream: &str, data: Map<String, Value>, associated_slice: StreamSlice) -> Self {
        Self {
            stream: stream.to_string(),
            data,
            associated_slice,
        }
    }

    pub fn into_message(self, emitted_at: i64) -> Message {
        Message::record(&self.stream, self.data, emitted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_partition_key_is_order_independent() {
        let a = map(json!({"b": 1, "a": {"y": 2, "x": 1}}));
        let b = map(json!({"a": {"x": 1, "y": 2}, "b": 1}));
        assert_eq!(partition_key(&a), partition_key(&b));
        assert_eq!(partition_key(&a), r#"{"a":{"x":1,"y":2},"b":1}"#);
    }

    #[test]
    fn test_slice_lookup_prefers_cursor_slice() {
        let slice = StreamSlice::new(
            map(json!({"id": "p", "start_time": "shadowed"})),
            map(json!({"start_time": "2024-07-01"})),
        );
        assert_eq!(slice.get("start_time"), Some(&json!("2024-07-01")));
        assert_eq!(slice.get("id"), Some(&json!("p")));
        assert_eq!(slice.get("missing"), None);
        assert_eq!(
            slice.to_value(),
            json!({"id": "p", "start_time": "2024-07-01"})
        );
    }

    #[test]
    fn test_record_into_message() {
        let record = Record::new("party_members", map(json!({"id": "amamiya"})), StreamSlice::default());
        let line = record.into_message(42).to_line().unwrap();
        assert_eq!(
            line,
            r#"{"type":"RECORD","record":{"stream":"party_members","data":{"id":"amamiya"},"emitted_at":42}}"#
        );
    }
}
