use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tributary::error::Result;
use tributary::StreamSlice;

use super::Cursor;

/// Key of the state published once a full refresh finished every partition.
pub const FULL_REFRESH_COMPLETE: &str = "__ab_full_refresh_sync_complete";

/// Passes partitions through unchanged and reports completion only when
/// all of them closed.
#[derive(Debug, Default)]
pub struct FullRefreshCursor {
    generated: usize,
    closed: usize,
}

impl FullRefreshCursor {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_complete(&self) -> bool {
        self.generated > 0 && self.closed >= self.generated
    }
}

impl Cursor for FullRefreshCursor {
    fn stream_slices(&mut self, partition: &StreamSlice) -> Result<Vec<StreamSlice>> {
        self.generated += 1;
        Ok(vec![partition.clone()])
    }

    fn close_partition(&mut self, _slice: &StreamSlice, _most_recent: Option<DateTime<Utc>>) -> Result<bool> {
        let before = self.is_complete();
        self.closed += 1;
        Ok(self.is_complete() != before)
    }

    fn state(&self) -> Option<Value> {
        self.is_complete().then(|| {
            let mut state = Map::new();
            state.insert(FULL_REFRESH_COMPLETE.to_string(), Value::Bool(true));
            Value::Object(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_only_after_every_partition_closed() {
        let mut cursor = FullRefreshCursor::new();
        assert_eq!(cursor.state(), None);

        let a = cursor.stream_slices(&StreamSlice::default()).unwrap();
        let b = cursor.stream_slices(&StreamSlice::default()).unwrap();
        assert_eq!(a.len(), 1);

        assert!(!cursor.close_partition(&a[0], None).unwrap());
        assert_eq!(cursor.state(), None);
        assert!(cursor.close_partition(&b[0], None).unwrap());
        assert_eq!(cursor.state(), Some(json!({"__ab_full_refresh_sync_complete": true})));
    }
}
