//! Cursors turn a partition into ordered slices and fold completed slices
//! back into checkpoint state.
//!
//! A cursor is owned by one stream read and is only mutated by that
//! stream's completion serializer (or, for synchronous streams, by the
//! stream loop itself).

mod datetime;
mod full_refresh;
mod intervals;
mod per_partition;

pub use datetime::{DatetimeCursor, DatetimeCursorDefinition, DatetimeParams, RecordPosition};
pub use full_refresh::{FullRefreshCursor, FULL_REFRESH_COMPLETE};
pub use intervals::{Interval, IntervalSet};
pub use per_partition::{InnerCursorFactory, PerPartitionCursor};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tributary::error::Result;
use tributary::StreamSlice;

pub trait Cursor: Send {
    /// Slices for one partition, ascending and non-overlapping.
    fn stream_slices(&mut self, partition: &StreamSlice) -> Result<Vec<StreamSlice>>;

    /// Record that `slice` finished. `most_recent` is the largest cursor
    /// value seen in it. Returns true if the state changed.
    fn close_partition(
        &mut self,
        slice: &StreamSlice,
        most_recent: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Checkpoint state, or `None` while there is nothing safe to publish.
    fn state(&self) -> Option<Value>;

    /// `stream_state` as seen by templates for this slice.
    fn template_state(&self, _slice: &StreamSlice) -> Value {
        Value::Object(Default::default())
    }

    /// Parent stream state to carry in the checkpoint (substreams).
    fn set_parent_state(&mut self, _parent_state: Value) {}
}
