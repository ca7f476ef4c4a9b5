use chrono::{DateTime, Utc};

use crate::datetime::IsoDuration;

/// A closed interval of completed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub most_recent: DateTime<Utc>,
}

/// Sorted, merged set of closed intervals. Two intervals merge when they
/// overlap or their gap is at most one granularity step.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
    granularity: IsoDuration,
}

impl IntervalSet {
    pub fn new(granularity: IsoDuration) -> Self {
        Self {
            intervals: Vec::new(),
            granularity,
        }
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn last(&self) -> Option<&Interval> {
        self.intervals.last()
    }

    /// Insert `[start, end]`. `most_recent` defaults to `end`. Returns true
    /// if the set changed.
    pub fn insert(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        most_recent: Option<DateTime<Utc>>,
    ) -> bool {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let before = self.intervals.clone();
        self.intervals.push(Interval {
            start,
            end,
            most_recent: most_recent.unwrap_or(end),
        });
        self.normalize();
        self.intervals != before
    }

    fn normalize(&mut self) {
        self.intervals.sort_by_key(|i| i.start);
        let mut merged: Vec<Interval> = Vec::with_capacity(self.intervals.len());
        for interval in self.intervals.drain(..) {
            match merged.last_mut() {
                Some(current) if self.granularity.add_to(current.end).map_or(true, |reach| interval.start <= reach) => {
                    current.end = current.end.max(interval.end);
                    current.most_recent = current.most_recent.max(interval.most_recent);
                }
                _ => merged.push(interval),
            }
        }
        self.intervals = merged;
    }
}
