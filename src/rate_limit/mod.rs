// Request pacing for connectors that declare reqs_per_hour.
//
// One slot schedule per key (stream name). Streams never share a schedule,
// so a slow stream cannot starve another one.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Converts a requests-per-hour budget into the spacing between requests.
pub fn interval_for(reqs_per_hour: f64) -> Option<Duration> {
    if reqs_per_hour.is_finite() && reqs_per_hour > 0.0 {
        Duration::try_from_secs_f64(3600.0 / reqs_per_hour).ok()
    } else {
        None
    }
}

/// Per-key request pacer.
///
/// Each call to [`RequestPacer::reserve`] books the next free slot for the
/// key and returns how long the caller must wait before using it. Slots are
/// in-memory only.
pub struct RequestPacer {
    next_slot: DashMap<String, Instant>,
}

impl RequestPacer {
    pub fn new() -> Self {
        Self {
            next_slot: DashMap::new(),
        }
    }

    /// Book a slot for `key`, spaced `interval` after the previous booking.
    ///
    /// Returns the delay until the booked slot (zero for the first request).
    pub fn reserve(&self, key: &str, interval: Duration) -> Duration {
        let now = Instant::now();
        let mut slot = self.next_slot.entry(key.to_string()).or_insert(now);
        let start = (*slot).max(now);
        *slot = start + interval;
        start.saturating_duration_since(now)
    }

    /// Book a slot and sleep until it arrives.
    pub async fn wait(&self, key: &str, interval: Duration) {
        let delay = self.reserve(key, interval);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RequestPacer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_for() {
        assert_eq!(interval_for(3600.0), Some(Duration::from_secs(1)));
        assert_eq!(interval_for(7200.0), Some(Duration::from_millis(500)));
        assert_eq!(interval_for(0.0), None);
        assert_eq!(interval_for(-1.0), None);
        assert_eq!(interval_for(1e-300), None);
    }

    #[test]
    fn test_first_request_is_immediate() {
        let pacer = RequestPacer::new();
        assert_eq!(pacer.reserve("palaces", Duration::from_secs(10)), Duration::ZERO);
    }

    #[test]
    fn test_second_request_waits_for_interval() {
        let pacer = RequestPacer::new();
        pacer.reserve("palaces", Duration::from_secs(10));
        let delay = pacer.reserve("palaces", Duration::from_secs(10));
        // Allow for the time elapsed between the two calls
        assert!(delay > Duration::from_secs(9));
        assert!(delay <= Duration::from_secs(10));
    }

    #[test]
    fn test_separate_schedules_per_stream() {
        let pacer = RequestPacer::new();
        pacer.reserve("palaces", Duration::from_secs(10));
        // Another stream is unaffected
        assert_eq!(pacer.reserve("locations", Duration::from_secs(10)), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_sleeps_between_requests() {
        let pacer = RequestPacer::new();
        let started = Instant::now();
        pacer.wait("s", Duration::from_millis(50)).await;
        pacer.wait("s", Duration::from_millis(50)).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
