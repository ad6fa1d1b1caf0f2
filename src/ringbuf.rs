use chrono::{Local, TimeZone};
use std::collections::VecDeque;

use crate::metrics::Timestamped;

/// A fixed-capacity ring buffer backed by VecDeque.
/// When full, pushing a new element drops the oldest one.
#[derive(Clone, Debug, PartialEq)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

/// One chart point: display label, raw time, and value.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesPoint {
    pub label: String,
    pub timestamp: i64,
    pub value: f64,
}

impl<T> RingBuffer<T> {
    /// Capacity used when a view does not ask for a specific size.
    pub const DEFAULT_CAPACITY: usize = 30;

    /// A zero capacity is bumped to one so the buffer can always hold the latest sample.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn latest(&self) -> Option<&T> {
        self.buf.back()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.buf.iter()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl<T: Timestamped> RingBuffer<T> {
    /// Project the buffer into chart points, oldest first.
    pub fn to_series(&self, value: impl Fn(&T) -> f64) -> Vec<SeriesPoint> {
        self.buf
            .iter()
            .map(|s| SeriesPoint {
                label: time_label(s.timestamp()),
                timestamp: s.timestamp(),
                value: value(s),
            })
            .collect()
    }
}

/// Local wall-clock `HH:MM:SS` for an epoch-millisecond timestamp.
pub fn time_label(epoch_ms: i64) -> String {
    match Local.timestamp_millis_opt(epoch_ms).single() {
        Some(t) => t.format("%H:%M:%S").to_string(),
        None => "--:--:--".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CpuSample;

    #[test]
    fn test_ringbuffer_capacity() {
        let mut rb = RingBuffer::new(3);
        rb.push(1);
        rb.push(2);
        rb.push(3);
        assert_eq!(rb.len(), 3);
        rb.push(4);
        assert_eq!(rb.len(), 3);
        let items: Vec<_> = rb.iter().copied().collect();
        assert_eq!(items, vec![2, 3, 4]);
        assert_eq!(rb.latest(), Some(&4));
    }

    #[test]
    fn test_ringbuffer_empty() {
        let rb: RingBuffer<i32> = RingBuffer::default();
        assert!(rb.is_empty());
        assert_eq!(rb.capacity(), 30);
        assert!(rb.latest().is_none());
    }

    #[test]
    fn test_length_is_min_of_pushes_and_capacity() {
        for capacity in [1usize, 2, 5, 30, 60] {
            for n in 0..(capacity * 3) {
                let mut rb = RingBuffer::new(capacity);
                for i in 0..n {
                    rb.push(i);
                }
                assert_eq!(rb.len(), n.min(capacity));
                let expected: Vec<usize> = (n.saturating_sub(capacity)..n).collect();
                let got: Vec<usize> = rb.iter().copied().collect();
                assert_eq!(got, expected, "capacity {capacity}, pushes {n}");
            }
        }
    }

    #[test]
    fn test_zero_capacity_holds_latest() {
        let mut rb = RingBuffer::new(0);
        rb.push('a');
        rb.push('b');
        assert_eq!(rb.len(), 1);
        assert_eq!(rb.latest(), Some(&'b'));
    }

    #[test]
    fn test_clear() {
        let mut rb = RingBuffer::new(4);
        rb.push(1);
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.capacity(), 4);
    }

    #[test]
    fn test_to_series_keeps_order() {
        let mut rb = RingBuffer::new(2);
        for (ts, pct) in [(1_000, 1.0), (2_000, 2.0), (3_000, 3.0)] {
            rb.push(CpuSample { system_pct: pct, timestamp: ts, ..Default::default() });
        }
        let series = rb.to_series(|c| c.system_pct);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].timestamp, 2_000);
        assert_eq!(series[1].value, 3.0);
        assert_eq!(series[0].label.len(), 8);
    }
}
