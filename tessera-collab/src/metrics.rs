//! Latency sampling for performance mode.
//!
//! Samples land in a bounded ring buffer and are never mutated after
//! insertion; the summary is computed on demand.

use std::collections::VecDeque;

use crate::protocol::now_millis;

/// Default ring buffer capacity.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 256;

/// What was measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Encoding and handing an outbound frame to the transport.
    Send,
    /// Decoding and merging an inbound frame.
    Merge,
    /// One presence sweep pass.
    Sweep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub kind: OperationKind,
    pub duration_ms: f64,
    /// Milliseconds since the Unix epoch at insertion.
    pub at: u64,
}

/// Summary over the current ring buffer contents.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricsSummary {
    pub average: f64,
    pub max: f64,
    pub min: f64,
}

/// Bounded ring buffer of latency samples.
#[derive(Debug)]
pub struct LatencyRecorder {
    samples: VecDeque<LatencySample>,
    capacity: usize,
    enabled: bool,
}

impl LatencyRecorder {
    pub fn new(enabled: bool) -> Self {
        Self::with_capacity(enabled, DEFAULT_SAMPLE_CAPACITY)
    }

    pub fn with_capacity(enabled: bool, capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Append a sample, evicting the oldest when full. No-op when disabled.
    pub fn record(&mut self, kind: OperationKind, duration_ms: f64) {
        if !self.enabled {
            return;
        }
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(LatencySample {
            kind,
            duration_ms,
            at: now_millis(),
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Average/max/min over the buffer. All zeros when empty.
    pub fn summary(&self) -> MetricsSummary {
        if self.samples.is_empty() {
            return MetricsSummary::default();
        }

        let mut sum = 0.0;
        let mut max = f64::MIN;
        let mut min = f64::MAX;
        for s in &self.samples {
            sum += s.duration_ms;
            max = max.max(s.duration_ms);
            min = min.min(s.duration_ms);
        }

        MetricsSummary {
            average: sum / self.samples.len() as f64,
            max,
            min,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary_is_zero() {
        let r = LatencyRecorder::new(true);
        assert_eq!(r.summary(), MetricsSummary::default());
    }

    #[test]
    fn test_summary_over_samples() {
        let mut r = LatencyRecorder::new(true);
        r.record(OperationKind::Send, 2.0);
        r.record(OperationKind::Merge, 4.0);
        r.record(OperationKind::Sweep, 6.0);

        let s = r.summary();
        assert_eq!(s.average, 4.0);
        assert_eq!(s.max, 6.0);
        assert_eq!(s.min, 2.0);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let mut r = LatencyRecorder::with_capacity(true, 3);
        for i in 0..10 {
            r.record(OperationKind::Send, i as f64);
        }

        assert_eq!(r.len(), 3);
        // Oldest samples were evicted.
        assert_eq!(r.summary().min, 7.0);
        assert_eq!(r.summary().max, 9.0);
    }

    #[test]
    fn test_disabled_records_nothing() {
        let mut r = LatencyRecorder::new(false);
        r.record(OperationKind::Send, 1.0);
        assert!(r.is_empty());
    }
}
