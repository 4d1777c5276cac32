//! Outbound cursor throttling.
//!
//! A fixed-interval sampler bounds locally generated cursor traffic to
//! one send per interval (default 100ms, i.e. 10 sends/second).
//! Positions produced faster than the interval overwrite a pending slot
//! — last value wins — and the pending position is emitted when the
//! window reopens, so the most recent position is always the one that
//! eventually goes out. Nothing is queued and nothing is lost from the
//! application's perspective; only intermediate positions coalesce.
//!
//! Presence and leave messages bypass this path entirely.

use std::time::{Duration, Instant};

use crate::store::CursorPos;

/// Default minimum interval between cursor sends (10/second).
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct CursorThrottler {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<CursorPos>,
}

impl CursorThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn window_open(&self, now: Instant) -> bool {
        match self.last_sent {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.interval,
        }
    }

    /// Offer a new local position. Returns the position to send now, or
    /// `None` if it was coalesced into the pending slot.
    pub fn offer(&mut self, pos: CursorPos, now: Instant) -> Option<CursorPos> {
        if self.window_open(now) {
            self.last_sent = Some(now);
            self.pending = None;
            Some(pos)
        } else {
            self.pending = Some(pos);
            None
        }
    }

    /// Emit the pending position if the window has reopened.
    ///
    /// Called from the throttle tick so a trailing position never sits
    /// unsent.
    pub fn flush(&mut self, now: Instant) -> Option<CursorPos> {
        if self.pending.is_some() && self.window_open(now) {
            self.last_sent = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_offer_sends_immediately() {
        let mut t = CursorThrottler::new(Duration::from_millis(100));
        let now = Instant::now();

        assert_eq!(
            t.offer(CursorPos::new(1.0, 2.0), now),
            Some(CursorPos::new(1.0, 2.0))
        );
    }

    #[test]
    fn test_burst_coalesces_to_latest() {
        let mut t = CursorThrottler::new(Duration::from_millis(100));
        let now = Instant::now();

        let mut sends = 0;
        for i in 0..20 {
            if t.offer(CursorPos::new(i as f32, 0.0), now).is_some() {
                sends += 1;
            }
        }

        // One throttle window: at most one send, latest value pending.
        assert_eq!(sends, 1);
        assert!(t.has_pending());

        let flushed = t.flush(now + Duration::from_millis(100));
        assert_eq!(flushed, Some(CursorPos::new(19.0, 0.0)));
        assert!(!t.has_pending());
    }

    #[test]
    fn test_rate_bound_over_many_windows() {
        let mut t = CursorThrottler::new(Duration::from_millis(100));
        let start = Instant::now();

        // 200 updates spread over one second: at most 10 immediate sends.
        let mut sends = 0;
        for i in 0..200u64 {
            let at = start + Duration::from_millis(i * 5);
            if t.offer(CursorPos::new(i as f32, 0.0), at).is_some() {
                sends += 1;
            }
        }
        assert!(sends <= 10, "sent {sends} times in one second");
    }

    #[test]
    fn test_flush_respects_window() {
        let mut t = CursorThrottler::new(Duration::from_millis(100));
        let now = Instant::now();

        t.offer(CursorPos::new(0.0, 0.0), now);
        t.offer(CursorPos::new(5.0, 5.0), now);

        // Window still closed: nothing flushes.
        assert_eq!(t.flush(now + Duration::from_millis(50)), None);
        assert!(t.has_pending());

        assert_eq!(
            t.flush(now + Duration::from_millis(100)),
            Some(CursorPos::new(5.0, 5.0))
        );
    }

    #[test]
    fn test_flush_without_pending_is_noop() {
        let mut t = CursorThrottler::new(Duration::from_millis(100));
        assert_eq!(t.flush(Instant::now()), None);
    }

    #[test]
    fn test_send_resumes_after_interval() {
        let mut t = CursorThrottler::new(Duration::from_millis(100));
        let now = Instant::now();

        assert!(t.offer(CursorPos::new(1.0, 1.0), now).is_some());
        assert!(t.offer(CursorPos::new(2.0, 2.0), now + Duration::from_millis(50)).is_none());
        assert!(t
            .offer(CursorPos::new(3.0, 3.0), now + Duration::from_millis(150))
            .is_some());
    }
}
