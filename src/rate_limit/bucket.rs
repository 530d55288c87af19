//! Fixed-window token bucket with server corrections.
//!
//! A window opens on the first consumption and lasts `refill_interval`; once it ends the bucket
//! refills to `capacity`. Server headers may overwrite `capacity`, `remaining`, and the window
//! end at any time. Invariants: `remaining <= capacity`, and whenever `remaining == 0` a window end
//! (`reset_at`) is known.

use crate::clock::duration_to_millis;
use crate::rate_limit::headers::RateLimitUpdate;
use std::time::Duration;

/// Mutable bucket state. Times are clock millis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    capacity: u32,
    remaining: u32,
    reset_at: Option<u64>,
    refill_interval: u64,
    global_limited: bool,
}

/// Read-only view of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub capacity: u32,
    pub remaining: u32,
    /// Time until the current window ends, if one is open.
    pub reset_in: Option<Duration>,
    /// Whether the last throttle on this bucket came from an account-wide limit.
    pub global_limited: bool,
}

impl Bucket {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            remaining: capacity,
            reset_at: None,
            refill_interval: duration_to_millis(refill_interval).max(1),
            global_limited: false,
        }
    }

    fn refresh(&mut self, now: u64) {
        if matches!(self.reset_at, Some(reset_at) if now >= reset_at) {
            self.remaining = self.capacity;
            self.reset_at = None;
            self.global_limited = false;
        }
    }

    /// Wait required before a token is available; `None` when one is available now.
    pub fn check(&mut self, now: u64) -> Option<Duration> {
        self.refresh(now);
        if self.remaining > 0 {
            return None;
        }
        let reset_at = *self.reset_at.get_or_insert(now.saturating_add(self.refill_interval));
        Some(Duration::from_millis(reset_at.saturating_sub(now).max(1)))
    }

    /// Take one token. Callers must have seen [`check`](Self::check) return `None` under the same
    /// lock.
    pub fn consume(&mut self, now: u64) {
        self.remaining = self.remaining.saturating_sub(1);
        self.reset_at.get_or_insert(now.saturating_add(self.refill_interval));
    }

    /// Check and consume in one step.
    pub fn try_acquire(&mut self, now: u64) -> Result<(), Duration> {
        match self.check(now) {
            None => {
                self.consume(now);
                Ok(())
            }
            Some(wait) => Err(wait),
        }
    }

    /// Overwrite local counters with server-reported values.
    pub fn apply(&mut self, update: &RateLimitUpdate, now: u64) {
        self.refresh(now);
        if let Some(limit) = update.limit {
            self.capacity = limit.max(1);
        }
        if let Some(reset_after) = update.reset_after {
            self.reset_at = Some(now.saturating_add(duration_to_millis(reset_after)));
        }
        if let Some(remaining) = update.remaining {
            self.remaining = remaining;
        }
        self.remaining = self.remaining.min(self.capacity);
        if self.remaining == 0 && self.reset_at.is_none() {
            self.reset_at = Some(now.saturating_add(self.refill_interval));
        }
    }

    /// Empty the bucket until `now + wait` (explicit 429).
    pub fn throttle(&mut self, wait: Duration, global: bool, now: u64) {
        let until = now.saturating_add(duration_to_millis(wait).max(1));
        self.remaining = 0;
        self.reset_at = Some(self.reset_at.map_or(until, |r| r.max(until)));
        self.global_limited = global;
    }

    pub fn snapshot(&self, now: u64) -> BucketSnapshot {
        let mut view = self.clone();
        view.refresh(now);
        BucketSnapshot {
            capacity: view.capacity,
            remaining: view.remaining,
            reset_in: view.reset_at.map(|r| Duration::from_millis(r.saturating_sub(now))),
            global_limited: view.global_limited,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update() -> RateLimitUpdate {
        RateLimitUpdate::default()
    }

    #[test]
    fn admits_capacity_then_waits_for_window() {
        let mut b = Bucket::new(3, Duration::from_millis(1000));
        for _ in 0..3 {
            assert_eq!(b.try_acquire(10), Ok(()));
        }
        assert_eq!(b.try_acquire(10), Err(Duration::from_millis(1000)));
        assert_eq!(b.try_acquire(600), Err(Duration::from_millis(400)));
        assert_eq!(b.try_acquire(1010), Ok(()));
        assert_eq!(b.remaining(), 2);
    }

    #[test]
    fn window_starts_on_first_use() {
        let mut b = Bucket::new(1, Duration::from_millis(100));
        assert_eq!(b.snapshot(0).reset_in, None);
        b.try_acquire(500).unwrap();
        assert_eq!(b.snapshot(500).reset_in, Some(Duration::from_millis(100)));
    }

    #[test]
    fn server_headers_override_local_counts() {
        let mut b = Bucket::new(10, Duration::from_secs(1));
        b.try_acquire(0).unwrap();
        b.apply(
            &RateLimitUpdate {
                limit: Some(5),
                remaining: Some(0),
                reset_after: Some(Duration::from_millis(2500)),
                ..update()
            },
            100,
        );
        let s = b.snapshot(100);
        assert_eq!((s.capacity, s.remaining), (5, 0));
        assert_eq!(s.reset_in, Some(Duration::from_millis(2500)));
        assert_eq!(b.try_acquire(2599), Err(Duration::from_millis(1)));
        assert_eq!(b.try_acquire(2600), Ok(()));
        assert_eq!(b.remaining(), 4);
    }

    #[test]
    fn remaining_never_exceeds_capacity() {
        let mut b = Bucket::new(2, Duration::from_secs(1));
        b.apply(&RateLimitUpdate { remaining: Some(50), ..update() }, 0);
        assert_eq!(b.remaining(), 2);
    }

    #[test]
    fn zero_remaining_without_reset_gets_a_window() {
        let mut b = Bucket::new(2, Duration::from_millis(300));
        b.apply(&RateLimitUpdate { remaining: Some(0), ..update() }, 50);
        assert_eq!(b.snapshot(50).reset_in, Some(Duration::from_millis(300)));
    }

    #[test]
    fn throttle_zeroes_and_marks_global() {
        let mut b = Bucket::new(5, Duration::from_secs(1));
        b.throttle(Duration::from_secs(5), true, 0);
        let s = b.snapshot(0);
        assert_eq!(s.remaining, 0);
        assert!(s.global_limited);
        assert_eq!(b.try_acquire(4_999), Err(Duration::from_millis(1)));
        assert_eq!(b.try_acquire(5_000), Ok(()));
        assert!(!b.snapshot(5_000).global_limited);
    }

    #[test]
    fn huge_server_waits_saturate() {
        let mut b = Bucket::new(5, Duration::from_secs(1));
        b.throttle(Duration::MAX, false, 5);
        assert_eq!(b.try_acquire(5), Err(Duration::from_millis(u64::MAX - 5)));
        assert_eq!(b.try_acquire(1_000_000), Err(Duration::from_millis(u64::MAX - 1_000_000)));

        let mut b = Bucket::new(5, Duration::from_secs(1));
        b.apply(&RateLimitUpdate { remaining: Some(0), reset_after: Some(Duration::MAX), ..update() }, 7);
        assert_eq!(b.snapshot(7).reset_in, Some(Duration::from_millis(u64::MAX - 7)));
        assert!(b.try_acquire(7).is_err());
    }

    #[test]
    fn window_end_saturates_at_clock_limit() {
        let mut b = Bucket::new(1, Duration::from_secs(1));
        b.try_acquire(u64::MAX - 10).unwrap();
        assert_eq!(b.try_acquire(u64::MAX - 10), Err(Duration::from_millis(10)));
    }
}
