//! Single time-bucket accounting
//!
//! A [`Window`] is one active bucket for one (group, interval) pair: a quota,
//! a monotonic count, and the instant the bucket rolls over. Every
//! observation checks for expiry first, so correctness never depends on an
//! external timer firing.

use std::time::Instant;

use crate::interval::Interval;

/// Smallest delay ever reported, in milliseconds.
///
/// A strictly zero delay would let callers bypass the scheduler entirely, so
/// even an open window reports this floor to smooth bursts.
pub const DELAY_FLOOR_MS: u64 = 10;

/// One time-bounded counter for a single interval.
#[derive(Debug)]
pub struct Window {
    interval: Interval,
    quota: u32,
    count: u32,
    opened_at: Instant,
    resets_at: Instant,
}

impl Window {
    /// Creates an open window with the given quota (clamped to at least 1).
    pub fn new(interval: Interval, quota: u32) -> Self {
        let now = Instant::now();
        Self {
            interval,
            quota: quota.max(1),
            count: 0,
            opened_at: now,
            resets_at: now + interval.duration(),
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Instant at which the current bucket expires.
    pub fn resets_at(&self) -> Instant {
        self.resets_at
    }

    /// Opens a fresh bucket starting now.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.opened_at = now;
        self.resets_at = now + self.interval.duration();
        self.count = 0;
    }

    /// Rolls the bucket over if its reset instant has passed.
    ///
    /// Called before every observation so stale buckets never serve a
    /// request, whether or not the advisory reset task ran.
    fn roll_if_expired(&mut self) {
        if Instant::now() >= self.resets_at {
            self.reset();
        }
    }

    /// Records one dispatched request in this bucket.
    pub fn increment(&mut self) {
        self.roll_if_expired();
        self.count = self.count.saturating_add(1);
    }

    /// Requests still permitted in the current bucket.
    pub fn requests_remaining(&mut self) -> u32 {
        self.roll_if_expired();
        self.quota.saturating_sub(self.count)
    }

    /// Milliseconds a caller must wait before the next send that respects
    /// this window. Returns [`DELAY_FLOOR_MS`] while capacity remains,
    /// otherwise the time until the bucket rolls over.
    pub fn calculate_delay(&mut self) -> u64 {
        if self.requests_remaining() > 0 {
            return DELAY_FLOOR_MS;
        }
        let until_reset = self
            .resets_at
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        until_reset.max(DELAY_FLOOR_MS)
    }

    /// Whether a send is possible within the given deferral budget.
    pub fn can_send(&mut self, max_deferral_ms: u64) -> bool {
        self.requests_remaining() > 0 || self.calculate_delay() <= max_deferral_ms
    }

    /// Updates the quota (clamped to at least 1). The count is left alone;
    /// it may exceed the new quota until the next rollover clears it.
    pub fn set_quota(&mut self, quota: u32) {
        self.quota = quota.max(1);
    }
}
