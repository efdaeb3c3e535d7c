//! Quota intervals
//!
//! The accounting engine tracks one counter window per interval. The set is
//! closed, so windows live in a fixed-size array indexed by `Interval::index`
//! rather than a map.

use std::time::Duration;

/// A fixed duration label for one rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    /// Short smoothing window (100 ms).
    Burst,
    Second,
    Minute,
    Hour,
    Day,
}

impl Interval {
    /// All intervals, in array-index order.
    pub const ALL: [Interval; 5] = [
        Interval::Burst,
        Interval::Second,
        Interval::Minute,
        Interval::Hour,
        Interval::Day,
    ];

    /// Number of intervals.
    pub const COUNT: usize = Self::ALL.len();

    /// Window length in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        match self {
            Interval::Burst => 100,
            Interval::Second => 1_000,
            Interval::Minute => 60_000,
            Interval::Hour => 3_600_000,
            Interval::Day => 86_400_000,
        }
    }

    /// Window length as a [`Duration`].
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms())
    }

    /// Stable position in [`Interval::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Interval::Burst => 0,
            Interval::Second => 1,
            Interval::Minute => 2,
            Interval::Hour => 3,
            Interval::Day => 4,
        }
    }

    /// Maps a `w=<period>` value (seconds) from a limit header to an interval.
    ///
    /// The burst window has no wire representation and is addressed by the
    /// bare leading integer of the header grammar instead.
    pub fn from_window_period(seconds: u64) -> Option<Interval> {
        match seconds {
            1 => Some(Interval::Second),
            60 => Some(Interval::Minute),
            3_600 => Some(Interval::Hour),
            86_400 => Some(Interval::Day),
            _ => None,
        }
    }

    /// The `w=<period>` value (seconds) used on the wire, if any.
    pub fn window_period(&self) -> Option<u64> {
        match self {
            Interval::Burst => None,
            other => Some(other.duration_ms() / 1_000),
        }
    }
}
