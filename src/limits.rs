//! Per-group rate-limit accounting
//!
//! A [`GroupLimits`] owns one [`Window`] per [`Interval`] for a single
//! endpoint group. Dispatches fan out to every window; the admission delay is
//! the worst window's delay, folded with any server-mandated penalty from a
//! `Retry-After`, and clamped so pathological waits become enqueues instead.
//!
//! Quotas adapt at runtime from `X-RateLimit-Limit` announcements.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use http::HeaderMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::headers::{self, LimitSpec};
use crate::interval::Interval;
use crate::window::{Window, DELAY_FLOOR_MS};

/// Delays at or above this are never slept through by admission; the overall
/// group delay is clamped just below it.
pub const GROUP_DELAY_CEILING_MS: u64 = 30_000;

/// Default quotas applied to a group before any header announcement.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupQuotas {
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_second")]
    pub second: u32,
    #[serde(default = "default_minute")]
    pub minute: u32,
    #[serde(default = "default_hour")]
    pub hour: u32,
    #[serde(default = "default_day")]
    pub day: u32,
}

fn default_burst() -> u32 {
    10
}

fn default_second() -> u32 {
    10
}

fn default_minute() -> u32 {
    250
}

fn default_hour() -> u32 {
    5_000
}

fn default_day() -> u32 {
    50_000
}

impl Default for GroupQuotas {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            second: default_second(),
            minute: default_minute(),
            hour: default_hour(),
            day: default_day(),
        }
    }
}

impl GroupQuotas {
    pub fn for_interval(&self, interval: Interval) -> u32 {
        match interval {
            Interval::Burst => self.burst,
            Interval::Second => self.second,
            Interval::Minute => self.minute,
            Interval::Hour => self.hour,
            Interval::Day => self.day,
        }
    }
}

struct LimitsInner {
    windows: [Window; Interval::COUNT],
    /// Server-mandated wait absorbed from a 429 `Retry-After`. Folded into
    /// the admission delay until it passes.
    penalty_until: Option<Instant>,
}

/// Rate-limit state for one endpoint group.
pub struct GroupLimits {
    group: String,
    inner: Mutex<LimitsInner>,
}

impl GroupLimits {
    pub fn new(group: impl Into<String>, quotas: &GroupQuotas) -> Self {
        let windows =
            Interval::ALL.map(|interval| Window::new(interval, quotas.for_interval(interval)));
        Self {
            group: group.into(),
            inner: Mutex::new(LimitsInner {
                windows,
                penalty_until: None,
            }),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Records one dispatched request in every window.
    pub fn increment(&self) {
        let mut inner = self.inner.lock();
        for window in inner.windows.iter_mut() {
            window.increment();
        }
    }

    /// Milliseconds to wait before the next send that respects every window,
    /// clamped to `[DELAY_FLOOR_MS, GROUP_DELAY_CEILING_MS)`.
    pub fn calculate_delay(&self) -> u64 {
        let mut inner = self.inner.lock();

        let mut delay = inner
            .windows
            .iter_mut()
            .map(Window::calculate_delay)
            .max()
            .unwrap_or(DELAY_FLOOR_MS);

        if let Some(until) = inner.penalty_until {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                inner.penalty_until = None;
            } else {
                delay = delay.max(remaining.as_millis() as u64);
            }
        }

        delay.clamp(DELAY_FLOOR_MS, GROUP_DELAY_CEILING_MS - 1)
    }

    /// Whether a send fits within the given deferral budget.
    pub fn can_send(&self, max_deferral_ms: u64) -> bool {
        self.calculate_delay() <= max_deferral_ms
    }

    /// Fewest remaining requests across all windows.
    pub fn requests_remaining(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner
            .windows
            .iter_mut()
            .map(Window::requests_remaining)
            .min()
            .unwrap_or(0)
    }

    /// Applies quota announcements from response headers.
    ///
    /// Missing pairs leave their window untouched; a malformed value is
    /// dropped with a debug trace and never fails the request.
    pub fn absorb(&self, response_headers: &HeaderMap) {
        let Some(raw) = response_headers.get(headers::RATE_LIMIT_LIMIT) else {
            return;
        };

        let spec = raw.to_str().ok().and_then(LimitSpec::parse);
        let Some(spec) = spec else {
            debug!(
                group = %self.group,
                header = ?raw,
                "Ignoring malformed rate-limit announcement"
            );
            return;
        };

        self.apply_spec(&spec);
    }

    /// Applies a parsed quota announcement.
    pub fn apply_spec(&self, spec: &LimitSpec) {
        let mut inner = self.inner.lock();

        inner.windows[Interval::Burst.index()].set_quota(spec.burst_quota());
        for (interval, quota) in &spec.windows {
            inner.windows[interval.index()].set_quota(*quota);
        }

        debug!(
            group = %self.group,
            quotas = %spec.emit(),
            "Adopted announced rate limits"
        );
    }

    /// Records a server-mandated wait. The deadline is folded into
    /// [`GroupLimits::calculate_delay`] until it passes; deadlines only ever
    /// extend, never shrink.
    pub fn apply_retry_after(&self, retry_after_ms: u64) {
        let until = Instant::now() + Duration::from_millis(retry_after_ms);
        let mut inner = self.inner.lock();
        let extended = match inner.penalty_until {
            Some(existing) => existing.max(until),
            None => until,
        };
        inner.penalty_until = Some(extended);

        debug!(
            group = %self.group,
            retry_after_ms,
            "Recorded server-mandated wait"
        );
    }

    /// Earliest instant any window rolls over.
    pub fn next_reset(&self) -> Instant {
        let inner = self.inner.lock();
        inner
            .windows
            .iter()
            .map(Window::resets_at)
            .min()
            .unwrap_or_else(Instant::now)
    }

    /// Rolls over any window whose reset instant has passed. Advisory: the
    /// lazy per-observation roll keeps counters correct without it.
    pub fn reset_expired(&self) {
        let mut inner = self.inner.lock();
        for window in inner.windows.iter_mut() {
            window.requests_remaining();
        }
    }

    /// Point-in-time view of every window.
    pub fn snapshot(&self) -> GroupSnapshot {
        let mut inner = self.inner.lock();

        let penalty_ms = inner
            .penalty_until
            .map(|until| {
                until
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64
            })
            .unwrap_or(0);

        let windows = inner
            .windows
            .iter_mut()
            .map(|w| WindowSnapshot {
                interval: w.interval(),
                quota: w.quota(),
                count: w.count(),
                remaining: w.requests_remaining(),
            })
            .collect();

        GroupSnapshot {
            group: self.group.clone(),
            windows,
            penalty_ms,
        }
    }

    /// Spawns the advisory reset task for this group. It wakes at each
    /// earliest rollover and exits once the group is dropped.
    pub(crate) fn spawn_reset_task(this: &Arc<GroupLimits>) {
        let weak: Weak<GroupLimits> = Arc::downgrade(this);
        tokio::spawn(async move {
            loop {
                let next = {
                    let Some(limits) = weak.upgrade() else { break };
                    limits.next_reset()
                };
                let floor = Instant::now() + Duration::from_millis(DELAY_FLOOR_MS);
                tokio::time::sleep_until(tokio::time::Instant::from_std(next.max(floor))).await;

                let Some(limits) = weak.upgrade() else { break };
                limits.reset_expired();
            }
        });
    }
}

impl std::fmt::Debug for GroupLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupLimits")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of one window.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub interval: Interval,
    pub quota: u32,
    pub count: u32,
    pub remaining: u32,
}

/// Point-in-time view of one group's accounting state.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub group: String,
    pub windows: Vec<WindowSnapshot>,
    pub penalty_ms: u64,
}

impl GroupSnapshot {
    /// Snapshot of a single interval's window.
    pub fn window(&self, interval: Interval) -> Option<&WindowSnapshot> {
        self.windows.iter().find(|w| w.interval == interval)
    }
}
