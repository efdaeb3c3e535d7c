//! Per-group circuit breaker
//!
//! Shields a failing origin from further traffic. Transport-level failures
//! (timeouts, refused connections, TLS trouble) trip the breaker; HTTP
//! statuses never do, since the retry loop owns those.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Breaker states: Closed (normal) -> Open (failing) -> HalfOpen (probing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive transport failures before opening.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_duration: Duration,
    /// Probe successes needed to close again.
    pub success_threshold: u32,
    /// Probes admitted while half-open.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_probes: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    probe_successes: u32,
    probes_admitted: u32,
    opened_at: Option<Instant>,
    trips: u64,
}

/// Circuit breaker for a single rate-limit group.
#[derive(Debug)]
pub struct CircuitBreaker {
    group: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(group: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            group: group.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                probes_admitted: 0,
                opened_at: None,
                trips: 0,
            }),
        }
    }

    pub fn with_defaults(group: impl Into<String>) -> Self {
        Self::new(group, BreakerConfig::default())
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Total times the circuit has tripped open.
    pub fn trips(&self) -> u64 {
        self.inner.lock().trips
    }

    /// Whether a request may proceed right now.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed < self.config.open_duration {
                    debug!(group = %self.group, "Circuit open, request blocked");
                    return false;
                }
                info!(group = %self.group, "Circuit half-open, probing");
                inner.state = BreakerState::HalfOpen;
                inner.probe_successes = 0;
                inner.probes_admitted = 1;
                true
            }
            BreakerState::HalfOpen => {
                if inner.probes_admitted < self.config.half_open_max_probes {
                    inner.probes_admitted += 1;
                    true
                } else {
                    debug!(group = %self.group, "Half-open probe budget spent, request blocked");
                    false
                }
            }
        }
    }

    /// Records a completed exchange (any HTTP status).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.success_threshold {
                    info!(group = %self.group, "Circuit recovered, closing");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.probe_successes = 0;
                    inner.probes_admitted = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {
                // A late response from before the trip; leave the circuit be.
            }
        }
    }

    /// Records a transport failure.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        group = %self.group,
                        failures = inner.consecutive_failures,
                        "Circuit tripped open"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.trips += 1;
                }
            }
            BreakerState::HalfOpen => {
                warn!(group = %self.group, "Probe failed, reopening circuit");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_successes = 0;
                inner.probes_admitted = 0;
                inner.trips += 1;
            }
            BreakerState::Open => {}
        }
    }
}
