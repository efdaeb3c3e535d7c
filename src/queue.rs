//! Bounded retry queue
//!
//! Requests whose admission delay exceeds the deferral threshold wait here
//! instead of sleeping. Three bounded FIFOs, one per priority tier; a full
//! tier rejects the enqueue immediately (backpressure is a throttling signal,
//! not a wait). At most one pump drains the queue at a time, high tier first,
//! with a bounded number of dequeues per tier per round so lower tiers cannot
//! starve.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::Priority;
use crate::error::{Error, Result};
use crate::request::PreparedRequest;
use crate::response::ResponseView;

/// Default capacity of each priority tier.
pub const DEFAULT_TIER_CAPACITY: usize = 25;

/// Queued-request ids wrap back to 1 at this ceiling.
const ID_CEILING: u32 = u32::MAX / 2;

/// Dequeue order within one pump round.
pub(crate) const TIER_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

/// Pump rounds per activation.
pub(crate) const PUMP_ROUNDS: usize = 3;

/// Dequeues allowed per tier per round; bounds priority starvation.
pub(crate) const DEQUEUES_PER_TIER: usize = 3;

/// Pause between dequeues, plus up to [`DRAIN_JITTER_MS`] of jitter.
pub(crate) const DRAIN_PAUSE_MS: u64 = 100;
pub(crate) const DRAIN_JITTER_MS: u64 = 10;

/// Delay before the next pump activation when work remains queued.
pub(crate) const REPUMP_DELAY_MS: u64 = 1_000;

/// A deferred request parked in the queue, owning its caller's waiter.
pub(crate) struct QueuedRequest {
    pub id: u32,
    pub request: PreparedRequest,
    pub queued_at: Instant,
    waiter: oneshot::Sender<Result<ResponseView>>,
}

impl QueuedRequest {
    pub fn new(
        id: u32,
        request: PreparedRequest,
        waiter: oneshot::Sender<Result<ResponseView>>,
    ) -> Self {
        Self {
            id,
            request,
            queued_at: Instant::now(),
            waiter,
        }
    }

    /// Completes the caller's future. Send failure means the caller has
    /// already gone away (cancelled and dropped the receiver).
    pub fn settle(self, result: Result<ResponseView>) {
        let _ = self.waiter.send(result);
    }
}

impl std::fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("priority", &self.request.priority)
            .field("url", &self.request.url.as_str())
            .finish_non_exhaustive()
    }
}

/// Three bounded FIFOs with a single-pump guard.
pub(crate) struct RetryQueue {
    tiers: [Mutex<VecDeque<QueuedRequest>>; 3],
    capacity: usize,
    pump_active: AtomicBool,
    next_id: AtomicU32,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tiers: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
            capacity: capacity.max(1),
            pump_active: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocates a monotonic request id, wrapping at the ceiling.
    pub fn next_id(&self) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id >= ID_CEILING {
            self.next_id.store(2, Ordering::Relaxed);
            return 1;
        }
        id
    }

    /// Parks a request in its priority tier. A full tier returns the request
    /// back to the caller, who surfaces backpressure.
    pub fn add(&self, qr: QueuedRequest) -> std::result::Result<(), QueuedRequest> {
        let tier = &self.tiers[qr.request.priority.tier_index()];
        let mut guard = tier.lock();
        if guard.len() >= self.capacity {
            debug!(
                id = qr.id,
                priority = ?qr.request.priority,
                capacity = self.capacity,
                "Retry queue tier full, rejecting enqueue"
            );
            return Err(qr);
        }
        debug!(
            id = qr.id,
            priority = ?qr.request.priority,
            depth = guard.len() + 1,
            "Request parked in retry queue"
        );
        guard.push_back(qr);
        Ok(())
    }

    /// Dequeues the oldest request of the given tier.
    pub fn pop(&self, priority: Priority) -> Option<QueuedRequest> {
        self.tiers[priority.tier_index()].lock().pop_front()
    }

    /// Returns a just-popped request to the head of its tier, preserving
    /// FIFO order. The capacity check does not apply: the request already
    /// held its slot, so requeueing never fails.
    pub fn requeue_front(&self, qr: QueuedRequest) {
        self.tiers[qr.request.priority.tier_index()]
            .lock()
            .push_front(qr);
    }

    /// Removes a parked request by id.
    pub fn remove(&self, id: u32) -> Option<QueuedRequest> {
        for tier in &self.tiers {
            let mut guard = tier.lock();
            if let Some(pos) = guard.iter().position(|qr| qr.id == id) {
                return guard.remove(pos);
            }
        }
        None
    }

    /// Removes a parked request, cancels it, and settles its waiter.
    /// Returns false when the id is no longer queued.
    pub fn abort(&self, id: u32) -> bool {
        match self.remove(id) {
            Some(qr) => {
                qr.request.abort.cancel();
                qr.settle(Err(Error::Cancelled));
                true
            }
            None => false,
        }
    }

    pub fn tier_len(&self, priority: Priority) -> usize {
        self.tiers[priority.tier_index()].lock().len()
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(|t| t.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the pump. Exactly one claimant succeeds until `end_pump`.
    pub fn try_begin_pump(&self) -> bool {
        self.pump_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_pump(&self) {
        self.pump_active.store(false, Ordering::Release);
    }
}
