//! Monotonic time source and the timer wheel used to schedule per-instance
//! deadlines (spec §2, §5, §9: "a min-heap keyed on `sands` is sufficient").

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::types::VirtualRouterId;

/// A monotonic deadline, independent of wall-clock time. Wraps a plain
/// offset rather than `std::time::Instant` directly so that fakes (used in
/// the FSM/sync-group test suite) can construct arbitrary points without a
/// real clock running underneath them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonotonicInstant(Duration);

impl MonotonicInstant {
    pub const ZERO: MonotonicInstant = MonotonicInstant(Duration::ZERO);

    pub fn from_offset(offset: Duration) -> Self {
        MonotonicInstant(offset)
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn saturating_add(&self, delta: Duration) -> MonotonicInstant {
        MonotonicInstant(self.0.saturating_add(delta))
    }

    pub fn saturating_duration_since(&self, earlier: MonotonicInstant) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

/// Boundary interface for time (spec §6: `ClockSource`). The scheduler loop
/// never reads `Instant::now()` directly — everything goes through this
/// trait so tests can drive the FSM/coordinator without real delays.
#[async_trait::async_trait]
pub trait ClockSource: Send + Sync {
    fn now(&self) -> MonotonicInstant;

    /// Suspend until `deadline`. A deadline already in the past returns
    /// immediately (spec §5: "a deadline in the past ... is treated as due
    /// immediately on the next loop iteration").
    async fn sleep_until(&self, deadline: MonotonicInstant);
}

/// Real wall-clock-backed implementation, anchored to an arbitrary
/// `Instant` captured at construction so all `MonotonicInstant`s in a
/// process share one epoch.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ClockSource for SystemClock {
    fn now(&self) -> MonotonicInstant {
        MonotonicInstant::from_offset(self.epoch.elapsed())
    }

    async fn sleep_until(&self, deadline: MonotonicInstant) {
        let now = self.now();
        let wait = deadline.saturating_duration_since(now);
        if wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    deadline: MonotonicInstant,
    instance: VirtualRouterId,
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// Min-heap keyed on an instance's `sands`. Rescheduling is done by pushing
/// a new entry and treating stale pops (an entry whose deadline no longer
/// matches the instance's current `sands`) as no-ops, which is simpler and
/// just as correct as an update-in-place heap (spec §9 design note
/// explicitly allows either).
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<Entry>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn schedule(&mut self, instance: VirtualRouterId, deadline: MonotonicInstant) {
        self.heap.push(Reverse(Entry { deadline, instance }));
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Deadline of the earliest-scheduled entry, if any.
    pub fn peek_deadline(&self) -> Option<MonotonicInstant> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Pop the earliest entry. Callers must re-check the popped instance's
    /// live `sands` against the returned deadline, since intervening
    /// reschedules leave stale heap entries behind.
    pub fn pop(&mut self) -> Option<(VirtualRouterId, MonotonicInstant)> {
        self.heap.pop().map(|Reverse(e)| (e.instance, e.deadline))
    }
}
