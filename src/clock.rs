//! Cycle counters behind a monotonic-clock seam.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of monotonically increasing cycle counts.
pub trait Clock: Send + Sync {
    /// Current cycle count.
    fn now(&self) -> u64;
}

/// Wall-clock backed counter; one cycle per elapsed nanosecond.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Deterministic clock advanced by hand.
///
/// Clones share the same counter, so a test can keep one copy and hand
/// another to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    cycles: Arc<AtomicU64>,
}

impl FakeClock {
    pub fn new(start: u64) -> Self {
        Self {
            cycles: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Move the clock forward by `delta` cycles.
    pub fn advance(&self, delta: u64) {
        self.cycles.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }
}
