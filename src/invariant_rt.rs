//! Lock-free invariant signalling from software worker threads.
//!
//! A worker cannot touch the locked log in [`invariant_ppt`], so it pushes
//! one-byte signal ids into a bounded `rtrb` ring instead. A full ring drops
//! the signal. The scheduler drains the ring after joining the worker, and
//! tests check the drained ids against contracts.
//!
//! [`invariant_ppt`]: crate::invariant_ppt

use rtrb::{Consumer, Producer, RingBuffer};
use std::fmt;

/// The routine ran a task to completion.
pub const INV_TASK_EXECUTED: u8 = 1;
/// A finished task reached the output channel.
pub const INV_TASK_FORWARDED: u8 = 2;
/// A panicking routine was caught and its task dropped.
pub const INV_KERNEL_PANIC_CONTAINED: u8 = 3;
/// The routine rejected a task.
pub const INV_KERNEL_ERROR: u8 = 4;
pub const INV_PRIORITY_APPLIED: u8 = 5;
/// The worker saw its stop message and exited.
pub const INV_STOP_HONORED: u8 = 6;

/// Signals a worker can leave before the scheduler drains them.
pub const SIGNAL_CAPACITY: usize = 256;

/// Worker end of a signal ring.
pub type SignalTx = Producer<u8>;
/// Scheduler end of a signal ring.
pub type SignalRx = Consumer<u8>;

pub fn signal_channel() -> (SignalTx, SignalRx) {
    RingBuffer::new(SIGNAL_CAPACITY)
}

/// Record `id`. Never blocks or allocates.
#[inline]
pub fn signal(tx: &mut SignalTx, id: u8) {
    let _ = tx.push(id);
}

/// Take every pending signal, oldest first.
pub fn drain_signals(rx: &mut SignalRx) -> Vec<u8> {
    let mut out = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        out.push(id);
    }
    out
}

/// Occurrences of each signal id in a drained batch.
#[derive(Clone, PartialEq, Eq)]
pub struct SignalCounts([u32; 256]);

impl SignalCounts {
    pub fn tally(signals: &[u8]) -> Self {
        let mut counts = [0u32; 256];
        for &id in signals {
            counts[usize::from(id)] += 1;
        }
        Self(counts)
    }

    pub fn get(&self, id: u8) -> u32 {
        self.0[usize::from(id)]
    }
}

impl fmt::Debug for SignalCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                (0..=u8::MAX)
                    .filter(|&id| self.get(id) > 0)
                    .map(|id| (signal_name(id), self.get(id))),
            )
            .finish()
    }
}

/// Panic unless every id in `required` shows up in `signals`.
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = SignalCounts::tally(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts.get(id) == 0)
        .map(|&id| signal_name(id))
        .collect();
    if !missing.is_empty() {
        panic!(
            "worker contract '{}' missing invariants {:?}; saw {:?}",
            contract_name, missing, counts
        );
    }
}

/// Diagnostic name of a signal id.
pub const fn signal_name(id: u8) -> &'static str {
    match id {
        INV_TASK_EXECUTED => "TASK_EXECUTED",
        INV_TASK_FORWARDED => "TASK_FORWARDED",
        INV_KERNEL_PANIC_CONTAINED => "KERNEL_PANIC_CONTAINED",
        INV_KERNEL_ERROR => "KERNEL_ERROR",
        INV_PRIORITY_APPLIED => "PRIORITY_APPLIED",
        INV_STOP_HONORED => "STOP_HONORED",
        _ => "UNKNOWN",
    }
}
