//! Control message types for scheduler → software worker communication.
//!
//! The scheduler reaches a CPU fallback worker through the same ioctl path
//! as a hardware device; the worker's device handle turns `set_priority`
//! and `delete_context` into these messages on a lock-free SPSC queue. The
//! worker drains the queue between tasks.

use rtrb::{Consumer, Producer, RingBuffer};

/// Capacity for the worker control queue.
pub const CONTROL_QUEUE_CAPACITY: usize = 16;

/// Creates a new control message queue pair.
///
/// Returns (producer for the scheduler, consumer for the worker).
pub fn new_control_queue() -> (Producer<WorkerMsg>, Consumer<WorkerMsg>) {
    RingBuffer::new(CONTROL_QUEUE_CAPACITY)
}

/// Control messages sent to a software worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMsg {
    /// Live re-prioritization of the worker's context.
    SetPriority {
        /// New priority, 1..=10.
        priority: u8,
    },

    /// Finish the queued tasks and exit.
    Stop,
}

impl WorkerMsg {
    /// Returns a human-readable description (for debugging).
    pub fn description(&self) -> &'static str {
        match self {
            WorkerMsg::SetPriority { .. } => "SetPriority",
            WorkerMsg::Stop => "Stop",
        }
    }
}
