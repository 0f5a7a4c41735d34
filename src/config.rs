//! Scheduler configuration.

use crate::clock::{Clock, MonotonicClock};
use crate::device::Coherence;
use crate::kernel::{SoftwareKernel, SoftwareRegistry};
use crate::primitive::Primitive;
use crate::queue::MIN_QUEUE_CAPACITY;
use crate::registry::CapabilityRegistry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How threads wait on the request/response handshake.
///
/// Only the handshake is affected; queues and flags always spin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Cooperative busy-wait.
    #[default]
    Spin,
    /// Park on a condition variable between polls.
    Park,
}

/// Everything the scheduler thread is built from.
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Slots per task queue allocated for dataflow edges.
    pub queue_capacity: usize,
    /// Scheduling quantum written into every context descriptor, in cycles.
    pub quantum: u32,
    pub coherence: Coherence,
    pub allow_cpu_fallback: bool,
    pub wait_strategy: WaitStrategy,
    /// Bound on acquiring the request slot. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    pub software: SoftwareRegistry,
    pub registry: CapabilityRegistry,
    pub clock: Arc<dyn Clock>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            quantum: 4096,
            coherence: Coherence::default(),
            allow_cpu_fallback: true,
            wait_strategy: WaitStrategy::default(),
            acquire_timeout: None,
            software: SoftwareRegistry::default(),
            registry: CapabilityRegistry::default(),
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl SchedulerConfig {
    /// Values below [`MIN_QUEUE_CAPACITY`] are raised to it.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(MIN_QUEUE_CAPACITY);
        self
    }

    pub fn with_quantum(mut self, quantum: u32) -> Self {
        self.quantum = quantum;
        self
    }

    pub fn with_coherence(mut self, coherence: Coherence) -> Self {
        self.coherence = coherence;
        self
    }

    pub fn with_cpu_fallback(mut self, allow: bool) -> Self {
        self.allow_cpu_fallback = allow;
        self
    }

    pub fn with_wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Register the CPU routine used when `primitive` falls back to software.
    pub fn with_software<K: SoftwareKernel>(mut self, primitive: Primitive, kernel: K) -> Self {
        self.software.register(primitive, kernel);
        self
    }

    pub fn with_registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("queue_capacity", &self.queue_capacity)
            .field("quantum", &self.quantum)
            .field("coherence", &self.coherence)
            .field("allow_cpu_fallback", &self.allow_cpu_fallback)
            .field("wait_strategy", &self.wait_strategy)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("software", &self.software)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
