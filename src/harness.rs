//! Test harness: recording devices, a fake-clocked scheduler, and a
//! counting software kernel.

use crate::clock::FakeClock;
use crate::config::SchedulerConfig;
use crate::device::{ContextDescriptor, DeviceHandle, DeviceId, DeviceOp, DeviceSpec};
use crate::error::AllocError;
use crate::kernel::SoftwareKernel;
use crate::primitive::{Primitive, PrimitiveParams, TaskDescriptor};
use crate::request::{ArgumentBlock, Priority, VirtualRequest};
use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct LogInner {
    entries: Vec<(DeviceOp, ContextDescriptor)>,
    fail: HashSet<DeviceOp>,
}

/// Shared view of every ioctl a [`RecordingDevice`] received.
#[derive(Debug, Clone, Default)]
pub struct DeviceLog(Arc<Mutex<LogInner>>);

impl DeviceLog {
    pub fn ops(&self) -> Vec<DeviceOp> {
        self.0.lock().entries.iter().map(|(op, _)| *op).collect()
    }

    /// Descriptor of the most recent ioctl.
    pub fn last(&self) -> Option<ContextDescriptor> {
        self.0.lock().entries.last().map(|(_, d)| d.clone())
    }

    pub fn entries(&self) -> Vec<(DeviceOp, ContextDescriptor)> {
        self.0.lock().entries.clone()
    }

    /// Make every future `op` fail.
    pub fn fail_on(&self, op: DeviceOp) {
        self.0.lock().fail.insert(op);
    }

    pub fn count(&self, op: DeviceOp) -> usize {
        self.0.lock().entries.iter().filter(|(o, _)| *o == op).count()
    }
}

/// Device handle that records ioctls and fails on request.
#[derive(Debug)]
pub struct RecordingDevice {
    log: DeviceLog,
}

impl RecordingDevice {
    pub fn new() -> (Self, DeviceLog) {
        let log = DeviceLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl DeviceHandle for RecordingDevice {
    fn ioctl(&mut self, op: DeviceOp, desc: &ContextDescriptor) -> Result<(), String> {
        let mut inner = self.log.0.lock();
        inner.entries.push((op, desc.clone()));
        if inner.fail.contains(&op) {
            Err(format!("injected {:?} failure", op))
        } else {
            Ok(())
        }
    }
}

/// Recording devices for `primitives`, ready to hand to a probe.
pub fn recording_inventory(primitives: &[Primitive]) -> (Vec<DeviceSpec>, Vec<DeviceLog>) {
    primitives
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let (dev, log) = RecordingDevice::new();
            (DeviceSpec::new(format!("{}{}", p, i), p, dev), log)
        })
        .unzip()
}

/// A scheduler over recording devices with a fake clock.
pub struct ArbiterHarness {
    pub scheduler: Scheduler,
    pub clock: FakeClock,
    logs: Vec<(DeviceId, DeviceLog)>,
}

impl ArbiterHarness {
    pub fn new(primitives: &[Primitive]) -> Self {
        Self::with_config(SchedulerConfig::default(), primitives)
    }

    pub fn with_config(config: SchedulerConfig, primitives: &[Primitive]) -> Self {
        let clock = FakeClock::new(0);
        let mut scheduler = Scheduler::new(config.with_clock(clock.clone()));
        let (specs, logs) = recording_inventory(primitives);
        let logs = specs
            .into_iter()
            .zip(logs)
            .map(|(spec, log)| (scheduler.add_device(spec), log))
            .collect();
        Self {
            scheduler,
            clock,
            logs,
        }
    }

    pub fn log(&self, device: DeviceId) -> Option<&DeviceLog> {
        self.logs.iter().find(|(id, _)| *id == device).map(|(_, log)| log)
    }

    /// Build and search a request. Out-of-range priorities clamp to 1..=10.
    pub fn request(
        &mut self,
        primitive: Primitive,
        priority: u8,
        args: ArgumentBlock,
    ) -> Result<VirtualRequest, AllocError> {
        let priority = Priority::new(priority.clamp(1, 10)).unwrap_or_default();
        let mut request = VirtualRequest::new(primitive, priority, args);
        self.scheduler.search(&mut request)?;
        Ok(request)
    }
}

/// Software kernel that counts executed tasks, optionally panicking on one.
#[derive(Debug, Clone, Default)]
pub struct CountingKernel {
    executed: Arc<AtomicU64>,
    panic_on: Option<u64>,
}

impl CountingKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panic when the task with sequence number `seq` arrives.
    pub fn panicking_on(seq: u64) -> Self {
        Self {
            panic_on: Some(seq),
            ..Self::default()
        }
    }

    /// Tasks executed across every worker sharing this kernel.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }
}

impl SoftwareKernel for CountingKernel {
    type State = u64;

    fn init_state(&self, _params: &PrimitiveParams) -> u64 {
        0
    }

    fn execute(&self, seen: &mut u64, task: &TaskDescriptor) -> Result<(), &'static str> {
        if self.panic_on == Some(task.seq) {
            panic!("injected kernel panic on task {}", task.seq);
        }
        *seen += 1;
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
