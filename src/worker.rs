//! CPU fallback workers: a software routine polling a task queue.

// IMPORTANT: Do not call assert_invariant or any PPT logging on the worker
// thread; use `invariant_rt` signals instead.

use crate::control::{new_control_queue, WorkerMsg};
use crate::device::{ContextDescriptor, DeviceHandle, DeviceOp};
use crate::error::AllocError;
use crate::invariant_rt::{
    drain_signals, signal, signal_channel, SignalRx, SignalTx, INV_KERNEL_ERROR,
    INV_KERNEL_PANIC_CONTAINED, INV_PRIORITY_APPLIED, INV_STOP_HONORED, INV_TASK_EXECUTED,
    INV_TASK_FORWARDED,
};
use crate::kernel::SoftwareKernelDyn;
use crate::primitive::{Primitive, PrimitiveParams, TaskDescriptor};
use crate::queue::{Consumer, Producer};
use crossbeam_utils::Backoff;
use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Counters reported by a joined worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub executed: u64,
    pub failed: u64,
    pub forwarded: u64,
    /// Priority in force when the worker exited.
    pub priority: u8,
}

/// Device handle of a CPU fallback entry.
///
/// `set_priority` and `delete_context` become control messages; the other
/// operations have nothing to do on a CPU.
pub struct SoftwareHandle {
    control: rtrb::Producer<WorkerMsg>,
}

impl DeviceHandle for SoftwareHandle {
    fn ioctl(&mut self, op: DeviceOp, desc: &ContextDescriptor) -> Result<(), String> {
        match op {
            DeviceOp::SetPriority => {
                let msg = WorkerMsg::SetPriority {
                    priority: desc.priority,
                };
                self.control
                    .push(msg)
                    .map_err(|_| format!("worker control queue full, dropped {}", msg.description()))
            }
            DeviceOp::DeleteContext => {
                // The worker drains control messages between tasks, so a full
                // queue clears unless the thread is already gone.
                let backoff = Backoff::new();
                while self.control.push(WorkerMsg::Stop).is_err() {
                    if self.control.is_abandoned() {
                        break;
                    }
                    backoff.snooze();
                }
                Ok(())
            }
            DeviceOp::Reset | DeviceOp::Init | DeviceOp::AddContext => Ok(()),
        }
    }
}

/// Scheduler-side handle of a running worker thread.
pub struct SoftwareWorker {
    primitive: Primitive,
    thread: Option<JoinHandle<WorkerStats>>,
    signals: SignalRx,
}

impl SoftwareWorker {
    /// Spawn a worker running `kernel` over tasks popped from `input`,
    /// forwarding finished tasks to `output` when present.
    pub fn spawn(
        primitive: Primitive,
        kernel: Arc<dyn SoftwareKernelDyn>,
        params: PrimitiveParams,
        priority: u8,
        input: Consumer<TaskDescriptor>,
        output: Option<Producer<TaskDescriptor>>,
    ) -> Result<(SoftwareWorker, SoftwareHandle), AllocError> {
        let (control_tx, control_rx) = new_control_queue();
        let (signal_tx, signal_rx) = signal_channel();
        let runtime = WorkerRuntime {
            kernel,
            params,
            priority,
            input,
            output,
            control: control_rx,
            signals: signal_tx,
            stopping: false,
        };
        let thread = thread::Builder::new()
            .name(format!("sw-{}", primitive))
            .spawn(move || runtime.run())
            .map_err(|e| AllocError::Spawn(e.to_string()))?;
        Ok((
            SoftwareWorker {
                primitive,
                thread: Some(thread),
                signals: signal_rx,
            },
            SoftwareHandle {
                control: control_tx,
            },
        ))
    }

    pub fn primitive(&self) -> Primitive {
        self.primitive
    }

    /// Wait for the thread to exit. Call after the stop message was sent.
    ///
    /// Returns the worker's counters and the invariant ids it signalled.
    pub fn join(mut self) -> (WorkerStats, Vec<u8>) {
        let stats = match self.thread.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            _ => WorkerStats::default(),
        };
        let signals = drain_signals(&mut self.signals);
        (stats, signals)
    }
}

impl std::fmt::Debug for SoftwareWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareWorker")
            .field("primitive", &self.primitive)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

struct WorkerRuntime {
    kernel: Arc<dyn SoftwareKernelDyn>,
    params: PrimitiveParams,
    priority: u8,
    input: Consumer<TaskDescriptor>,
    output: Option<Producer<TaskDescriptor>>,
    control: rtrb::Consumer<WorkerMsg>,
    signals: SignalTx,
    /// A stop arrived while a task was waiting on backpressure.
    stopping: bool,
}

impl WorkerRuntime {
    fn run(mut self) -> WorkerStats {
        let mut state = self.kernel.init_state(&self.params);
        let mut stats = WorkerStats {
            priority: self.priority,
            ..WorkerStats::default()
        };
        let backoff = Backoff::new();
        loop {
            if self.stopping || apply_control(&mut self.control, &mut self.signals, &mut stats) {
                // Finish what is already queued, without waiting on
                // downstream backpressure.
                while let Some(task) = self.input.pop() {
                    self.process(&mut *state, task, &mut stats, false);
                }
                signal(&mut self.signals, INV_STOP_HONORED);
                return stats;
            }
            match self.input.pop() {
                Some(task) => {
                    backoff.reset();
                    self.process(&mut *state, task, &mut stats, true);
                }
                None => {
                    // Scheduler dropped the device entry without a stop message.
                    if self.control.is_abandoned() && self.control.is_empty() {
                        return stats;
                    }
                    backoff.snooze();
                }
            }
        }
    }

    fn process(&mut self, state: &mut dyn Any, task: TaskDescriptor, stats: &mut WorkerStats, wait: bool) {
        let kernel = &self.kernel;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            kernel.execute(state, &task)
        }));
        match result {
            Ok(Ok(())) => {
                stats.executed += 1;
                signal(&mut self.signals, INV_TASK_EXECUTED);
            }
            Ok(Err(_)) => {
                stats.failed += 1;
                signal(&mut self.signals, INV_KERNEL_ERROR);
                return;
            }
            Err(_) => {
                // Fail closed: drop the task.
                stats.failed += 1;
                signal(&mut self.signals, INV_KERNEL_PANIC_CONTAINED);
                return;
            }
        }
        let WorkerRuntime {
            output,
            control,
            signals,
            stopping,
            ..
        } = self;
        let Some(output) = output.as_mut() else {
            return;
        };
        let backoff = Backoff::new();
        loop {
            if output.push(task) {
                stats.forwarded += 1;
                signal(signals, INV_TASK_FORWARDED);
                return;
            }
            if !wait || *stopping {
                return;
            }
            // Priority changes are applied in place; only a stop or a vanished
            // scheduler ends the wait on a full output queue.
            if apply_control(control, signals, stats) {
                *stopping = true;
                return;
            }
            if control.is_abandoned() && control.is_empty() {
                return;
            }
            backoff.snooze();
        }
    }
}

/// Apply pending control messages. Returns `true` once a stop was popped.
fn apply_control(control: &mut rtrb::Consumer<WorkerMsg>, signals: &mut SignalTx, stats: &mut WorkerStats) -> bool {
    while let Ok(msg) = control.pop() {
        match msg {
            WorkerMsg::SetPriority { priority } => {
                stats.priority = priority;
                signal(signals, INV_PRIORITY_APPLIED);
            }
            WorkerMsg::Stop => return true,
        }
    }
    false
}
