//! Contract tests for CPU worker invariant signalling.
//!
//! Each test drives a worker with deterministic input, joins it and checks
//! the signals it left behind.

use accel_arbiter::device::{ContextDescriptor, ContextId};
use accel_arbiter::harness::CountingKernel;
use accel_arbiter::invariant_rt::{
    contract_test_rt, INV_KERNEL_ERROR, INV_KERNEL_PANIC_CONTAINED, INV_PRIORITY_APPLIED,
    INV_STOP_HONORED, INV_TASK_EXECUTED, INV_TASK_FORWARDED,
};
use accel_arbiter::queue::Producer;
use accel_arbiter::worker::{SoftwareHandle, SoftwareWorker, WorkerStats};
use accel_arbiter::{
    DeviceHandle, DeviceOp, Primitive, PrimitiveParams, SoftwareKernel, TaskDescriptor, TaskQueue,
};
use std::sync::Arc;

fn params() -> PrimitiveParams {
    PrimitiveParams::gemm(8, 8, 8)
}

fn spawn<K: SoftwareKernel>(
    kernel: K,
    forward: bool,
) -> (SoftwareWorker, SoftwareHandle, Producer<TaskDescriptor>) {
    let input = TaskQueue::with_capacity(64);
    let output = TaskQueue::with_capacity(64);
    let tx = input.try_producer().unwrap();
    let (worker, handle) = SoftwareWorker::spawn(
        Primitive::Gemm,
        Arc::new(kernel),
        params(),
        3,
        input.try_consumer().unwrap(),
        if forward { output.try_producer() } else { None },
    )
    .unwrap();
    (worker, handle, tx)
}

fn stop(worker: SoftwareWorker, mut handle: SoftwareHandle) -> (WorkerStats, Vec<u8>) {
    let desc = ContextDescriptor::new(Primitive::None, ContextId(0));
    handle.ioctl(DeviceOp::DeleteContext, &desc).unwrap();
    worker.join()
}

struct Rejecting;

impl SoftwareKernel for Rejecting {
    type State = ();

    fn init_state(&self, _params: &PrimitiveParams) {}

    fn execute(&self, _state: &mut (), task: &TaskDescriptor) -> Result<(), &'static str> {
        if task.seq % 2 == 1 {
            Err("odd task rejected")
        } else {
            Ok(())
        }
    }
}

#[test]
fn contract_tasks_executed_and_forwarded() {
    let (worker, handle, mut tx) = spawn(CountingKernel::new(), true);
    for seq in 0..10 {
        assert!(tx.push(TaskDescriptor::new(seq, params())));
    }
    let (stats, signals) = stop(worker, handle);

    contract_test_rt(
        "tasks executed and forwarded",
        &signals,
        &[INV_TASK_EXECUTED, INV_TASK_FORWARDED, INV_STOP_HONORED],
    );
    assert_eq!(stats.executed, 10);
    assert_eq!(stats.forwarded, 10);
    let executed = signals.iter().filter(|&&id| id == INV_TASK_EXECUTED).count();
    assert_eq!(executed, 10);
}

#[test]
fn contract_no_forward_signal_without_output() {
    let (worker, handle, mut tx) = spawn(CountingKernel::new(), false);
    assert!(tx.push(TaskDescriptor::new(0, params())));
    let (stats, signals) = stop(worker, handle);

    assert!(signals.contains(&INV_TASK_EXECUTED));
    assert!(
        !signals.contains(&INV_TASK_FORWARDED),
        "TASK_FORWARDED should not fire when there is no output channel"
    );
    assert_eq!(stats.forwarded, 0);
}

#[test]
fn contract_priority_applied() {
    let (worker, mut handle, _tx) = spawn(CountingKernel::new(), false);
    let mut desc = ContextDescriptor::new(Primitive::None, ContextId(0));
    desc.priority = 8;
    handle.ioctl(DeviceOp::SetPriority, &desc).unwrap();
    let (stats, signals) = stop(worker, handle);

    contract_test_rt("priority applied", &signals, &[INV_PRIORITY_APPLIED, INV_STOP_HONORED]);
    assert_eq!(stats.priority, 8);
}

#[test]
fn contract_kernel_errors_are_counted() {
    let (worker, handle, mut tx) = spawn(Rejecting, true);
    for seq in 0..4 {
        assert!(tx.push(TaskDescriptor::new(seq, params())));
    }
    let (stats, signals) = stop(worker, handle);

    contract_test_rt("kernel errors", &signals, &[INV_KERNEL_ERROR, INV_TASK_EXECUTED]);
    assert_eq!(stats.executed, 2);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.forwarded, 2);
}

#[test]
fn contract_panic_contained() {
    let (worker, handle, mut tx) = spawn(CountingKernel::panicking_on(1), false);
    for seq in 0..3 {
        assert!(tx.push(TaskDescriptor::new(seq, params())));
    }
    let (stats, signals) = stop(worker, handle);

    contract_test_rt(
        "panic contained",
        &signals,
        &[INV_KERNEL_PANIC_CONTAINED, INV_TASK_EXECUTED, INV_STOP_HONORED],
    );
    assert_eq!(stats.executed, 2);
    assert_eq!(stats.failed, 1);
}

#[test]
fn contract_abandoned_worker_exits() {
    let (worker, handle, _tx) = spawn(CountingKernel::new(), false);
    drop(handle);
    let (_stats, signals) = worker.join();
    assert!(
        !signals.contains(&INV_STOP_HONORED),
        "an abandoned worker exits without a stop message"
    );
}
