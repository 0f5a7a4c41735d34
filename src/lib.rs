//! Arbiter for virtual accelerator requests.
//!
//! Application threads ask for a primitive (FFT, FIR, the fused FFI
//! pipeline, GEMM) through a [`SchedulerHandle`]; one background scheduler
//! grants a hardware context, a pipeline of contexts wired together with
//! shared-memory queues, or a CPU fallback thread. After the grant the
//! requester talks to the resource through [`TaskQueue`]s and
//! [`AtomicFlag`]s only.

pub mod clock;
pub mod config;
pub mod control;
pub mod device;
pub mod dsl;
pub mod error;
pub mod flag;
pub mod graph;
#[doc(hidden)]
pub mod harness;
pub mod interface;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod kernel;
pub mod mem;
pub mod plan;
pub mod primitive;
pub mod queue;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod worker;

pub use config::{SchedulerConfig, WaitStrategy};
pub use device::{DeviceHandle, DeviceOp, DeviceProbe, DeviceSpec, MAX_CONTEXTS};
pub use error::{AllocError, DeviceError, InterfaceError, PriorityError};
pub use flag::AtomicFlag;
pub use interface::{InterfaceState, SchedulerHandle};
pub use kernel::{SoftwareKernel, SoftwareRegistry};
pub use mem::{Channel, MemPool, QueueRef};
pub use primitive::{Primitive, PrimitiveParams, TaskDescriptor};
pub use queue::TaskQueue;
pub use registry::{CapabilityDef, CapabilityRegistry};
pub use request::{ArgumentBlock, Assignment, Priority, RequestId, VirtualRequest};
pub use scheduler::{InventoryReport, Scheduler};
