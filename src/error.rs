//! Error types for the arbiter.

use crate::device::{DeviceId, DeviceOp};
use crate::graph::GraphError;
use crate::mem::QueueId;
use crate::primitive::Primitive;
use crate::request::RequestId;
use thiserror::Error;

/// Failures reported by a physical device or its configurator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device rejected an ioctl. Hardware and software views may now disagree.
    #[error("ioctl {op:?} failed on device {device}: {reason}")]
    Ioctl {
        device: DeviceId,
        op: DeviceOp,
        reason: String,
    },

    /// The configurator could not build a descriptor for the request.
    #[error("cannot configure {primitive:?}: {reason}")]
    Configure { primitive: Primitive, reason: String },

    /// A previous ioctl failed; the device takes no further operations.
    #[error("device {0} is quarantined")]
    Quarantined(DeviceId),

    /// The device is no longer in the inventory.
    #[error("device {0} is not in the inventory")]
    Missing(DeviceId),

    /// Probing the device inventory failed.
    #[error("device probe failed: {0}")]
    Probe(String),
}

/// Failures of search, release and re-prioritization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Every option was exhausted: no device, no decomposition, no fallback.
    #[error("no device can serve {0:?}")]
    NoDevice(Primitive),

    /// CPU fallback was needed but no software routine is registered.
    #[error("no software routine registered for {0:?}")]
    NoSoftwareRoutine(Primitive),

    /// A device failed while the grant was being configured.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The request is not known to the scheduler.
    #[error("request {0} is not granted")]
    UnknownRequest(RequestId),

    /// The request already holds a grant.
    #[error("request {0} is already granted")]
    AlreadyGranted(RequestId),

    /// The decomposition graph could not be built or bound.
    #[error("dataflow graph error: {0:?}")]
    Graph(GraphError),

    /// A queue handed to the CPU fallback already has a reader or writer.
    #[error("queue {0:?} is already claimed by another endpoint")]
    QueueClaimed(QueueId),

    /// The request's shape needs a bigger edge buffer than the arbiter allocates.
    #[error("{primitive:?} needs {elements} elements per edge, over the edge limit")]
    ShapeTooLarge { primitive: Primitive, elements: usize },

    /// The CPU fallback thread could not be spawned.
    #[error("failed to spawn software worker: {0}")]
    Spawn(String),
}

impl From<GraphError> for AllocError {
    fn from(err: GraphError) -> Self {
        AllocError::Graph(err)
    }
}

/// Failures of the request/response handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterfaceError {
    /// The slot could not be acquired within the configured timeout.
    #[error("timed out acquiring the request slot")]
    Timeout,

    /// The scheduler thread exited while a request was outstanding.
    #[error("scheduler thread is gone")]
    SchedulerGone,

    /// The scheduler has been shut down.
    #[error("scheduler is shut down")]
    ShutDown,

    /// The scheduler processed the request and rejected it.
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Priority outside `1..=10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("priority {0} outside 1..=10")]
pub struct PriorityError(pub u8);
