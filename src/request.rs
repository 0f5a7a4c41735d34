//! Virtual requests and what the scheduler grants them.

#![forbid(unsafe_code)]

use crate::device::{ContextId, DeviceId};
use crate::error::PriorityError;
use crate::graph::NodeId;
use crate::mem::QueueRef;
use crate::primitive::{Primitive, PrimitiveParams};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority, `1..=10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(10);

    pub fn new(value: u8) -> Result<Self, PriorityError> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(PriorityError(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MIN
    }
}

impl TryFrom<u8> for Priority {
    type Error = PriorityError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

/// Shared-memory arguments of a request.
///
/// Queues the caller supplies become the boundary edges of the request's
/// dataflow graph. When the scheduler has to allocate a boundary queue
/// itself, the granted request carries it back here.
#[derive(Debug, Clone, Default)]
pub struct ArgumentBlock {
    pub inputs: Vec<QueueRef>,
    pub outputs: Vec<QueueRef>,
    pub params: PrimitiveParams,
}

impl ArgumentBlock {
    pub fn new(params: PrimitiveParams) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn with_input(mut self, queue: QueueRef) -> Self {
        self.inputs.push(queue);
        self
    }

    pub fn with_output(mut self, queue: QueueRef) -> Self {
        self.outputs.push(queue);
        self
    }
}

/// Opaque `(device, context)` pair held by a granted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextRef {
    pub device: DeviceId,
    pub context: ContextId,
}

/// One component of a decomposed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageGrant {
    pub node: NodeId,
    pub primitive: Primitive,
    pub context: ContextRef,
}

/// Where a granted request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// A device implementing the primitive directly.
    Direct(ContextRef),
    /// A CPU fallback thread behind a degenerate device entry.
    Software(ContextRef),
    /// Components of the decomposition, in dataflow order.
    Pipeline { stages: Vec<StageGrant> },
}

impl Assignment {
    /// Every context this assignment holds.
    pub fn contexts(&self) -> Vec<ContextRef> {
        match self {
            Assignment::Direct(c) | Assignment::Software(c) => vec![*c],
            Assignment::Pipeline { stages } => stages.iter().map(|s| s.context).collect(),
        }
    }
}

/// An application's ask for one primitive.
#[derive(Debug, Clone)]
pub struct VirtualRequest {
    pub id: RequestId,
    pub primitive: Primitive,
    pub priority: Priority,
    pub args: ArgumentBlock,
    /// Set by the scheduler while granted.
    pub assignment: Option<Assignment>,
}

impl VirtualRequest {
    pub fn new(primitive: Primitive, priority: Priority, args: ArgumentBlock) -> Self {
        Self {
            id: RequestId::next(),
            primitive,
            priority,
            args,
            assignment: None,
        }
    }

    pub fn is_granted(&self) -> bool {
        self.assignment.is_some()
    }

    /// Device of a direct or software grant. Pipelines report their first stage.
    pub fn assigned_device(&self) -> Option<DeviceId> {
        self.first_context().map(|c| c.device)
    }

    pub fn assigned_context(&self) -> Option<ContextId> {
        self.first_context().map(|c| c.context)
    }

    fn first_context(&self) -> Option<ContextRef> {
        match self.assignment.as_ref()? {
            Assignment::Direct(c) | Assignment::Software(c) => Some(*c),
            Assignment::Pipeline { stages } => stages.first().map(|s| s.context),
        }
    }
}
