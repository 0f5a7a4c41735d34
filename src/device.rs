//! Physical accelerators: context bookkeeping and the ioctl seam.
//!
//! A device is an opaque [`DeviceHandle`] taking `reset/init/add_context/
//! delete_context/set_priority` operations with a [`ContextDescriptor`].
//! The descriptor contents are filled by a per-family [`Configure`]
//! implementation chosen from the device's primitive at probe time.

use crate::error::DeviceError;
use crate::mem::{BufferHandle, QueueId, QueueRef};
use crate::primitive::{Primitive, PrimitiveParams};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hardware execution contexts per device.
pub const MAX_CONTEXTS: usize = 4;

/// Index of a device in the scheduler inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a context on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub usize);

/// Bitset of granted contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextSet(u32);

impl ContextSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, ctx: ContextId) -> bool {
        ctx.0 < MAX_CONTEXTS && self.0 & (1 << ctx.0) != 0
    }

    pub fn insert(&mut self, ctx: ContextId) {
        debug_assert!(ctx.0 < MAX_CONTEXTS);
        self.0 |= 1 << ctx.0;
    }

    pub fn remove(&mut self, ctx: ContextId) {
        self.0 &= !(1 << ctx.0);
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_full(&self) -> bool {
        self.count() >= MAX_CONTEXTS
    }

    /// Lowest context index not yet granted.
    pub fn lowest_free(&self) -> Option<ContextId> {
        (0..MAX_CONTEXTS)
            .map(ContextId)
            .find(|c| !self.contains(*c))
    }
}

/// Device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOp {
    Reset,
    Init,
    AddContext,
    DeleteContext,
    SetPriority,
}

/// Cache-coherence mode used for a context's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coherence {
    NonCoherent,
    LlcCoherent,
    #[default]
    CoherentDma,
    FullyCoherent,
}

/// Device-family descriptor passed with every ioctl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDescriptor {
    pub primitive: Primitive,
    /// Contiguous buffer the device reads from.
    pub buffer: Option<BufferHandle>,
    pub coherence: Coherence,
    pub context: ContextId,
    pub priority: u8,
    /// Snapshot of the device's granted contexts.
    pub contexts: ContextSet,
    /// Scheduling quantum in cycles.
    pub quantum: u32,
    pub params: PrimitiveParams,
    pub inputs: Vec<QueueId>,
    pub outputs: Vec<QueueId>,
}

impl ContextDescriptor {
    pub fn new(primitive: Primitive, context: ContextId) -> Self {
        Self {
            primitive,
            buffer: None,
            coherence: Coherence::default(),
            context,
            priority: 1,
            contexts: ContextSet::empty(),
            quantum: 0,
            params: PrimitiveParams::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// What one context is being configured to run.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub primitive: Primitive,
    pub params: PrimitiveParams,
    pub priority: u8,
    pub inputs: Vec<QueueRef>,
    pub outputs: Vec<QueueRef>,
}

/// Opaque device handle. A failed ioctl returns the device's reason.
pub trait DeviceHandle: Send {
    fn ioctl(&mut self, op: DeviceOp, desc: &ContextDescriptor) -> Result<(), String>;
}

/// Per-family descriptor filler.
pub trait Configure: Send + Sync {
    fn configure(&self, desc: &mut ContextDescriptor, stage: &StageRequest) -> Result<(), DeviceError>;
}

fn fill_common(desc: &mut ContextDescriptor, stage: &StageRequest) {
    desc.params = stage.params;
    desc.buffer = stage
        .inputs
        .first()
        .or_else(|| stage.outputs.first())
        .map(|q| q.buffer().handle());
    desc.inputs = stage.inputs.iter().map(|q| q.id()).collect();
    desc.outputs = stage.outputs.iter().map(|q| q.id()).collect();
}

/// FFT and FIR devices: power-of-two lengths.
#[derive(Debug, Default)]
pub struct AudioConfigurator;

impl Configure for AudioConfigurator {
    fn configure(&self, desc: &mut ContextDescriptor, stage: &StageRequest) -> Result<(), DeviceError> {
        if stage.params.log_len == 0 || stage.params.log_len > 20 {
            return Err(DeviceError::Configure {
                primitive: stage.primitive,
                reason: format!("log_len {} outside 1..=20", stage.params.log_len),
            });
        }
        fill_common(desc, stage);
        Ok(())
    }
}

/// GEMM devices: non-zero dimensions.
#[derive(Debug, Default)]
pub struct GemmConfigurator;

impl Configure for GemmConfigurator {
    fn configure(&self, desc: &mut ContextDescriptor, stage: &StageRequest) -> Result<(), DeviceError> {
        let p = stage.params;
        if p.dim_m == 0 || p.dim_n == 0 || p.dim_k == 0 {
            return Err(DeviceError::Configure {
                primitive: stage.primitive,
                reason: "zero GEMM dimension".to_string(),
            });
        }
        fill_common(desc, stage);
        Ok(())
    }
}

/// CPU fallback: accepts any shape.
#[derive(Debug, Default)]
pub struct SoftwareConfigurator;

impl Configure for SoftwareConfigurator {
    fn configure(&self, desc: &mut ContextDescriptor, stage: &StageRequest) -> Result<(), DeviceError> {
        fill_common(desc, stage);
        Ok(())
    }
}

/// Configurator for a device family, selected by primitive.
pub fn configurator_for(primitive: Primitive) -> Arc<dyn Configure> {
    match primitive {
        Primitive::AudioFft | Primitive::AudioFir | Primitive::AudioFfi => Arc::new(AudioConfigurator),
        Primitive::Gemm => Arc::new(GemmConfigurator),
        Primitive::None => Arc::new(SoftwareConfigurator),
    }
}

/// A device found at probe time.
pub struct DeviceSpec {
    pub name: String,
    pub primitive: Primitive,
    pub handle: Box<dyn DeviceHandle>,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, primitive: Primitive, handle: impl DeviceHandle + 'static) -> Self {
        Self {
            name: name.into(),
            primitive,
            handle: Box::new(handle),
        }
    }
}

impl fmt::Debug for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSpec")
            .field("name", &self.name)
            .field("primitive", &self.primitive)
            .finish()
    }
}

/// Source of the device inventory, run once on the scheduler thread.
pub trait DeviceProbe: Send {
    fn probe(&mut self) -> Result<Vec<DeviceSpec>, DeviceError>;
}

impl DeviceProbe for Vec<DeviceSpec> {
    fn probe(&mut self) -> Result<Vec<DeviceSpec>, DeviceError> {
        Ok(std::mem::take(self))
    }
}

/// Scheduler-owned state of one device.
pub struct PhysicalAccelerator {
    pub id: DeviceId,
    pub name: String,
    pub primitive: Primitive,
    pub contexts: ContextSet,
    pub context_ticket: [u32; MAX_CONTEXTS],
    pub context_active_cycles: [u64; MAX_CONTEXTS],
    pub init_done: bool,
    pub quarantined: bool,
    granted_at: [u64; MAX_CONTEXTS],
    descriptors: Vec<Option<ContextDescriptor>>,
    handle: Box<dyn DeviceHandle>,
    configurator: Arc<dyn Configure>,
}

impl PhysicalAccelerator {
    pub fn new(id: DeviceId, spec: DeviceSpec) -> Self {
        Self {
            id,
            configurator: configurator_for(spec.primitive),
            name: spec.name,
            primitive: spec.primitive,
            contexts: ContextSet::empty(),
            context_ticket: [0; MAX_CONTEXTS],
            context_active_cycles: [0; MAX_CONTEXTS],
            init_done: false,
            quarantined: false,
            granted_at: [0; MAX_CONTEXTS],
            descriptors: vec![None; MAX_CONTEXTS],
            handle: spec.handle,
        }
    }

    /// True for the degenerate entries backing CPU fallback threads.
    pub fn is_software(&self) -> bool {
        self.primitive == Primitive::None
    }

    /// Eligible for a new grant of `primitive`.
    pub fn can_serve(&self, primitive: Primitive) -> bool {
        !self.quarantined && self.primitive == primitive && !self.contexts.is_full()
    }

    /// Tentatively mark the lowest free context granted. No ioctl is issued.
    pub fn reserve(&mut self, priority: u8, now: u64) -> Option<ContextId> {
        let ctx = self.contexts.lowest_free()?;
        self.contexts.insert(ctx);
        self.context_ticket[ctx.0] = priority as u32;
        self.granted_at[ctx.0] = now;
        Some(ctx)
    }

    /// Undo a reservation that was never configured.
    pub fn unreserve(&mut self, ctx: ContextId) {
        self.contexts.remove(ctx);
        self.context_ticket[ctx.0] = 0;
        self.granted_at[ctx.0] = 0;
    }

    /// Fill the descriptor for `ctx` and issue `init` (first context) or
    /// `add_context`.
    pub fn configure(
        &mut self,
        ctx: ContextId,
        stage: &StageRequest,
        coherence: Coherence,
        quantum: u32,
    ) -> Result<(), DeviceError> {
        let mut desc = ContextDescriptor::new(stage.primitive, ctx);
        desc.coherence = coherence;
        desc.priority = stage.priority;
        desc.contexts = self.contexts;
        desc.quantum = quantum;
        self.configurator.configure(&mut desc, stage)?;

        let op = if self.init_done {
            DeviceOp::AddContext
        } else {
            DeviceOp::Init
        };
        self.ioctl(op, &desc)?;
        self.init_done = true;
        self.descriptors[ctx.0] = Some(desc);
        Ok(())
    }

    /// Clear `ctx` and issue `delete_context` with the updated bitset.
    ///
    /// A quarantined device gets no ioctl; only the bookkeeping is cleared.
    pub fn release_context(&mut self, ctx: ContextId, now: u64) -> Result<(), DeviceError> {
        self.context_active_cycles[ctx.0] += now.saturating_sub(self.granted_at[ctx.0]);
        self.contexts.remove(ctx);
        self.context_ticket[ctx.0] = 0;
        self.granted_at[ctx.0] = 0;
        let mut desc = self.descriptors[ctx.0]
            .take()
            .unwrap_or_else(|| ContextDescriptor::new(self.primitive, ctx));
        desc.contexts = self.contexts;
        if self.contexts.is_empty() {
            self.init_done = false;
        }
        if self.quarantined {
            debug!(device = %self.id, ctx = ctx.0, "released context on quarantined device without ioctl");
            return Ok(());
        }
        self.ioctl(DeviceOp::DeleteContext, &desc)
    }

    /// Update the ticket of `ctx` and issue `set_priority`.
    pub fn set_priority(&mut self, ctx: ContextId, priority: u8) -> Result<(), DeviceError> {
        self.context_ticket[ctx.0] = priority as u32;
        let mut desc = self.descriptors[ctx.0]
            .clone()
            .unwrap_or_else(|| ContextDescriptor::new(self.primitive, ctx));
        desc.priority = priority;
        desc.contexts = self.contexts;
        self.ioctl(DeviceOp::SetPriority, &desc)?;
        self.descriptors[ctx.0] = Some(desc);
        Ok(())
    }

    /// Issue the reset ioctl done once at probe time.
    pub fn reset(&mut self) -> Result<(), DeviceError> {
        let desc = ContextDescriptor::new(self.primitive, ContextId(0));
        self.ioctl(DeviceOp::Reset, &desc)
    }

    /// Cycles `ctx` has been granted, including the running grant.
    pub fn active_cycles(&self, ctx: ContextId, now: u64) -> u64 {
        let running = if self.contexts.contains(ctx) {
            now.saturating_sub(self.granted_at[ctx.0])
        } else {
            0
        };
        self.context_active_cycles[ctx.0] + running
    }

    fn ioctl(&mut self, op: DeviceOp, desc: &ContextDescriptor) -> Result<(), DeviceError> {
        if self.quarantined {
            return Err(DeviceError::Quarantined(self.id));
        }
        self.handle.ioctl(op, desc).map_err(|reason| {
            self.quarantined = true;
            warn!(device = %self.id, name = %self.name, ?op, %reason, "ioctl failed, quarantining device");
            DeviceError::Ioctl {
                device: self.id,
                op,
                reason,
            }
        })
    }
}

impl fmt::Debug for PhysicalAccelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalAccelerator")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("primitive", &self.primitive)
            .field("contexts", &self.contexts)
            .field("init_done", &self.init_done)
            .field("quarantined", &self.quarantined)
            .finish()
    }
}
