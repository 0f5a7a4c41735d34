//! The arbiter: owns the device inventory and grants contexts to requests.
//!
//! `search` tries, in order, a device implementing the primitive directly,
//! a decomposition through the capability registry, and a CPU fallback
//! thread. All inventory mutation happens here; the [`interface`] module
//! runs a `Scheduler` on its own thread, but tests drive it directly.
//!
//! [`interface`]: crate::interface

use crate::config::SchedulerConfig;
use crate::device::{
    ContextId, ContextSet, DeviceId, DeviceProbe, DeviceSpec, PhysicalAccelerator, StageRequest,
    MAX_CONTEXTS,
};
use crate::error::{AllocError, DeviceError};
use crate::graph::{DataflowGraph, GraphError, NodeId};
use crate::invariant_ppt::{
    assert_invariant, COMPOSITE_ATOMIC, CONTEXT_BOUND, FALLBACK_JOINED, PRIMITIVE_MATCH,
    PRIORITY_LIVE_UPDATE, QUARANTINE_ENFORCED, RELEASE_FREES_CONTEXT,
};
use crate::invariant_rt::{SignalCounts, INV_KERNEL_PANIC_CONTAINED};
use crate::mem::{MemPool, QueueRef};
use crate::plan::QueuePlan;
use crate::primitive::{Primitive, MAX_EDGE_ELEMENTS};
use crate::queue::MIN_QUEUE_CAPACITY;
use crate::request::{Assignment, ContextRef, Priority, RequestId, StageGrant, VirtualRequest};
use crate::worker::SoftwareWorker;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Nesting limit for decompositions whose components are themselves composite.
pub const MAX_DECOMPOSITION_DEPTH: usize = 8;

/// Snapshot of one device for reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub id: DeviceId,
    pub name: String,
    pub primitive: Primitive,
    pub contexts: ContextSet,
    pub tickets: [u32; MAX_CONTEXTS],
    pub active_cycles: [u64; MAX_CONTEXTS],
    pub init_done: bool,
    pub quarantined: bool,
}

impl DeviceReport {
    fn capture(device: &PhysicalAccelerator, now: u64) -> Self {
        let mut active_cycles = [0; MAX_CONTEXTS];
        for (ctx, cycles) in active_cycles.iter_mut().enumerate() {
            *cycles = device.active_cycles(ContextId(ctx), now);
        }
        Self {
            id: device.id,
            name: device.name.clone(),
            primitive: device.primitive,
            contexts: device.contexts,
            tickets: device.context_ticket,
            active_cycles,
            init_done: device.init_done,
            quarantined: device.quarantined,
        }
    }
}

/// Answer to a report request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InventoryReport {
    pub devices: Vec<DeviceReport>,
    pub live_allocations: usize,
    /// Tasks executed by CPU fallback workers that have been joined.
    pub software_tasks_completed: u64,
}

impl InventoryReport {
    /// Granted contexts summed over every device.
    pub fn granted_contexts(&self) -> usize {
        self.devices.iter().map(|d| d.contexts.count()).sum()
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Everything a granted request holds until release.
struct Allocation {
    primitive: Primitive,
    priority: Priority,
    grants: Vec<ContextRef>,
    worker: Option<SoftwareWorker>,
    /// Channel the CPU worker reads from.
    input: Option<QueueRef>,
    graph: Option<DataflowGraph>,
    pool: MemPool,
}

impl Allocation {
    fn new(request: &VirtualRequest, grants: Vec<ContextRef>, pool: MemPool) -> Self {
        Self {
            primitive: request.primitive,
            priority: request.priority,
            grants,
            worker: None,
            input: None,
            graph: None,
            pool,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    node: NodeId,
    grant: ContextRef,
}

type InventorySnapshot = Vec<(DeviceId, ContextSet, [u32; MAX_CONTEXTS], bool, bool)>;

/// Device inventory plus the live grants made from it.
pub struct Scheduler {
    config: SchedulerConfig,
    inventory: Vec<Option<PhysicalAccelerator>>,
    allocations: BTreeMap<RequestId, Allocation>,
    software_tasks_completed: u64,
}

impl Scheduler {
    pub fn new(mut config: SchedulerConfig) -> Self {
        if config.queue_capacity < MIN_QUEUE_CAPACITY {
            warn!(
                requested = config.queue_capacity,
                used = MIN_QUEUE_CAPACITY,
                "queue capacity too small, raised"
            );
            config.queue_capacity = MIN_QUEUE_CAPACITY;
        }
        Self {
            config,
            inventory: Vec::new(),
            allocations: BTreeMap::new(),
            software_tasks_completed: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add every device `probe` finds. Returns how many were added.
    pub fn probe(&mut self, probe: &mut dyn DeviceProbe) -> Result<usize, DeviceError> {
        let specs = probe.probe()?;
        let count = specs.len();
        for spec in specs {
            self.add_device(spec);
        }
        info!(devices = count, "device inventory probed");
        Ok(count)
    }

    /// Add one device and issue its reset ioctl.
    ///
    /// A device that fails reset is kept in the inventory, quarantined.
    pub fn add_device(&mut self, spec: DeviceSpec) -> DeviceId {
        let id = DeviceId(self.inventory.len());
        let mut device = PhysicalAccelerator::new(id, spec);
        if let Err(err) = device.reset() {
            warn!(device = %id, %err, "device failed reset at probe");
        } else {
            debug!(device = %id, name = %device.name, primitive = %device.primitive, "device ready");
        }
        self.inventory.push(Some(device));
        id
    }

    pub fn device(&self, id: DeviceId) -> Option<&PhysicalAccelerator> {
        self.inventory.get(id.0).and_then(Option::as_ref)
    }

    /// Devices currently in the inventory, in id order.
    pub fn devices(&self) -> impl Iterator<Item = &PhysicalAccelerator> {
        self.inventory.iter().flatten()
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    pub fn granted_contexts(&self) -> usize {
        self.devices().map(|d| d.contexts.count()).sum()
    }

    /// Dataflow graph of a granted pipeline request.
    pub fn pipeline_graph(&self, id: RequestId) -> Option<&DataflowGraph> {
        self.allocations.get(&id)?.graph.as_ref()
    }

    /// Channels allocated from a granted request's arena.
    pub fn allocated_channels(&self, id: RequestId) -> Option<&[QueueRef]> {
        self.allocations.get(&id).map(|a| a.pool.channels())
    }

    /// Grant `request` a device, a decomposition, or a CPU fallback thread.
    ///
    /// On success `request.assignment` is set; boundary queues the scheduler
    /// had to allocate are appended to `request.args`.
    pub fn search(&mut self, request: &mut VirtualRequest) -> Result<(), AllocError> {
        if request.is_granted() || self.allocations.contains_key(&request.id) {
            return Err(AllocError::AlreadyGranted(request.id));
        }
        if request.primitive == Primitive::None {
            return Err(AllocError::NoDevice(Primitive::None));
        }
        let elements = request.args.params.elements(request.primitive);
        if elements > MAX_EDGE_ELEMENTS {
            return Err(AllocError::ShapeTooLarge {
                primitive: request.primitive,
                elements,
            });
        }
        let now = self.config.clock.now();
        let found = match self.grant_direct(request, now)? {
            Some(found) => Ok(found),
            None => match self.grant_pipeline(request, now)? {
                Some(found) => Ok(found),
                None => self.grant_software(request, now),
            },
        };
        match found {
            Ok((assignment, allocation)) => {
                debug!(request = %request.id, primitive = %request.primitive, ?assignment, "request granted");
                request.assignment = Some(assignment);
                self.allocations.insert(request.id, allocation);
                Ok(())
            }
            Err(err) => {
                warn!(request = %request.id, primitive = %request.primitive, %err, "allocation failed");
                Err(err)
            }
        }
    }

    /// Release every context held by `id`, stopping its CPU worker if any.
    ///
    /// The grant is gone afterwards even when a device ioctl fails; the
    /// failing device is quarantined and the first error is returned.
    pub fn release(&mut self, id: RequestId) -> Result<(), AllocError> {
        let allocation = self
            .allocations
            .remove(&id)
            .ok_or(AllocError::UnknownRequest(id))?;
        let now = self.config.clock.now();
        debug!(request = %id, primitive = %allocation.primitive, "releasing request");
        self.free_allocation(allocation, now)
    }

    /// Live re-prioritization of every context held by `id`.
    pub fn set_priority(&mut self, id: RequestId, priority: Priority) -> Result<(), AllocError> {
        let grants = self
            .allocations
            .get(&id)
            .map(|a| a.grants.clone())
            .ok_or(AllocError::UnknownRequest(id))?;
        for grant in grants {
            let device = self
                .slot_mut(grant.device)
                .ok_or(DeviceError::Missing(grant.device))?;
            device.set_priority(grant.context, priority.get())?;
            assert_invariant(
                PRIORITY_LIVE_UPDATE,
                device.context_ticket[grant.context.0] == priority.get() as u32,
                "ticket follows the live priority",
                Some("set_priority"),
            );
        }
        if let Some(allocation) = self.allocations.get_mut(&id) {
            allocation.priority = priority;
        }
        debug!(request = %id, priority = priority.get(), "priority updated");
        Ok(())
    }

    pub fn report(&self) -> InventoryReport {
        let now = self.config.clock.now();
        InventoryReport {
            devices: self.devices().map(|d| DeviceReport::capture(d, now)).collect(),
            live_allocations: self.allocations.len(),
            software_tasks_completed: self.software_tasks_completed,
        }
    }

    /// Release every live allocation. Returns how many there were.
    pub fn shutdown_all(&mut self) -> usize {
        let ids: Vec<RequestId> = self.allocations.keys().copied().collect();
        for &id in &ids {
            if let Err(err) = self.release(id) {
                warn!(request = %id, %err, "release during shutdown failed");
            }
        }
        info!(released = ids.len(), "scheduler shut down");
        ids.len()
    }

    fn grant_direct(
        &mut self,
        request: &VirtualRequest,
        now: u64,
    ) -> Result<Option<(Assignment, Allocation)>, AllocError> {
        let stage = StageRequest {
            primitive: request.primitive,
            params: request.args.params,
            priority: request.priority.get(),
            inputs: request.args.inputs.clone(),
            outputs: request.args.outputs.clone(),
        };
        while let Some(device) = self.find_device(request.primitive) {
            let Some(context) = self.reserve(device, request.priority, now) else {
                break;
            };
            let grant = ContextRef { device, context };
            match self.configure(grant, &stage) {
                Ok(()) => {
                    let pool = MemPool::new(self.config.queue_capacity);
                    let allocation = Allocation::new(request, vec![grant], pool);
                    return Ok(Some((Assignment::Direct(grant), allocation)));
                }
                // The device is quarantined now; try the next one.
                Err(DeviceError::Ioctl { .. }) => self.unreserve(grant),
                Err(err) => {
                    self.unreserve(grant);
                    return Err(err.into());
                }
            }
        }
        Ok(None)
    }

    fn grant_pipeline(
        &mut self,
        request: &mut VirtualRequest,
        now: u64,
    ) -> Result<Option<(Assignment, Allocation)>, AllocError> {
        if !self.config.registry.is_composable(request.primitive) {
            return Ok(None);
        }
        // A stage whose ioctl fails quarantines its device, so every retry
        // searches a strictly smaller inventory.
        loop {
            match self.try_pipeline(request, now) {
                Err(AllocError::Device(DeviceError::Ioctl { device, op, .. })) => {
                    debug!(request = %request.id, %device, ?op, "pipeline stage failed, retrying decomposition");
                }
                other => return other,
            }
        }
    }

    /// One decomposition attempt over the current inventory.
    fn try_pipeline(
        &mut self,
        request: &mut VirtualRequest,
        now: u64,
    ) -> Result<Option<(Assignment, Allocation)>, AllocError> {
        let before = self.snapshot();
        let mut graph = DataflowGraph::new();
        let node = root_node(&mut graph, request)?;

        let mut reserved = Vec::new();
        let satisfied = self.reserve_components(
            &mut graph,
            node,
            request.priority,
            now,
            0,
            &mut reserved,
        );
        match satisfied {
            Ok(true) => {}
            Ok(false) => {
                self.rollback(&reserved, &[], now);
                assert_invariant(
                    COMPOSITE_ATOMIC,
                    self.snapshot() == before,
                    "failed decomposition leaves the inventory untouched",
                    Some("search"),
                );
                debug!(request = %request.id, primitive = %request.primitive, "decomposition unsatisfiable");
                return Ok(None);
            }
            Err(err) => {
                self.rollback(&reserved, &[], now);
                return Err(err);
            }
        }

        let mut pool = MemPool::new(self.config.queue_capacity);
        let mut configured = Vec::new();
        let committed = QueuePlan::bind(&mut graph, &mut pool)
            .map_err(AllocError::from)
            .and_then(|plan| {
                self.commit_pipeline(&graph, &plan, &reserved, request.priority, &mut configured)
            });
        let stages = match committed {
            Ok(stages) => stages,
            Err(err) => {
                self.rollback(&reserved, &configured, now);
                return Err(err);
            }
        };

        let (inputs, outputs) = QueuePlan::stage_queues(&graph, node)?;
        request.args.inputs = inputs;
        request.args.outputs = outputs;
        let grants = stages.iter().map(|s| s.context).collect();
        let mut allocation = Allocation::new(request, grants, pool);
        allocation.graph = Some(graph);
        Ok(Some((Assignment::Pipeline { stages }, allocation)))
    }

    /// Expand `node` and tentatively reserve a context for every component,
    /// decomposing further where no device exists. Nothing is configured.
    fn reserve_components(
        &mut self,
        graph: &mut DataflowGraph,
        node: NodeId,
        priority: Priority,
        now: u64,
        depth: usize,
        reserved: &mut Vec<Reservation>,
    ) -> Result<bool, AllocError> {
        let primitive = graph.node(node)?.primitive;
        let def = self.config.registry.get(primitive);
        if !def.composable || def.component_list.is_empty() || depth >= MAX_DECOMPOSITION_DEPTH {
            return Ok(false);
        }
        let child = graph.expand(node, &def)?;
        let mut components = Vec::with_capacity(def.component_list.len());
        for &n in &graph.subgraph(child)?.nodes {
            if !graph.node(n)?.is_sentinel() {
                components.push(n);
            }
        }

        for component in components {
            let wanted = graph.node(component)?.primitive;
            assert_invariant(
                PRIMITIVE_MATCH,
                def.component_list.contains(&wanted),
                "component comes from the capability's component list",
                Some("decompose"),
            );
            if let Some(device) = self.find_device(wanted) {
                if let Some(context) = self.reserve(device, priority, now) {
                    reserved.push(Reservation {
                        node: component,
                        grant: ContextRef { device, context },
                    });
                    continue;
                }
            }
            if !self.reserve_components(graph, component, priority, now, depth + 1, reserved)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Configure every reserved stage with its bound queues, in plan order.
    fn commit_pipeline(
        &mut self,
        graph: &DataflowGraph,
        plan: &QueuePlan,
        reserved: &[Reservation],
        priority: Priority,
        configured: &mut Vec<ContextRef>,
    ) -> Result<Vec<StageGrant>, AllocError> {
        let mut stages = Vec::with_capacity(plan.stages.len());
        for &leaf in &plan.stages {
            let reservation = reserved
                .iter()
                .find(|r| r.node == leaf)
                .ok_or(GraphError::InvalidNode)?;
            let data = graph.node(leaf)?;
            let (inputs, outputs) = QueuePlan::stage_queues(graph, leaf)?;
            let stage = StageRequest {
                primitive: data.primitive,
                params: data.params,
                priority: priority.get(),
                inputs,
                outputs,
            };
            self.configure(reservation.grant, &stage)?;
            configured.push(reservation.grant);
            stages.push(StageGrant {
                node: leaf,
                primitive: data.primitive,
                context: reservation.grant,
            });
        }
        Ok(stages)
    }

    fn grant_software(
        &mut self,
        request: &mut VirtualRequest,
        now: u64,
    ) -> Result<(Assignment, Allocation), AllocError> {
        if !self.config.allow_cpu_fallback {
            return Err(AllocError::NoDevice(request.primitive));
        }
        let kernel = self
            .config
            .software
            .get(request.primitive)
            .ok_or(AllocError::NoSoftwareRoutine(request.primitive))?;

        let mut pool = MemPool::new(self.config.queue_capacity);
        let mut inputs = request.args.inputs.clone();
        // Handed to the caller only once the grant holds.
        let fresh = if inputs.is_empty() {
            let q = pool.alloc_channel(request.args.params.elements(request.primitive));
            inputs.push(Arc::clone(&q));
            Some(q)
        } else {
            None
        };
        let input = Arc::clone(&inputs[0]);
        let consumer = input
            .tasks()
            .try_consumer()
            .ok_or(AllocError::QueueClaimed(input.id()))?;
        let producer = match request.args.outputs.first() {
            Some(q) => Some(
                q.tasks()
                    .try_producer()
                    .ok_or(AllocError::QueueClaimed(q.id()))?,
            ),
            None => None,
        };

        let (worker, handle) = SoftwareWorker::spawn(
            request.primitive,
            kernel,
            request.args.params,
            request.priority.get(),
            consumer,
            producer,
        )?;
        let name = format!("cpu-{}", request.primitive);
        let device = self.insert_software(DeviceSpec::new(name, Primitive::None, handle));
        let Some(context) = self.reserve(device, request.priority, now) else {
            self.discard_software(device, worker);
            return Err(AllocError::NoDevice(request.primitive));
        };
        let grant = ContextRef { device, context };
        let stage = StageRequest {
            primitive: request.primitive,
            params: request.args.params,
            priority: request.priority.get(),
            inputs,
            outputs: request.args.outputs.clone(),
        };
        if let Err(err) = self.configure(grant, &stage) {
            self.discard_software(device, worker);
            return Err(err.into());
        }
        assert_invariant(
            PRIMITIVE_MATCH,
            self.device(device).map(|d| d.is_software()).unwrap_or(false),
            "fallback grants a degenerate cpu device",
            Some("search"),
        );
        info!(request = %request.id, primitive = %request.primitive, device = %device, "no device available, running on cpu");

        if let Some(q) = fresh {
            request.args.inputs.push(q);
        }
        let mut allocation = Allocation::new(request, vec![grant], pool);
        allocation.worker = Some(worker);
        allocation.input = Some(input);
        Ok((Assignment::Software(grant), allocation))
    }

    fn free_allocation(&mut self, mut allocation: Allocation, now: u64) -> Result<(), AllocError> {
        let mut first_err = None;
        for grant in &allocation.grants {
            let Some(device) = self.slot_mut(grant.device) else {
                continue;
            };
            if let Err(err) = device.release_context(grant.context, now) {
                warn!(device = %grant.device, ctx = grant.context.0, %err, "release ioctl failed");
                first_err.get_or_insert(err);
            }
            assert_invariant(
                RELEASE_FREES_CONTEXT,
                !device.contexts.contains(grant.context),
                "released context is free again",
                Some("release"),
            );
        }

        if let Some(worker) = allocation.worker.take() {
            // Dropping the entry drops its control queue; the worker has
            // already been sent its stop message.
            if let Some(grant) = allocation.grants.first() {
                if let Some(slot) = self.inventory.get_mut(grant.device.0) {
                    *slot = None;
                }
            }
            let (stats, signals) = worker.join();
            self.software_tasks_completed += stats.executed;
            let panics = SignalCounts::tally(&signals).get(INV_KERNEL_PANIC_CONTAINED);
            if panics > 0 {
                warn!(primitive = %allocation.primitive, panics, "cpu kernel panicked; tasks were dropped");
            }
            let input_free = allocation
                .input
                .as_ref()
                .map(|q| q.tasks().try_consumer().is_some())
                .unwrap_or(true);
            assert_invariant(
                FALLBACK_JOINED,
                input_free,
                "joined worker gave its input queue back",
                Some("release"),
            );
            debug!(
                executed = stats.executed,
                failed = stats.failed,
                forwarded = stats.forwarded,
                "cpu worker joined"
            );
        }

        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn find_device(&self, primitive: Primitive) -> Option<DeviceId> {
        let found = self.devices().find(|d| d.can_serve(primitive))?;
        assert_invariant(
            QUARANTINE_ENFORCED,
            !found.quarantined,
            "quarantined devices get no grants",
            Some("search"),
        );
        assert_invariant(
            PRIMITIVE_MATCH,
            found.primitive == primitive,
            "device implements the requested primitive",
            Some("search"),
        );
        Some(found.id)
    }

    fn reserve(&mut self, device: DeviceId, priority: Priority, now: u64) -> Option<ContextId> {
        let acc = self.slot_mut(device)?;
        let before = acc.contexts;
        let ctx = acc.reserve(priority.get(), now)?;
        assert_invariant(
            CONTEXT_BOUND,
            !before.contains(ctx) && acc.contexts.count() <= MAX_CONTEXTS,
            "granted context was free and the device stays within its contexts",
            Some("reserve"),
        );
        Some(ctx)
    }

    fn unreserve(&mut self, grant: ContextRef) {
        if let Some(acc) = self.slot_mut(grant.device) {
            acc.unreserve(grant.context);
        }
    }

    fn configure(&mut self, grant: ContextRef, stage: &StageRequest) -> Result<(), DeviceError> {
        let coherence = self.config.coherence;
        let quantum = self.config.quantum;
        let device = self
            .slot_mut(grant.device)
            .ok_or(DeviceError::Missing(grant.device))?;
        device.configure(grant.context, stage, coherence, quantum)
    }

    /// Undo tentative reservations; `configured` ones also get their
    /// delete-context ioctl.
    fn rollback(&mut self, reserved: &[Reservation], configured: &[ContextRef], now: u64) {
        for r in reserved.iter().rev() {
            if configured.contains(&r.grant) {
                if let Some(acc) = self.slot_mut(r.grant.device) {
                    if let Err(err) = acc.release_context(r.grant.context, now) {
                        warn!(device = %r.grant.device, %err, "rollback release failed");
                    }
                }
            } else {
                self.unreserve(r.grant);
            }
        }
    }

    fn insert_software(&mut self, spec: DeviceSpec) -> DeviceId {
        match self.inventory.iter().position(Option::is_none) {
            Some(slot) => {
                let id = DeviceId(slot);
                self.inventory[slot] = Some(PhysicalAccelerator::new(id, spec));
                id
            }
            None => {
                let id = DeviceId(self.inventory.len());
                self.inventory.push(Some(PhysicalAccelerator::new(id, spec)));
                id
            }
        }
    }

    fn discard_software(&mut self, device: DeviceId, worker: SoftwareWorker) {
        if let Some(slot) = self.inventory.get_mut(device.0) {
            *slot = None;
        }
        let _ = worker.join();
    }

    fn slot_mut(&mut self, id: DeviceId) -> Option<&mut PhysicalAccelerator> {
        self.inventory.get_mut(id.0).and_then(Option::as_mut)
    }

    fn snapshot(&self) -> InventorySnapshot {
        self.devices()
            .map(|d| (d.id, d.contexts, d.context_ticket, d.init_done, d.quarantined))
            .collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            self.shutdown_all();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("devices", &self.devices().count())
            .field("live_allocations", &self.allocations.len())
            .finish()
    }
}

/// Root level of a request's graph: one node for the primitive, one edge
/// per boundary queue. Missing boundary queues are allocated at bind time.
fn root_node(graph: &mut DataflowGraph, request: &VirtualRequest) -> Result<NodeId, GraphError> {
    let root = graph.subgraph(graph.root())?.clone();
    let node = graph.add_node(root.id, request.primitive, request.args.params)?;
    let len = request.args.params.elements(request.primitive);
    for i in 0..request.args.inputs.len().max(1) {
        let edge = graph.add_edge(root.entry, node, len)?;
        if let Some(q) = request.args.inputs.get(i) {
            graph.attach_queue(edge, Arc::clone(q))?;
        }
    }
    for i in 0..request.args.outputs.len().max(1) {
        let edge = graph.add_edge(node, root.exit, len)?;
        if let Some(q) = request.args.outputs.get(i) {
            graph.attach_queue(edge, Arc::clone(q))?;
        }
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceOp;
    use crate::harness::{ArbiterHarness, CountingKernel};
    use crate::mem::Channel;
    use crate::primitive::{PrimitiveParams, TaskDescriptor};
    use crate::registry::{CapabilityDef, CapabilityRegistry};
    use crate::request::ArgumentBlock;

    fn audio() -> ArgumentBlock {
        ArgumentBlock::new(PrimitiveParams::audio(8))
    }

    #[test]
    fn direct_match_takes_first_device_and_lowest_context() {
        let mut h = ArbiterHarness::new(&[Primitive::AudioFir, Primitive::AudioFft, Primitive::AudioFft]);
        let a = h.request(Primitive::AudioFft, 3, audio()).unwrap();
        let b = h.request(Primitive::AudioFft, 3, audio()).unwrap();
        assert_eq!(a.assigned_device(), Some(DeviceId(1)));
        assert_eq!(a.assigned_context(), Some(ContextId(0)));
        assert_eq!(b.assigned_device(), Some(DeviceId(1)));
        assert_eq!(b.assigned_context(), Some(ContextId(1)));
        assert_eq!(
            h.log(DeviceId(1)).unwrap().ops(),
            vec![DeviceOp::Reset, DeviceOp::Init, DeviceOp::AddContext]
        );
        assert!(h.log(DeviceId(2)).unwrap().ops() == vec![DeviceOp::Reset]);
    }

    #[test]
    fn full_device_spills_to_next() {
        let mut h = ArbiterHarness::new(&[Primitive::Gemm, Primitive::Gemm]);
        let args = ArgumentBlock::new(PrimitiveParams::gemm(8, 8, 8));
        let grants: Vec<_> = (0..=MAX_CONTEXTS)
            .map(|_| h.request(Primitive::Gemm, 1, args.clone()).unwrap())
            .collect();
        assert_eq!(grants[MAX_CONTEXTS].assigned_device(), Some(DeviceId(1)));
        assert_eq!(h.scheduler.granted_contexts(), MAX_CONTEXTS + 1);
    }

    #[test]
    fn release_frees_context_for_reuse() {
        let mut h = ArbiterHarness::new(&[Primitive::AudioFir]);
        let a = h.request(Primitive::AudioFir, 2, audio()).unwrap();
        let _b = h.request(Primitive::AudioFir, 2, audio()).unwrap();
        h.scheduler.release(a.id).unwrap();
        let c = h.request(Primitive::AudioFir, 2, audio()).unwrap();
        assert_eq!(c.assigned_context(), a.assigned_context());
        assert_eq!(
            h.scheduler.release(a.id),
            Err(AllocError::UnknownRequest(a.id))
        );
    }

    #[test]
    fn last_release_reissues_init() {
        let mut h = ArbiterHarness::new(&[Primitive::AudioFft]);
        let a = h.request(Primitive::AudioFft, 1, audio()).unwrap();
        h.scheduler.release(a.id).unwrap();
        let _b = h.request(Primitive::AudioFft, 1, audio()).unwrap();
        assert_eq!(
            h.log(DeviceId(0)).unwrap().ops(),
            vec![
                DeviceOp::Reset,
                DeviceOp::Init,
                DeviceOp::DeleteContext,
                DeviceOp::Init
            ]
        );
    }

    #[test]
    fn ffi_decomposes_into_fft_fir_ifft() {
        let mut h = ArbiterHarness::new(&[Primitive::AudioFft, Primitive::AudioFir]);
        let r = h.request(Primitive::AudioFfi, 4, audio()).unwrap();
        let Some(Assignment::Pipeline { stages }) = r.assignment.clone() else {
            panic!("expected a pipeline grant, got {:?}", r.assignment);
        };
        let prims: Vec<_> = stages.iter().map(|s| s.primitive).collect();
        assert_eq!(
            prims,
            vec![Primitive::AudioFft, Primitive::AudioFir, Primitive::AudioFft]
        );
        assert_eq!(stages[0].context.device, DeviceId(0));
        assert_eq!(stages[2].context.device, DeviceId(0));
        assert_ne!(stages[0].context.context, stages[2].context.context);
        assert_eq!(h.scheduler.granted_contexts(), 3);
        // No caller queues: input, output and two inner queues.
        assert_eq!(h.scheduler.allocated_channels(r.id).unwrap().len(), 4);
        assert_eq!(r.args.inputs.len(), 1);
        assert_eq!(r.args.outputs.len(), 1);

        let inverse = h.log(DeviceId(0)).unwrap().last().unwrap();
        assert!(inverse.params.inverse);

        h.scheduler.release(r.id).unwrap();
        assert_eq!(h.scheduler.granted_contexts(), 0);
    }

    #[test]
    fn unsatisfiable_decomposition_leaves_inventory_untouched() {
        let mut h = ArbiterHarness::with_config(
            SchedulerConfig::default().with_cpu_fallback(false),
            &[Primitive::AudioFft],
        );
        let _held = h.request(Primitive::AudioFft, 1, audio()).unwrap();
        let before = h.scheduler.report();
        let err = h.request(Primitive::AudioFfi, 1, audio()).unwrap_err();
        assert_eq!(err, AllocError::NoDevice(Primitive::AudioFfi));
        assert_eq!(h.scheduler.report(), before);
    }

    #[test]
    fn nested_decomposition() {
        let registry = CapabilityRegistry::default().with_capability(
            Primitive::Gemm,
            CapabilityDef::pipeline(&[Primitive::AudioFfi, Primitive::AudioFir]),
        );
        let mut h = ArbiterHarness::with_config(
            SchedulerConfig::default().with_registry(registry),
            &[Primitive::AudioFft, Primitive::AudioFir],
        );
        let r = h.request(Primitive::Gemm, 1, audio()).unwrap();
        let Some(Assignment::Pipeline { stages }) = r.assignment else {
            panic!("expected a pipeline grant");
        };
        assert_eq!(stages.len(), 4);
        let graph = h.scheduler.pipeline_graph(r.id).unwrap();
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn self_referencing_capability_terminates() {
        let registry = CapabilityRegistry::empty().with_capability(
            Primitive::Gemm,
            CapabilityDef::pipeline(&[Primitive::Gemm]),
        );
        let mut h = ArbiterHarness::with_config(
            SchedulerConfig::default()
                .with_registry(registry)
                .with_cpu_fallback(false),
            &[Primitive::AudioFft],
        );
        let err = h
            .request(Primitive::Gemm, 1, ArgumentBlock::new(PrimitiveParams::gemm(2, 2, 2)))
            .unwrap_err();
        assert_eq!(err, AllocError::NoDevice(Primitive::Gemm));
        assert_eq!(h.scheduler.granted_contexts(), 0);
    }

    #[test]
    fn ioctl_failure_quarantines_and_moves_on() {
        let mut h = ArbiterHarness::new(&[Primitive::AudioFir, Primitive::AudioFir]);
        h.log(DeviceId(0)).unwrap().fail_on(DeviceOp::Init);
        let r = h.request(Primitive::AudioFir, 1, audio()).unwrap();
        assert_eq!(r.assigned_device(), Some(DeviceId(1)));
        let report = h.scheduler.report();
        let bad = report.device(DeviceId(0)).unwrap();
        assert!(bad.quarantined);
        assert!(bad.contexts.is_empty());

        // Never touched again.
        let _s = h.request(Primitive::AudioFir, 1, audio()).unwrap();
        assert_eq!(
            h.log(DeviceId(0)).unwrap().ops(),
            vec![DeviceOp::Reset, DeviceOp::Init]
        );
    }

    #[test]
    fn set_priority_is_live() {
        let mut h = ArbiterHarness::new(&[Primitive::AudioFft]);
        let r = h.request(Primitive::AudioFft, 2, audio()).unwrap();
        h.scheduler
            .set_priority(r.id, Priority::new(9).unwrap())
            .unwrap();
        let log = h.log(DeviceId(0)).unwrap();
        assert_eq!(log.ops().last(), Some(&DeviceOp::SetPriority));
        assert_eq!(log.last().unwrap().priority, 9);
        assert_eq!(h.scheduler.report().devices[0].tickets[0], 9);
    }

    #[test]
    fn active_cycles_accumulate() {
        let mut h = ArbiterHarness::new(&[Primitive::AudioFft]);
        let r = h.request(Primitive::AudioFft, 2, audio()).unwrap();
        h.clock.advance(40);
        assert_eq!(h.scheduler.report().devices[0].active_cycles[0], 40);
        h.scheduler.release(r.id).unwrap();
        h.clock.advance(10);
        assert_eq!(h.scheduler.report().devices[0].active_cycles[0], 40);
    }

    #[test]
    fn gemm_falls_back_to_cpu() {
        let kernel = CountingKernel::new();
        let mut h = ArbiterHarness::with_config(
            SchedulerConfig::default().with_software(Primitive::Gemm, kernel.clone()),
            &[Primitive::AudioFft],
        );
        let args = ArgumentBlock::new(PrimitiveParams::gemm(16, 16, 16));
        let r = h.request(Primitive::Gemm, 5, args).unwrap();
        let device = r.assigned_device().unwrap();
        assert_eq!(h.scheduler.device(device).unwrap().primitive, Primitive::None);
        assert!(matches!(r.assignment, Some(Assignment::Software(_))));

        let mut tx = r.args.inputs[0].tasks().try_producer().unwrap();
        assert!(tx.push(TaskDescriptor::new(0, PrimitiveParams::gemm(16, 16, 16))));
        drop(tx);

        h.scheduler.release(r.id).unwrap();
        assert_eq!(h.scheduler.granted_contexts(), 0);
        assert!(h.scheduler.device(device).is_none());
        assert_eq!(kernel.executed(), 1);
        assert_eq!(h.scheduler.report().software_tasks_completed, 1);
    }

    #[test]
    fn fallback_needs_a_routine() {
        let mut h = ArbiterHarness::new(&[]);
        let err = h
            .request(Primitive::Gemm, 1, ArgumentBlock::new(PrimitiveParams::gemm(1, 1, 1)))
            .unwrap_err();
        assert_eq!(err, AllocError::NoSoftwareRoutine(Primitive::Gemm));
    }

    #[test]
    fn fallback_rejects_claimed_input() {
        let mut h = ArbiterHarness::with_config(
            SchedulerConfig::default().with_software(Primitive::Gemm, CountingKernel::new()),
            &[],
        );
        let input = Channel::new(4, 16);
        let _reader = input.tasks().try_consumer().unwrap();
        let args = ArgumentBlock::new(PrimitiveParams::gemm(4, 4, 4)).with_input(input.clone());
        let err = h.request(Primitive::Gemm, 1, args).unwrap_err();
        assert_eq!(err, AllocError::QueueClaimed(input.id()));
    }

    #[test]
    fn double_grant_is_rejected() {
        let mut h = ArbiterHarness::new(&[Primitive::AudioFft]);
        let mut r = h.request(Primitive::AudioFft, 1, audio()).unwrap();
        assert_eq!(
            h.scheduler.search(&mut r),
            Err(AllocError::AlreadyGranted(r.id))
        );
    }

    #[test]
    fn shutdown_releases_everything() {
        let mut h = ArbiterHarness::with_config(
            SchedulerConfig::default().with_software(Primitive::Gemm, CountingKernel::new()),
            &[Primitive::AudioFft, Primitive::AudioFir],
        );
        h.request(Primitive::AudioFfi, 1, audio()).unwrap();
        h.request(Primitive::Gemm, 1, ArgumentBlock::new(PrimitiveParams::gemm(2, 2, 2)))
            .unwrap();
        assert_eq!(h.scheduler.shutdown_all(), 2);
        let report = h.scheduler.report();
        assert_eq!(report.granted_contexts(), 0);
        assert_eq!(report.live_allocations, 0);
        assert_eq!(report.devices.len(), 2);
    }

    #[test]
    fn pipeline_retries_past_a_failing_stage_device() {
        let mut h = ArbiterHarness::new(&[Primitive::AudioFft, Primitive::AudioFft, Primitive::AudioFir]);
        h.log(DeviceId(0)).unwrap().fail_on(DeviceOp::Init);
        let r = h.request(Primitive::AudioFfi, 2, audio()).unwrap();
        let Some(Assignment::Pipeline { stages }) = &r.assignment else {
            panic!("expected a pipeline, got {:?}", r.assignment);
        };
        assert_eq!(stages.len(), 3);
        assert!(stages.iter().all(|s| s.context.device != DeviceId(0)));
        let report = h.scheduler.report();
        let bad = report.device(DeviceId(0)).unwrap();
        assert!(bad.quarantined);
        assert!(bad.contexts.is_empty());
        assert_eq!(report.granted_contexts(), 3);
    }

    #[test]
    fn failed_fallback_leaves_request_args_alone() {
        let mut h = ArbiterHarness::with_config(
            SchedulerConfig::default().with_software(Primitive::Gemm, CountingKernel::new()),
            &[],
        );
        let output = Channel::new(4, 16);
        let _writer = output.tasks().try_producer().unwrap();
        let args = ArgumentBlock::new(PrimitiveParams::gemm(4, 4, 4)).with_output(output.clone());
        let mut request = VirtualRequest::new(Primitive::Gemm, Priority::default(), args);
        assert_eq!(
            h.scheduler.search(&mut request),
            Err(AllocError::QueueClaimed(output.id()))
        );
        assert!(request.args.inputs.is_empty());
        assert!(!request.is_granted());
        assert_eq!(h.scheduler.devices().count(), 0);
    }

    #[test]
    fn oversized_shape_is_rejected() {
        let mut h = ArbiterHarness::with_config(
            SchedulerConfig::default().with_software(Primitive::Gemm, CountingKernel::new()),
            &[Primitive::AudioFft],
        );
        let args = ArgumentBlock::new(PrimitiveParams::gemm(u32::MAX, u32::MAX, 1));
        let err = h.request(Primitive::Gemm, 1, args).unwrap_err();
        assert!(matches!(err, AllocError::ShapeTooLarge { primitive: Primitive::Gemm, .. }));
        assert_eq!(h.scheduler.granted_contexts(), 0);
        assert_eq!(h.scheduler.devices().count(), 1);
    }

    #[test]
    fn undersized_queue_capacity_is_raised() {
        let mut config = SchedulerConfig::default().with_software(Primitive::Gemm, CountingKernel::new());
        config.queue_capacity = 1;
        let mut h = ArbiterHarness::with_config(config, &[Primitive::AudioFft]);
        assert_eq!(h.scheduler.config().queue_capacity, MIN_QUEUE_CAPACITY);

        let held = h.request(Primitive::AudioFft, 1, audio()).unwrap();
        let r = h
            .request(Primitive::Gemm, 1, ArgumentBlock::new(PrimitiveParams::gemm(2, 2, 2)))
            .unwrap();
        assert_eq!(r.args.inputs[0].tasks().capacity(), MIN_QUEUE_CAPACITY);
        h.scheduler.release(r.id).unwrap();
        h.scheduler.release(held.id).unwrap();
        assert_eq!(h.scheduler.granted_contexts(), 0);
    }
}
