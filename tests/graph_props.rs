use accel_arbiter::graph::DataflowGraph;
use accel_arbiter::mem::{Channel, MemPool};
use accel_arbiter::plan::QueuePlan;
use accel_arbiter::primitive::{Primitive, PrimitiveParams};
use accel_arbiter::registry::CapabilityRegistry;
use proptest::prelude::*;
use std::sync::Arc;

fn primitive() -> impl Strategy<Value = Primitive> {
    prop::sample::select(Primitive::ALL.to_vec())
}

/// entry -> p0 -> p1 -> ... -> exit, every composite node expanded.
fn chain(prims: &[Primitive], supply_input: bool) -> (DataflowGraph, usize) {
    let mut graph = DataflowGraph::new();
    let root = graph.subgraph(graph.root()).unwrap().clone();
    let mut prev = root.entry;
    let mut supplied = 0;
    let mut nodes = Vec::new();
    for &p in prims {
        let node = graph.add_node(root.id, p, PrimitiveParams::audio(4)).unwrap();
        let edge = graph.add_edge(prev, node, 16).unwrap();
        if prev == root.entry && supply_input {
            graph.attach_queue(edge, Channel::new(4, 16)).unwrap();
            supplied += 1;
        }
        nodes.push(node);
        prev = node;
    }
    graph.add_edge(prev, root.exit, 16).unwrap();
    let registry = CapabilityRegistry::default();
    for node in nodes {
        let p = graph.node(node).unwrap().primitive;
        if registry.is_composable(p) {
            graph.expand(node, &registry.get(p)).unwrap();
        }
    }
    (graph, supplied)
}

proptest! {
    #[test]
    fn binding_wires_every_edge(
        prims in prop::collection::vec(primitive(), 1..6),
        supply_input in any::<bool>(),
    ) {
        let (mut graph, supplied) = chain(&prims, supply_input);
        let mut pool = MemPool::new(4);
        let plan = QueuePlan::bind(&mut graph, &mut pool).unwrap();

        let owning = graph.edges().iter().filter(|e| !e.is_binding()).count();
        prop_assert_eq!(plan.allocated.len(), owning - supplied);
        prop_assert_eq!(pool.allocated(), plan.allocated.len());

        for edge in graph.edges() {
            let queue = edge.queue.clone();
            prop_assert!(queue.is_some());
            if edge.is_binding() {
                let owner = graph.resolve_binding(edge.id).unwrap();
                let owner_queue = graph.edge(owner).unwrap().queue.clone().unwrap();
                prop_assert!(Arc::ptr_eq(&queue.unwrap(), &owner_queue));
            }
        }
        for &stage in &plan.stages {
            let p = graph.node(stage).unwrap().primitive;
            prop_assert!(p != Primitive::AudioFfi);
        }
    }

    #[test]
    fn binding_is_deterministic(prims in prop::collection::vec(primitive(), 1..6)) {
        let run = || {
            let (mut graph, _) = chain(&prims, false);
            let mut pool = MemPool::new(4);
            let plan = QueuePlan::bind(&mut graph, &mut pool).unwrap();
            let order: Vec<Primitive> = plan
                .stages
                .iter()
                .map(|&n| graph.node(n).unwrap().primitive)
                .collect();
            (plan, order)
        };
        let (p1, o1) = run();
        let (p2, o2) = run();
        prop_assert_eq!(p1, p2);
        prop_assert_eq!(o1, o2);
    }
}
