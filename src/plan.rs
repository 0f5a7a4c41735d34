//! Plan module: walk a dataflow graph and wire a queue onto every edge.

use crate::graph::{DataflowGraph, EdgeId, GraphError, NodeId, NodeKind, SubgraphId};
use crate::invariant_ppt::{assert_invariant, QUEUE_SINGLE_ALLOC};
use crate::mem::{MemPool, QueueRef};
use std::collections::VecDeque;

/// Result of binding: leaf stages in visit order and freshly allocated edges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueuePlan {
    /// Leaf nodes, in the order devices should be assigned.
    pub stages: Vec<NodeId>,
    /// Non-binding edges that received a fresh queue from the pool.
    pub allocated: Vec<EdgeId>,
}

impl QueuePlan {
    /// Bind queues for the whole hierarchy, starting at the root entry.
    ///
    /// Traversal is breadth-first in dependency order: a node is visited
    /// once all its producers have been. Its non-binding out-edges get a
    /// queue from `pool` unless the caller already attached one; binding
    /// edges copy the queue of the outer edge they resolve to. An internal
    /// node's child graph is bound before any of its consumers is visited.
    pub fn bind(graph: &mut DataflowGraph, pool: &mut MemPool) -> Result<Self, GraphError> {
        graph.validate()?;
        let mut plan = QueuePlan::default();
        let root = graph.root();
        bind_level(graph, root, pool, &mut plan)?;
        Ok(plan)
    }

    /// Input and output queues of a leaf stage, in edge order.
    pub fn stage_queues(
        graph: &DataflowGraph,
        node: NodeId,
    ) -> Result<(Vec<QueueRef>, Vec<QueueRef>), GraphError> {
        let data = graph.node(node)?;
        let collect = |edges: &[EdgeId]| -> Result<Vec<QueueRef>, GraphError> {
            edges
                .iter()
                .map(|&e| {
                    graph
                        .edge(e)?
                        .queue
                        .clone()
                        .ok_or(GraphError::MissingQueue(e))
                })
                .collect()
        };
        Ok((collect(&data.in_edges)?, collect(&data.out_edges)?))
    }
}

fn bind_level(
    graph: &mut DataflowGraph,
    level: SubgraphId,
    pool: &mut MemPool,
    plan: &mut QueuePlan,
) -> Result<(), GraphError> {
    let sub = graph.subgraph(level)?.clone();
    let local = |n: NodeId| sub.nodes.iter().position(|&m| m == n);

    let mut in_degree = vec![0usize; sub.nodes.len()];
    for (i, &n) in sub.nodes.iter().enumerate() {
        in_degree[i] = graph.node(n)?.in_edges.len();
    }

    let mut queue = VecDeque::new();
    for (i, &deg) in in_degree.iter().enumerate() {
        if deg == 0 {
            queue.push_back(sub.nodes[i]);
        }
    }
    // Entry first keeps caller-facing edges at the front of the order.
    if let Some(pos) = queue.iter().position(|&n| n == sub.entry) {
        queue.swap(0, pos);
    }

    let mut visited = 0;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        let data = graph.node(node)?.clone();

        for &e in &data.out_edges {
            let edge = graph.edge(e)?.clone();
            if edge.is_binding() {
                let owner = graph.resolve_binding(e)?;
                let shared = graph
                    .edge(owner)?
                    .queue
                    .clone()
                    .ok_or(GraphError::MissingQueue(owner))?;
                graph.set_queue(e, shared)?;
            } else if edge.queue.is_none() {
                let fresh = pool.alloc_channel(edge.len);
                graph.set_queue(e, fresh)?;
                assert_invariant(
                    QUEUE_SINGLE_ALLOC,
                    !plan.allocated.contains(&e),
                    "non-binding edge allocated exactly once",
                    Some("bind"),
                );
                plan.allocated.push(e);
            }
        }

        match data.kind {
            NodeKind::Internal { child } => bind_level(graph, child, pool, plan)?,
            NodeKind::Leaf => plan.stages.push(node),
            NodeKind::Entry | NodeKind::Exit => {}
        }

        for &e in &data.out_edges {
            let dst = graph.edge(e)?.dst;
            if let Some(i) = local(dst) {
                in_degree[i] -= 1;
                if in_degree[i] == 0 {
                    queue.push_back(dst);
                }
            }
        }
    }

    if visited == sub.nodes.len() {
        Ok(())
    } else {
        Err(GraphError::CycleDetected)
    }
}
