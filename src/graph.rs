//! Hierarchical dataflow graphs for composite pipelines.
//!
//! Nodes, edges and subgraphs live in flat arenas and refer to each other by
//! index. An internal node owns a child subgraph (its decomposition); the
//! child's boundary edges are *binding* edges that share the queue of an
//! edge one level up instead of owning one.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::invariant_ppt::{
    assert_invariant, BINDING_RESOLVES, GRAPH_LEGALITY, GRAPH_REJECTS_INVALID,
};
use crate::mem::QueueRef;
use crate::primitive::{Primitive, PrimitiveParams};
use crate::registry::CapabilityDef;

/// Index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Index of an edge in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

/// Index of a (sub)graph. `SubgraphId(0)` is the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubgraphId(pub usize);

/// Role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Sentinel source of a subgraph.
    Entry,
    /// Sentinel sink of a subgraph.
    Exit,
    /// Primitive invocation mapped directly onto a device.
    Leaf,
    /// Composite invocation realised by its child subgraph.
    Internal {
        /// The decomposition.
        child: SubgraphId,
    },
}

/// A node in the graph.
#[derive(Debug, Clone)]
pub struct NodeData {
    /// The node's own id.
    pub id: NodeId,
    /// Sentinel, leaf or internal.
    pub kind: NodeKind,
    /// Primitive invoked; `Primitive::None` for sentinels.
    pub primitive: Primitive,
    /// The subgraph this node belongs to.
    pub graph: SubgraphId,
    /// Incoming edges, in insertion order.
    pub in_edges: Vec<EdgeId>,
    /// Outgoing edges, in insertion order.
    pub out_edges: Vec<EdgeId>,
    /// Shape of the invocation.
    pub params: PrimitiveParams,
}

impl NodeData {
    /// True for entry and exit nodes.
    pub fn is_sentinel(&self) -> bool {
        matches!(self.kind, NodeKind::Entry | NodeKind::Exit)
    }
}

/// A data dependency between two nodes of the same subgraph.
#[derive(Debug, Clone)]
pub struct EdgeData {
    /// The edge's own id.
    pub id: EdgeId,
    /// Producer node.
    pub src: NodeId,
    /// Consumer node.
    pub dst: NodeId,
    /// Elements carried per task.
    pub len: usize,
    /// The queue carrying this edge's data, once bound.
    pub queue: Option<QueueRef>,
    /// For binding edges: the edge one level up whose queue is shared.
    pub binding: Option<EdgeId>,
}

impl EdgeData {
    /// True if this edge borrows its queue from an outer edge.
    pub fn is_binding(&self) -> bool {
        self.binding.is_some()
    }
}

/// One level of the hierarchy.
#[derive(Debug, Clone)]
pub struct Subgraph {
    /// The subgraph's own id.
    pub id: SubgraphId,
    /// Internal node this subgraph decomposes; `None` for the root.
    pub owner: Option<NodeId>,
    /// Sentinel entry node.
    pub entry: NodeId,
    /// Sentinel exit node.
    pub exit: NodeId,
    /// Every node of this level, sentinels included.
    pub nodes: Vec<NodeId>,
}

/// Errors building or checking a dataflow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node does not exist.
    InvalidNode,
    /// Edge does not exist.
    InvalidEdge,
    /// Subgraph does not exist.
    InvalidSubgraph,
    /// Endpoints belong to different subgraphs.
    CrossGraphEdge,
    /// Edge into an entry node or out of an exit node.
    SentinelMisuse,
    /// Adding edge would create a cycle.
    CycleDetected,
    /// Only leaf nodes can be expanded.
    NotLeaf(NodeId),
    /// The decomposition has no components.
    EmptyDecomposition,
    /// A non-sentinel node lacks an in-edge or an out-edge.
    DanglingNode(NodeId),
    /// A binding edge does not lead to a queue-owning edge one level up.
    UnresolvedBinding(EdgeId),
    /// Two binding edges of one subgraph share the same outer edge.
    BindingNotUnique(EdgeId),
    /// The edge already carries a queue.
    QueueAlreadyBound(EdgeId),
    /// A queue was expected on this edge but none was bound.
    MissingQueue(EdgeId),
}

/// The hierarchical dataflow graph.
#[derive(Debug, Clone)]
pub struct DataflowGraph {
    nodes: Vec<NodeData>,
    edges: Vec<EdgeData>,
    subgraphs: Vec<Subgraph>,
}

impl DataflowGraph {
    /// Create a graph holding only the root's entry and exit sentinels.
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            subgraphs: Vec::new(),
        };
        graph.new_subgraph(None);
        graph
    }

    /// The root subgraph.
    pub fn root(&self) -> SubgraphId {
        SubgraphId(0)
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Result<&NodeData, GraphError> {
        self.nodes.get(id.0).ok_or(GraphError::InvalidNode)
    }

    /// Look up an edge.
    pub fn edge(&self, id: EdgeId) -> Result<&EdgeData, GraphError> {
        self.edges.get(id.0).ok_or(GraphError::InvalidEdge)
    }

    /// Look up a subgraph.
    pub fn subgraph(&self, id: SubgraphId) -> Result<&Subgraph, GraphError> {
        self.subgraphs.get(id.0).ok_or(GraphError::InvalidSubgraph)
    }

    /// All nodes, every level.
    pub fn nodes(&self) -> &[NodeData] {
        &self.nodes
    }

    /// All edges, every level.
    pub fn edges(&self) -> &[EdgeData] {
        &self.edges
    }

    /// All subgraphs; index 0 is the root.
    pub fn subgraphs(&self) -> &[Subgraph] {
        &self.subgraphs
    }

    /// The internal node whose decomposition contains `node`.
    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>, GraphError> {
        let graph = self.node(node)?.graph;
        Ok(self.subgraph(graph)?.owner)
    }

    /// Add a leaf node to `graph`.
    pub fn add_node(
        &mut self,
        graph: SubgraphId,
        primitive: Primitive,
        params: PrimitiveParams,
    ) -> Result<NodeId, GraphError> {
        self.subgraph(graph)?;
        Ok(self.push_node(graph, NodeKind::Leaf, primitive, params))
    }

    /// Add an edge that will own a freshly allocated queue.
    pub fn add_edge(&mut self, src: NodeId, dst: NodeId, len: usize) -> Result<EdgeId, GraphError> {
        self.check_edge(src, dst)?;
        Ok(self.push_edge(src, dst, len, None))
    }

    /// Add an edge sharing the queue of `outer`, an edge of the parent level
    /// touching this subgraph's owner.
    pub fn add_binding_edge(
        &mut self,
        src: NodeId,
        dst: NodeId,
        outer: EdgeId,
    ) -> Result<EdgeId, GraphError> {
        self.check_edge(src, dst)?;
        let graph = self.node(src)?.graph;
        let owner = self.subgraph(graph)?.owner;
        let outer_edge = self.edge(outer)?;
        let touches_owner = owner
            .map(|o| outer_edge.src == o || outer_edge.dst == o)
            .unwrap_or(false);
        if !touches_owner {
            return Err(GraphError::UnresolvedBinding(outer));
        }
        let len = outer_edge.len;
        Ok(self.push_edge(src, dst, len, Some(outer)))
    }

    /// Bind a caller-supplied queue to a non-binding edge.
    pub fn attach_queue(&mut self, edge: EdgeId, queue: QueueRef) -> Result<(), GraphError> {
        let data = self.edges.get_mut(edge.0).ok_or(GraphError::InvalidEdge)?;
        if data.is_binding() || data.queue.is_some() {
            return Err(GraphError::QueueAlreadyBound(edge));
        }
        data.queue = Some(queue);
        Ok(())
    }

    pub(crate) fn set_queue(&mut self, edge: EdgeId, queue: QueueRef) -> Result<(), GraphError> {
        let data = self.edges.get_mut(edge.0).ok_or(GraphError::InvalidEdge)?;
        if data.queue.is_some() {
            return Err(GraphError::QueueAlreadyBound(edge));
        }
        data.queue = Some(queue);
        Ok(())
    }

    /// Turn leaf `node` into an internal node decomposed as a chain of
    /// `def.component_list`.
    ///
    /// Outer in-edge `i` is threaded to component `min(i, k - 1)`; every
    /// outer out-edge leaves from the last component.
    pub fn expand(&mut self, node: NodeId, def: &CapabilityDef) -> Result<SubgraphId, GraphError> {
        let data = self.node(node)?.clone();
        if data.kind != NodeKind::Leaf {
            return Err(GraphError::NotLeaf(node));
        }
        if def.component_list.is_empty() {
            return Err(GraphError::EmptyDecomposition);
        }

        let child = self.new_subgraph(Some(node));
        let (entry, exit) = {
            let sub = &self.subgraphs[child.0];
            (sub.entry, sub.exit)
        };
        let len = data
            .in_edges
            .first()
            .map(|e| self.edges[e.0].len)
            .unwrap_or_else(|| data.params.elements(data.primitive));

        let mut components = Vec::with_capacity(def.component_list.len());
        for (index, &primitive) in def.component_list.iter().enumerate() {
            let mut params = data.params;
            params.inverse = def.is_inverse(index);
            components.push(self.push_node(child, NodeKind::Leaf, primitive, params));
        }
        for pair in components.windows(2) {
            self.add_edge(pair[0], pair[1], len)?;
        }
        let last = components.len() - 1;
        for (i, &outer) in data.in_edges.iter().enumerate() {
            self.add_binding_edge(entry, components[i.min(last)], outer)?;
        }
        for &outer in &data.out_edges {
            self.add_binding_edge(components[last], exit, outer)?;
        }

        self.nodes[node.0].kind = NodeKind::Internal { child };
        assert_invariant(
            GRAPH_LEGALITY,
            self.subgraphs[child.0].owner == Some(node),
            "expanded subgraph is owned by its internal node",
            Some("expand"),
        );
        Ok(child)
    }

    /// Follow a binding chain to the edge that owns the queue.
    pub fn resolve_binding(&self, edge: EdgeId) -> Result<EdgeId, GraphError> {
        let mut current = edge;
        for _ in 0..=self.edges.len() {
            match self.edge(current)?.binding {
                Some(outer) => current = outer,
                None => return Ok(current),
            }
        }
        Err(GraphError::UnresolvedBinding(edge))
    }

    /// Check structural invariants of every level.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            if !node.is_sentinel() && (node.in_edges.is_empty() || node.out_edges.is_empty()) {
                assert_invariant(
                    GRAPH_REJECTS_INVALID,
                    true,
                    "dangling node rejected",
                    Some("validate"),
                );
                return Err(GraphError::DanglingNode(node.id));
            }
        }
        for sub in &self.subgraphs {
            let mut seen = Vec::new();
            for &n in &sub.nodes {
                for &e in &self.nodes[n.0].out_edges {
                    let edge = &self.edges[e.0];
                    if let Some(outer) = edge.binding {
                        if seen.contains(&outer) {
                            return Err(GraphError::BindingNotUnique(e));
                        }
                        seen.push(outer);
                        let owner = self.resolve_binding(e)?;
                        assert_invariant(
                            BINDING_RESOLVES,
                            !self.edges[owner.0].is_binding(),
                            "binding edge resolves to a queue-owning edge",
                            Some("validate"),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn new_subgraph(&mut self, owner: Option<NodeId>) -> SubgraphId {
        let id = SubgraphId(self.subgraphs.len());
        let params = PrimitiveParams::default();
        let entry = NodeId(self.nodes.len());
        let exit = NodeId(self.nodes.len() + 1);
        self.subgraphs.push(Subgraph {
            id,
            owner,
            entry,
            exit,
            nodes: Vec::new(),
        });
        self.push_node(id, NodeKind::Entry, Primitive::None, params);
        self.push_node(id, NodeKind::Exit, Primitive::None, params);
        id
    }

    fn push_node(
        &mut self,
        graph: SubgraphId,
        kind: NodeKind,
        primitive: Primitive,
        params: PrimitiveParams,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData {
            id,
            kind,
            primitive,
            graph,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            params,
        });
        self.subgraphs[graph.0].nodes.push(id);
        id
    }

    fn push_edge(&mut self, src: NodeId, dst: NodeId, len: usize, binding: Option<EdgeId>) -> EdgeId {
        let id = EdgeId(self.edges.len());
        self.edges.push(EdgeData {
            id,
            src,
            dst,
            len,
            queue: None,
            binding,
        });
        self.nodes[src.0].out_edges.push(id);
        self.nodes[dst.0].in_edges.push(id);
        id
    }

    fn check_edge(&self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        let from = self.node(src)?;
        let to = self.node(dst)?;
        if from.graph != to.graph {
            return Err(GraphError::CrossGraphEdge);
        }
        if from.kind == NodeKind::Exit || to.kind == NodeKind::Entry {
            return Err(GraphError::SentinelMisuse);
        }
        if self.would_create_cycle(src, dst) {
            assert_invariant(
                GRAPH_REJECTS_INVALID,
                self.would_create_cycle(src, dst),
                "Cycle detected, rejecting",
                Some("add_edge"),
            );
            return Err(GraphError::CycleDetected);
        }
        Ok(())
    }

    fn would_create_cycle(&self, src: NodeId, dst: NodeId) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        self.dfs(dst, src, &mut visited)
    }

    fn dfs(&self, current: NodeId, target: NodeId, visited: &mut [bool]) -> bool {
        if current == target {
            return true;
        }
        if visited[current.0] {
            return false;
        }
        visited[current.0] = true;
        self.nodes[current.0]
            .out_edges
            .iter()
            .any(|e| self.dfs(self.edges[e.0].dst, target, visited))
    }
}

impl Default for DataflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn single_node(primitive: Primitive, inputs: usize) -> (DataflowGraph, NodeId) {
        let mut graph = DataflowGraph::new();
        let root = graph.subgraph(graph.root()).unwrap().clone();
        let node = graph
            .add_node(root.id, primitive, PrimitiveParams::audio(8))
            .unwrap();
        for _ in 0..inputs {
            graph.add_edge(root.entry, node, 256).unwrap();
        }
        graph.add_edge(node, root.exit, 256).unwrap();
        (graph, node)
    }

    #[test]
    fn new_graph_has_root_sentinels() {
        let graph = DataflowGraph::new();
        let root = graph.subgraph(graph.root()).unwrap();
        assert_eq!(root.owner, None);
        assert_eq!(graph.node(root.entry).unwrap().kind, NodeKind::Entry);
        assert_eq!(graph.node(root.exit).unwrap().kind, NodeKind::Exit);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn graph_cycle_detection() {
        let mut graph = DataflowGraph::new();
        let root = graph.root();
        let a = graph.add_node(root, Primitive::AudioFft, PrimitiveParams::default()).unwrap();
        let b = graph.add_node(root, Primitive::AudioFir, PrimitiveParams::default()).unwrap();
        graph.add_edge(a, b, 4).unwrap();
        assert_eq!(graph.add_edge(b, a, 4), Err(GraphError::CycleDetected));
    }

    #[test]
    fn sentinels_cannot_be_misused() {
        let graph_err = {
            let mut graph = DataflowGraph::new();
            let root = graph.subgraph(graph.root()).unwrap().clone();
            graph.add_edge(root.exit, root.entry, 1)
        };
        assert_eq!(graph_err, Err(GraphError::SentinelMisuse));
    }

    #[test]
    fn dangling_node_fails_validation() {
        let mut graph = DataflowGraph::new();
        let root = graph.subgraph(graph.root()).unwrap().clone();
        let node = graph.add_node(root.id, Primitive::Gemm, PrimitiveParams::default()).unwrap();
        graph.add_edge(root.entry, node, 1).unwrap();
        assert_eq!(graph.validate(), Err(GraphError::DanglingNode(node)));
    }

    #[test]
    fn expand_ffi_threads_boundary_edges() {
        let (mut graph, ffi) = single_node(Primitive::AudioFfi, 2);
        let def = crate::registry::CapabilityRegistry::default().get(Primitive::AudioFfi);
        let child = graph.expand(ffi, &def).unwrap();
        assert_eq!(graph.node(ffi).unwrap().kind, NodeKind::Internal { child });
        graph.validate().unwrap();

        let sub = graph.subgraph(child).unwrap().clone();
        let comps: Vec<_> = sub
            .nodes
            .iter()
            .map(|n| graph.node(*n).unwrap().clone())
            .filter(|n| n.kind == NodeKind::Leaf)
            .collect();
        assert_eq!(comps.len(), 3);
        assert!(comps[2].params.inverse);
        assert_eq!(graph.parent(comps[0].id).unwrap(), Some(ffi));

        let outer_in = graph.node(ffi).unwrap().in_edges.clone();
        let entry_out = graph.node(sub.entry).unwrap().out_edges.clone();
        assert_eq!(graph.edge(entry_out[0]).unwrap().dst, comps[0].id);
        assert_eq!(graph.edge(entry_out[1]).unwrap().dst, comps[1].id);
        assert_eq!(graph.resolve_binding(entry_out[0]).unwrap(), outer_in[0]);
        assert_eq!(graph.resolve_binding(entry_out[1]).unwrap(), outer_in[1]);
    }

    #[test]
    fn expand_rejects_internal_nodes() {
        let (mut graph, ffi) = single_node(Primitive::AudioFfi, 1);
        let def = crate::registry::CapabilityRegistry::default().get(Primitive::AudioFfi);
        graph.expand(ffi, &def).unwrap();
        assert_eq!(graph.expand(ffi, &def), Err(GraphError::NotLeaf(ffi)));
    }

    #[test]
    fn binding_must_touch_owner() {
        let (mut graph, node) = single_node(Primitive::AudioFft, 1);
        let root = graph.subgraph(graph.root()).unwrap().clone();
        let outer = graph.node(node).unwrap().in_edges[0];
        // The root has no owner, so nothing at root level can bind.
        let other = graph.add_node(root.id, Primitive::AudioFir, PrimitiveParams::default()).unwrap();
        assert_eq!(
            graph.add_binding_edge(root.entry, other, outer),
            Err(GraphError::UnresolvedBinding(outer))
        );
    }

    #[test]
    fn attach_queue_only_once() {
        let (mut graph, node) = single_node(Primitive::AudioFft, 1);
        let edge = graph.node(node).unwrap().in_edges[0];
        let q = crate::mem::Channel::new(4, 256);
        graph.attach_queue(edge, q.clone()).unwrap();
        assert_eq!(graph.attach_queue(edge, q), Err(GraphError::QueueAlreadyBound(edge)));
    }

    proptest! {
        #[test]
        fn chain_expansion_always_validates(k in 1usize..6, inputs in 1usize..4) {
            let (mut graph, node) = single_node(Primitive::AudioFfi, inputs);
            let def = crate::registry::CapabilityDef::pipeline(&vec![Primitive::AudioFir; k]);
            graph.expand(node, &def).unwrap();
            prop_assert!(graph.validate().is_ok());
            prop_assert_eq!(graph.subgraphs().len(), 2);
        }
    }
}
