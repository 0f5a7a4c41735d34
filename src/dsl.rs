//! DSL module: builder API and text loader for dataflow graphs.
//!
//! The text form has one declaration per line:
//!
//! ```text
//! N <id> <op> <op-args...>    # node; op is a primitive name
//! E <src> <dst> <len>         # edge of len elements
//! ```
//!
//! `in` and `out` name the root entry and exit. Audio ops take
//! `<log_len> [inverse]`, `gemm` takes `<m> <n> <k>`. Blank lines and lines
//! starting with `#` are skipped.

use crate::graph::{DataflowGraph, EdgeId, GraphError, NodeId};
use crate::mem::QueueRef;
use crate::primitive::{Primitive, PrimitiveParams};
use std::collections::HashMap;
use thiserror::Error;

/// Name of the root entry node in the text form.
pub const ENTRY_NAME: &str = "in";
/// Name of the root exit node in the text form.
pub const EXIT_NAME: &str = "out";

/// Handle to a node in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle(pub NodeId);

/// The graph builder. Nodes are added to the root level.
#[derive(Debug)]
pub struct GraphBuilder {
    graph: DataflowGraph,
    node_names: HashMap<String, NodeId>,
}

impl GraphBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            graph: DataflowGraph::new(),
            node_names: HashMap::new(),
        }
    }

    /// Root entry sentinel.
    pub fn entry(&self) -> Result<NodeHandle, DslError> {
        let root = self.graph.subgraph(self.graph.root())?;
        Ok(NodeHandle(root.entry))
    }

    /// Root exit sentinel.
    pub fn exit(&self) -> Result<NodeHandle, DslError> {
        let root = self.graph.subgraph(self.graph.root())?;
        Ok(NodeHandle(root.exit))
    }

    /// Add a node running `primitive`.
    pub fn node(&mut self, primitive: Primitive, params: PrimitiveParams) -> Result<NodeHandle, DslError> {
        let id = self.graph.add_node(self.graph.root(), primitive, params)?;
        Ok(NodeHandle(id))
    }

    /// Add a named node.
    pub fn node_named(
        &mut self,
        name: &str,
        primitive: Primitive,
        params: PrimitiveParams,
    ) -> Result<NodeHandle, DslError> {
        if self.node_names.contains_key(name) || name == ENTRY_NAME || name == EXIT_NAME {
            return Err(DslError::DuplicateName(name.to_string()));
        }
        let handle = self.node(primitive, params)?;
        self.node_names.insert(name.to_string(), handle.0);
        Ok(handle)
    }

    /// Look up a named node; `in` and `out` are the sentinels.
    pub fn lookup(&self, name: &str) -> Result<NodeHandle, DslError> {
        match name {
            ENTRY_NAME => self.entry(),
            EXIT_NAME => self.exit(),
            _ => self
                .node_names
                .get(name)
                .map(|&id| NodeHandle(id))
                .ok_or_else(|| DslError::MissingNode(name.to_string())),
        }
    }

    /// Connect two nodes with an edge of `len` elements.
    pub fn connect(&mut self, from: NodeHandle, to: NodeHandle, len: usize) -> Result<EdgeId, DslError> {
        Ok(self.graph.add_edge(from.0, to.0, len)?)
    }

    /// Connect two nodes through a caller-supplied queue.
    pub fn connect_queue(
        &mut self,
        from: NodeHandle,
        to: NodeHandle,
        queue: QueueRef,
    ) -> Result<EdgeId, DslError> {
        let len = queue.buffer().payload_len() / crate::mem::ELEMENT_SIZE;
        let edge = self.graph.add_edge(from.0, to.0, len)?;
        self.graph.attach_queue(edge, queue)?;
        Ok(edge)
    }

    /// Build the graph, checking its structure.
    pub fn build(self) -> Result<DataflowGraph, DslError> {
        self.graph.validate()?;
        Ok(self.graph)
    }

    /// Load a graph from its text form.
    pub fn parse(text: &str) -> Result<DataflowGraph, DslError> {
        let mut builder = GraphBuilder::new();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let fields: Vec<&str> = raw.split_whitespace().collect();
            match fields.as_slice() {
                [] => {}
                [first, ..] if first.starts_with('#') => {}
                ["N", id, op, args @ ..] => {
                    let primitive = parse_primitive(op).ok_or_else(|| DslError::Syntax {
                        line,
                        reason: format!("unknown op '{}'", op),
                    })?;
                    let params = parse_params(primitive, args, line)?;
                    builder.node_named(id, primitive, params)?;
                }
                ["E", src, dst, len] => {
                    let len = len.parse().map_err(|_| DslError::Syntax {
                        line,
                        reason: format!("bad edge length '{}'", len),
                    })?;
                    let src = builder.lookup(src)?;
                    let dst = builder.lookup(dst)?;
                    builder.connect(src, dst, len)?;
                }
                _ => {
                    return Err(DslError::Syntax {
                        line,
                        reason: format!("unrecognised declaration '{}'", raw.trim()),
                    })
                }
            }
        }
        builder.build()
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_primitive(op: &str) -> Option<Primitive> {
    Primitive::ALL.iter().copied().find(|p| p.name() == op)
}

fn parse_params(primitive: Primitive, args: &[&str], line: usize) -> Result<PrimitiveParams, DslError> {
    let number = |s: &str| {
        s.parse::<u32>().map_err(|_| DslError::Syntax {
            line,
            reason: format!("bad number '{}'", s),
        })
    };
    match (primitive, args) {
        (Primitive::Gemm, [m, n, k]) => Ok(PrimitiveParams::gemm(number(*m)?, number(*n)?, number(*k)?)),
        (Primitive::Gemm, _) => Err(DslError::Syntax {
            line,
            reason: "gemm takes <m> <n> <k>".to_string(),
        }),
        (_, [log_len]) => Ok(PrimitiveParams::audio(number(*log_len)?)),
        (_, [log_len, "inverse"]) => {
            let mut params = PrimitiveParams::audio(number(*log_len)?);
            params.inverse = true;
            Ok(params)
        }
        _ => Err(DslError::Syntax {
            line,
            reason: format!("{} takes <log_len> [inverse]", primitive),
        }),
    }
}

/// DSL-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DslError {
    #[error("graph error: {0:?}")]
    Graph(GraphError),
    #[error("no node named '{0}'")]
    MissingNode(String),
    #[error("node name '{0}' is already taken")]
    DuplicateName(String),
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },
}

impl From<GraphError> for DslError {
    fn from(err: GraphError) -> Self {
        DslError::Graph(err)
    }
}
