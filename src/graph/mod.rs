//! Computation graphs
//!
//! A graph is an arena of tensors and nodes addressed by index. Nodes can only
//! reference tensors that already exist, so creation order is a topological
//! order and the graph is acyclic by construction.

mod builder;
mod error;
mod op;
mod shape;

pub use builder::GraphBuilder;
pub use error::GraphError;
pub use op::{OpCode, OpKind};

use crate::backend::BoundTensor;
use crate::tensor::{DType, Layout};
use std::fmt;

/// Index of a tensor inside its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) usize);

impl TensorId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Index of a node inside its graph (its position in execution order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Where a tensor's memory comes from
#[derive(Debug, Clone)]
pub enum TensorKind {
    /// Already resident in a backend buffer
    Weight(BoundTensor),
    /// Filled by the caller on every execution
    Input,
    /// Produced by a node into planner-assigned memory
    Computed(NodeId),
    /// Produced by a view node; aliases the memory of `root`
    View { node: NodeId, root: TensorId },
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: Option<String>,
    pub dtype: DType,
    /// Geometry relative to the start of the root's memory
    pub layout: Layout,
    pub kind: TensorKind,
}

impl TensorInfo {
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, TensorKind::Weight(_) | TensorKind::Input)
    }

    pub fn is_view(&self) -> bool {
        matches!(self.kind, TensorKind::View { .. })
    }

    /// Node producing this tensor, if any
    pub fn producer(&self) -> Option<NodeId> {
        match self.kind {
            TensorKind::Computed(node) | TensorKind::View { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Bytes this tensor needs when materialized contiguously
    pub fn packed_size(&self) -> usize {
        self.layout.packed_size(self.dtype)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: OpKind,
    pub inputs: Vec<TensorId>,
    pub output: TensorId,
}

/// An immutable computation graph
#[derive(Debug, Clone)]
pub struct Graph {
    tensors: Vec<TensorInfo>,
    nodes: Vec<Node>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
}

impl Graph {
    pub(crate) fn from_parts(
        tensors: Vec<TensorInfo>,
        nodes: Vec<Node>,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Self {
        Self {
            tensors,
            nodes,
            inputs,
            outputs,
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<TensorInfo>, Vec<Node>, Vec<TensorId>, Vec<TensorId>) {
        (self.tensors, self.nodes, self.inputs, self.outputs)
    }

    pub fn tensor(&self, id: TensorId) -> &TensorInfo {
        &self.tensors[id.0]
    }

    pub fn get_tensor(&self, id: TensorId) -> Option<&TensorInfo> {
        self.tensors.get(id.0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn tensors(&self) -> impl Iterator<Item = (TensorId, &TensorInfo)> {
        self.tensors.iter().enumerate().map(|(i, t)| (TensorId(i), t))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Runtime inputs in declaration order
    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn is_output(&self, id: TensorId) -> bool {
        self.outputs.contains(&id)
    }

    /// Tensor whose memory `id` aliases (itself unless it is a view)
    pub fn root(&self, id: TensorId) -> TensorId {
        match self.tensors[id.0].kind {
            TensorKind::View { root, .. } => root,
            _ => id,
        }
    }

    /// First tensor carrying `name`
    pub fn find(&self, name: &str) -> Option<TensorId> {
        self.tensors
            .iter()
            .position(|t| t.name.as_deref() == Some(name))
            .map(TensorId)
    }

    /// Name for diagnostics: the tensor's name or its id
    pub fn display_name(&self, id: TensorId) -> String {
        match self.tensors.get(id.0).and_then(|t| t.name.as_deref()) {
            Some(name) => name.to_string(),
            None => id.to_string(),
        }
    }
}
