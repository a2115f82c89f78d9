//! Tensor lifetimes over the execution order

use crate::graph::{Graph, NodeId, TensorId, TensorKind};

/// Last step at which each tensor's memory is needed
#[derive(Debug, Clone)]
pub(crate) struct Liveness {
    /// Per root tensor; `None` when nothing reads it
    last_use: Vec<Option<usize>>,
    /// Roots aliased by at least one view
    aliased: Vec<bool>,
}

/// Step value for tensors that must survive the whole pass
pub(crate) const END_OF_PASS: usize = usize::MAX;

impl Liveness {
    /// Single reverse pass over the nodes. Uses of a view count as uses of
    /// its root; graph outputs live until the end of the pass.
    pub(crate) fn analyze(graph: &Graph) -> Self {
        let mut last_use = vec![None; graph.num_tensors()];
        let mut aliased = vec![false; graph.num_tensors()];

        for (_, info) in graph.tensors() {
            if let TensorKind::View { root, .. } = info.kind {
                aliased[root.0] = true;
            }
        }

        for step in (0..graph.num_nodes()).rev() {
            for &input in &graph.node(NodeId(step)).inputs {
                let root = graph.root(input);
                if last_use[root.0].is_none() {
                    last_use[root.0] = Some(step);
                }
            }
        }

        for &output in graph.outputs() {
            last_use[graph.root(output).0] = Some(END_OF_PASS);
        }

        Self { last_use, aliased }
    }

    pub(crate) fn last_use(&self, tensor: TensorId) -> Option<usize> {
        self.last_use[tensor.0]
    }

    pub(crate) fn dies_at(&self, tensor: TensorId, step: usize) -> bool {
        self.last_use[tensor.0] == Some(step)
    }

    pub(crate) fn is_aliased(&self, tensor: TensorId) -> bool {
        self.aliased[tensor.0]
    }
}
