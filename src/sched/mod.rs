//! Backend assignment and graph splitting
//!
//! The scheduler decides a backend for every tensor, inserts a `Transfer`
//! node wherever a consumer runs on a different backend than one of its
//! inputs, and groups consecutive nodes on the same backend into splits.

mod placement;

pub use placement::{PlacementPolicy, PlacementRule, TieBreak};

use crate::backend::{BackendId, BackendRegistry};
use crate::graph::{Graph, Node, NodeId, OpKind, TensorId, TensorInfo, TensorKind};
use crate::tensor::Layout;
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum SchedError {
    #[error("Placement names unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("Weight '{name}' lives on backend {backend}, which is not registered")]
    UnregisteredWeight { name: String, backend: BackendId },

    #[error("No backend registered")]
    NoBackends,

    #[error("Tensor error: {0}")]
    Tensor(#[from] crate::tensor::TensorError),
}

/// Maximal run of consecutive nodes assigned to one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub backend: BackendId,
    pub nodes: Range<usize>,
}

/// A graph with a backend for every tensor and transfers inserted
#[derive(Debug, Clone)]
pub struct ScheduledGraph {
    graph: Graph,
    placement: Vec<BackendId>,
    splits: Vec<Split>,
    num_transfers: usize,
}

impl ScheduledGraph {
    /// The graph including inserted transfer nodes.
    ///
    /// Tensor ids of the original graph are unchanged; node ids are renumbered.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn backend_of(&self, tensor: TensorId) -> BackendId {
        self.placement[tensor.0]
    }

    /// Backend a node runs on: the backend of its output
    pub fn node_backend(&self, node: NodeId) -> BackendId {
        self.placement[self.graph.node(node).output.0]
    }

    pub fn splits(&self) -> &[Split] {
        &self.splits
    }

    pub fn num_transfers(&self) -> usize {
        self.num_transfers
    }

    /// Backends that own at least one tensor of the graph
    pub fn backends(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.placement.clone();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Assigns backends and inserts transfers
pub struct Scheduler<'a> {
    registry: &'a BackendRegistry,
    policy: &'a PlacementPolicy,
    tie_break: TieBreak,
}

impl<'a> Scheduler<'a> {
    pub fn new(registry: &'a BackendRegistry, policy: &'a PlacementPolicy) -> Self {
        Self {
            registry,
            policy,
            tie_break: TieBreak::default(),
        }
    }

    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    fn resolve(&self, name: &str) -> Result<BackendId, SchedError> {
        self.registry
            .by_name(name)
            .ok_or_else(|| SchedError::UnknownBackend(name.to_string()))
    }

    fn default_backend(&self) -> Result<BackendId, SchedError> {
        match &self.policy.default_backend {
            Some(name) => self.resolve(name),
            None => self.registry.default_backend().map_err(|_| SchedError::NoBackends),
        }
    }

    /// Backend pinned by a rule for a named tensor
    fn pinned(&self, info: &TensorInfo) -> Result<Option<BackendId>, SchedError> {
        match info.name.as_deref().and_then(|n| self.policy.backend_for(n)) {
            Some(backend) => self.resolve(backend).map(Some),
            None => Ok(None),
        }
    }

    pub fn schedule(&self, graph: &Graph) -> Result<ScheduledGraph, SchedError> {
        let default = self.default_backend()?;
        let mut placement = Vec::with_capacity(graph.num_tensors());

        for (id, info) in graph.tensors() {
            let backend = match &info.kind {
                TensorKind::Weight(bound) => {
                    let backend = bound.backend();
                    if self.registry.get(backend).is_none() {
                        return Err(SchedError::UnregisteredWeight {
                            name: graph.display_name(id),
                            backend,
                        });
                    }
                    backend
                }
                TensorKind::Input => self.pinned(info)?.unwrap_or(default),
                // Views stay with their source
                TensorKind::View { node, .. } => placement[graph.node(*node).inputs[0].0],
                TensorKind::Computed(node) => match self.pinned(info)? {
                    Some(backend) => backend,
                    None => self.choose(graph, graph.node(*node), &placement, default),
                },
            };
            placement.push(backend);
        }

        let scheduled = self.insert_transfers(graph, placement)?;
        debug!(
            nodes = scheduled.graph.num_nodes(),
            transfers = scheduled.num_transfers,
            splits = scheduled.splits.len(),
            "scheduled graph"
        );
        Ok(scheduled)
    }

    fn choose(&self, graph: &Graph, node: &Node, placement: &[BackendId], default: BackendId) -> BackendId {
        // Input backends in definition order, with vote counts
        let mut votes: Vec<(BackendId, usize)> = Vec::new();
        for input in &node.inputs {
            let backend = placement[input.0];
            match votes.iter_mut().find(|(b, _)| *b == backend) {
                Some((_, count)) => *count += 1,
                None => votes.push((backend, 1)),
            }
        }
        let best = votes.iter().map(|&(_, c)| c).max().unwrap_or(0);
        let tied: Vec<BackendId> = votes.iter().filter(|&&(_, c)| c == best).map(|&(b, _)| b).collect();

        let chosen = match self.tie_break {
            TieBreak::Default if tied.contains(&default) => default,
            _ => tied.first().copied().unwrap_or(default),
        };

        let op = node.op.code();
        let Some(&first) = node.inputs.first() else {
            return chosen;
        };
        let dtype = graph.tensor(first).dtype;
        if self.registry.supports(chosen, op, dtype) {
            return chosen;
        }

        let fallback = votes
            .iter()
            .map(|&(b, _)| b)
            .chain(std::iter::once(default))
            .chain(self.registry.ids())
            .find(|&b| self.registry.supports(b, op, dtype));
        match fallback {
            Some(backend) => {
                warn!(
                    op = %op,
                    dtype = %dtype,
                    from = self.registry.name_of(chosen),
                    to = self.registry.name_of(backend),
                    "no kernel on preferred backend, falling back"
                );
                backend
            }
            None => chosen,
        }
    }

    fn insert_transfers(&self, graph: &Graph, mut placement: Vec<BackendId>) -> Result<ScheduledGraph, SchedError> {
        let (mut tensors, old_nodes, inputs, outputs) = graph.clone().into_parts();
        let mut nodes: Vec<Node> = Vec::with_capacity(old_nodes.len());
        let mut transfers: HashMap<(TensorId, BackendId), TensorId> = HashMap::new();

        for mut node in old_nodes {
            let target = placement[node.output.0];
            if !node.op.is_view() {
                for input in node.inputs.iter_mut() {
                    let source = placement[input.0];
                    if source == target {
                        continue;
                    }
                    if let Some(&copy) = transfers.get(&(*input, target)) {
                        *input = copy;
                        continue;
                    }

                    let info = &tensors[input.0];
                    let copy_info = TensorInfo {
                        name: Some(format!(
                            "{}@{}",
                            graph.display_name(*input),
                            self.registry.name_of(target)
                        )),
                        dtype: info.dtype,
                        layout: Layout::contiguous(info.shape())?,
                        kind: TensorKind::Computed(NodeId(nodes.len())),
                    };
                    let copy = TensorId(tensors.len());
                    tensors.push(copy_info);
                    placement.push(target);
                    nodes.push(Node {
                        op: OpKind::Transfer,
                        inputs: vec![*input],
                        output: copy,
                    });
                    transfers.insert((*input, target), copy);
                    *input = copy;
                }
            }

            let id = NodeId(nodes.len());
            match &mut tensors[node.output.0].kind {
                TensorKind::Computed(n) | TensorKind::View { node: n, .. } => *n = id,
                _ => {}
            }
            nodes.push(node);
        }

        let splits = split_runs(&nodes, &placement);
        let num_transfers = transfers.len();
        Ok(ScheduledGraph {
            graph: Graph::from_parts(tensors, nodes, inputs, outputs),
            placement,
            splits,
            num_transfers,
        })
    }
}

fn split_runs(nodes: &[Node], placement: &[BackendId]) -> Vec<Split> {
    let mut splits: Vec<Split> = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let backend = placement[node.output.0];
        match splits.last_mut() {
            Some(split) if split.backend == backend => split.nodes.end = i + 1,
            _ => splits.push(Split {
                backend,
                nodes: i..i + 1,
            }),
        }
    }
    splits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuConfig;
    use crate::backend::stream::StreamConfig;
    use crate::backend::Backend;
    use crate::graph::{GraphBuilder, OpCode};
    use crate::tensor::{DType, HostTensor};

    fn registry(accel: StreamConfig) -> BackendRegistry {
        BackendRegistry::from_configs(&CpuConfig::default(), &[accel]).unwrap()
    }

    fn weight_on(registry: &BackendRegistry, backend: &str, name: &str, shape: &[usize]) -> crate::backend::BoundTensor {
        let id = registry.by_name(backend).unwrap();
        let n: usize = shape.iter().product();
        let host = HostTensor::from_f32(&vec![1.0; n], shape.to_vec()).unwrap();
        registry.get(id).unwrap().upload(name, &host).unwrap()
    }

    #[test]
    fn test_single_backend_has_one_split() {
        let registry = registry(StreamConfig::named("accel"));
        let mut b = GraphBuilder::new();
        let x = b.input("x", DType::F32, &[2, 4]).unwrap();
        let y = b.relu(x).unwrap();
        let z = b.scale(y, 2.0).unwrap();
        b.mark_output(z).unwrap();
        let graph = b.build().unwrap();

        let policy = PlacementPolicy::new();
        let scheduled = Scheduler::new(&registry, &policy).schedule(&graph).unwrap();
        assert_eq!(scheduled.num_transfers(), 0);
        assert_eq!(
            scheduled.splits(),
            &[Split {
                backend: BackendId(0),
                nodes: 0..2
            }]
        );
    }

    #[test]
    fn test_transfer_inserted_and_reused() {
        let registry = registry(StreamConfig::named("accel"));
        let w = weight_on(&registry, "accel", "w", &[4, 4]);

        let mut b = GraphBuilder::new();
        let x = b.input("x", DType::F32, &[4, 4]).unwrap();
        let wt = b.weight("w", &w).unwrap();
        // Two consumers on the accelerator both need x
        let h = b.matmul(wt, x).unwrap();
        let g = b.mul(wt, x).unwrap();
        let out = b.add(h, g).unwrap();
        b.mark_output(out).unwrap();
        let graph = b.build().unwrap();

        // Tie between cpu (x) and accel (w): first input wins
        let policy = PlacementPolicy::new();
        let scheduled = Scheduler::new(&registry, &policy).schedule(&graph).unwrap();
        let accel = BackendId(1);
        assert_eq!(scheduled.backend_of(h), accel);
        assert_eq!(scheduled.backend_of(g), accel);
        assert_eq!(scheduled.num_transfers(), 1);

        let sg = scheduled.graph();
        assert_eq!(sg.num_nodes(), graph.num_nodes() + 1);
        let (first_id, first) = sg.nodes().next().unwrap();
        assert_eq!(first.op, OpKind::Transfer);
        assert_eq!(first.inputs, vec![x]);
        assert_eq!(scheduled.node_backend(first_id), accel);
        assert_eq!(sg.display_name(first.output), "x@accel");
        assert_eq!(scheduled.splits().len(), 1);
    }

    #[test]
    fn test_tie_break_default() {
        let registry = registry(StreamConfig::named("accel"));
        let w = weight_on(&registry, "accel", "w", &[4]);

        let mut b = GraphBuilder::new();
        let wt = b.weight("w", &w).unwrap();
        let x = b.input("x", DType::F32, &[4]).unwrap();
        let y = b.add(wt, x).unwrap();
        b.mark_output(y).unwrap();
        let graph = b.build().unwrap();

        let policy = PlacementPolicy::new();
        let first = Scheduler::new(&registry, &policy).schedule(&graph).unwrap();
        assert_eq!(first.backend_of(y), BackendId(1));

        let preferred = Scheduler::new(&registry, &policy)
            .tie_break(TieBreak::Default)
            .schedule(&graph)
            .unwrap();
        assert_eq!(preferred.backend_of(y), BackendId(0));
    }

    #[test]
    fn test_missing_kernel_falls_back() {
        let partial = StreamConfig {
            ops: Some(vec![OpCode::Add]),
            ..StreamConfig::named("accel")
        };
        let registry = registry(partial);
        let policy = PlacementPolicy::new().rule("x", "accel");

        let mut b = GraphBuilder::new();
        let x = b.input("x", DType::F32, &[8]).unwrap();
        let y = b.softmax(x).unwrap();
        b.mark_output(y).unwrap();
        let graph = b.build().unwrap();

        let scheduled = Scheduler::new(&registry, &policy).schedule(&graph).unwrap();
        assert_eq!(scheduled.backend_of(x), BackendId(1));
        assert_eq!(scheduled.backend_of(y), BackendId(0));
        assert_eq!(scheduled.num_transfers(), 1);
    }

    #[test]
    fn test_views_follow_source_and_pins_are_kept() {
        let registry = registry(StreamConfig::named("accel"));
        let policy = PlacementPolicy::new().rule("act", "accel");

        let mut b = GraphBuilder::new();
        let x = b.input("x", DType::F32, &[2, 3]).unwrap();
        let t = b.transpose(x).unwrap();
        let act = b.relu(t).unwrap();
        b.set_name(act, "act").unwrap();
        b.mark_output(act).unwrap();
        let graph = b.build().unwrap();

        let scheduled = Scheduler::new(&registry, &policy).schedule(&graph).unwrap();
        assert_eq!(scheduled.backend_of(t), BackendId(0));
        assert_eq!(scheduled.backend_of(act), BackendId(1));
        assert_eq!(scheduled.splits().len(), 2);
    }

    #[test]
    fn test_unknown_backend_in_policy() {
        let registry = registry(StreamConfig::named("accel"));
        let policy = PlacementPolicy::new().with_default("gpu9");
        let mut b = GraphBuilder::new();
        let x = b.input("x", DType::F32, &[2]).unwrap();
        b.mark_output(x).unwrap();
        let graph = b.build().unwrap();
        assert!(matches!(
            Scheduler::new(&registry, &policy).schedule(&graph),
            Err(SchedError::UnknownBackend(name)) if name == "gpu9"
        ));
    }
}
