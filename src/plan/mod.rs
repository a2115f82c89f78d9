//! Memory planning
//!
//! Assigns every runtime input, intermediate and transfer output an offset
//! inside one arena per backend. Weights are already bound and views alias
//! their root, so neither is planned. Tensors whose lifetimes do not overlap
//! share memory; an eligible operation may write over an input that dies at
//! that step.

mod allocator;
mod liveness;

pub use allocator::AllocStrategy;

use crate::backend::{BackendId, BackendRegistry};
use crate::graph::{TensorId, TensorKind};
use crate::sched::ScheduledGraph;
use allocator::FreeListAllocator;
use liveness::Liveness;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Backend '{backend}' needs an arena of {required} bytes but the budget is {budget}")]
    OutOfArena {
        backend: String,
        required: usize,
        budget: usize,
    },

    #[error("Arena budget names unknown backend '{0}'")]
    UnknownBackend(String),
}

/// Planner settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOptions {
    pub strategy: AllocStrategy,
    pub allow_inplace: bool,
    /// Arena budget in bytes per backend name
    pub budgets: HashMap<String, usize>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            strategy: AllocStrategy::default(),
            allow_inplace: true,
            budgets: HashMap::new(),
        }
    }
}

/// Where a planned tensor lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub backend: BackendId,
    pub offset: usize,
    pub size: usize,
}

/// Planning summary for one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendPlan {
    pub backend: String,
    /// Bytes the arena must provide
    pub arena_size: usize,
    /// Largest total size of simultaneously live tensors
    pub peak_live_bytes: usize,
    /// Sum of the sizes of every planned tensor
    pub total_planned_bytes: usize,
    pub planned_tensors: usize,
}

/// Arena offsets for every planned tensor of a scheduled graph
#[derive(Debug, Clone)]
pub struct MemoryPlan {
    slots: Vec<Option<Slot>>,
    backends: BTreeMap<BackendId, BackendPlan>,
    inplace: usize,
}

impl MemoryPlan {
    /// Slot of a root tensor; `None` for weights and views
    pub fn slot(&self, tensor: TensorId) -> Option<Slot> {
        self.slots.get(tensor.0).copied().flatten()
    }

    pub fn backend(&self, id: BackendId) -> Option<&BackendPlan> {
        self.backends.get(&id)
    }

    pub fn backends(&self) -> impl Iterator<Item = (BackendId, &BackendPlan)> {
        self.backends.iter().map(|(&id, plan)| (id, plan))
    }

    pub fn arena_size(&self, id: BackendId) -> usize {
        self.backends.get(&id).map_or(0, |p| p.arena_size)
    }

    /// Outputs that reuse the memory of a dying input
    pub fn inplace_reuses(&self) -> usize {
        self.inplace
    }
}

/// Allocator and running totals for one backend
struct ArenaState {
    alloc: FreeListAllocator,
    planned_bytes: usize,
    planned_tensors: usize,
}

/// Slots handed out so far, across backends
struct Arenas {
    states: BTreeMap<BackendId, ArenaState>,
    slots: Vec<Option<Slot>>,
}

impl Arenas {
    fn allocate(&mut self, tensor: TensorId, backend: BackendId, size: usize) {
        if let Some(state) = self.states.get_mut(&backend) {
            let offset = state.alloc.alloc(size);
            state.planned_bytes += state.alloc.reserved(size);
            state.planned_tensors += 1;
            self.slots[tensor.0] = Some(Slot { backend, offset, size });
        }
    }

    /// Hand the slot of a dying `input` over to `output`
    fn share(&mut self, output: TensorId, input: TensorId) {
        let slot = self.slots[input.0];
        if let Some(slot) = slot {
            if let Some(state) = self.states.get_mut(&slot.backend) {
                state.planned_bytes += state.alloc.reserved(slot.size);
                state.planned_tensors += 1;
            }
        }
        self.slots[output.0] = slot;
    }

    fn release(&mut self, tensor: TensorId) {
        if let Some(slot) = self.slots[tensor.0] {
            if let Some(state) = self.states.get_mut(&slot.backend) {
                state.alloc.free(slot.offset, slot.size);
            }
        }
    }
}

pub struct MemoryPlanner<'a> {
    registry: &'a BackendRegistry,
    options: &'a PlanOptions,
}

impl<'a> MemoryPlanner<'a> {
    pub fn new(registry: &'a BackendRegistry, options: &'a PlanOptions) -> Self {
        Self { registry, options }
    }

    pub fn plan(&self, scheduled: &ScheduledGraph) -> Result<MemoryPlan, PlanError> {
        for name in self.options.budgets.keys() {
            if self.registry.by_name(name).is_none() {
                return Err(PlanError::UnknownBackend(name.clone()));
            }
        }

        let graph = scheduled.graph();
        let live = Liveness::analyze(graph);
        let mut arenas = Arenas {
            states: BTreeMap::new(),
            slots: vec![None; graph.num_tensors()],
        };
        for backend in scheduled.backends() {
            let alignment = self
                .registry
                .backend(backend)
                .map_err(|_| PlanError::UnknownBackend(backend.to_string()))?
                .alignment();
            arenas.states.insert(
                backend,
                ArenaState {
                    alloc: FreeListAllocator::new(self.options.strategy, alignment),
                    planned_bytes: 0,
                    planned_tensors: 0,
                },
            );
        }

        // Runtime inputs are written before the first node runs
        for &input in graph.inputs() {
            arenas.allocate(input, scheduled.backend_of(input), graph.tensor(input).packed_size());
        }
        for &input in graph.inputs() {
            if live.last_use(input).is_none() {
                arenas.release(input);
            }
        }

        let mut inplace = 0;
        for (node_id, node) in graph.nodes() {
            let step = node_id.index();
            let output = node.output;
            let mut reused = None;

            if !node.op.is_view() {
                if self.options.allow_inplace && node.op.can_inplace() {
                    reused = node.inputs.iter().copied().find(|&input| {
                        matches!(graph.tensor(input).kind, TensorKind::Computed(_))
                            && !live.is_aliased(input)
                            && !graph.is_output(input)
                            && live.dies_at(input, step)
                            && scheduled.backend_of(input) == scheduled.backend_of(output)
                            && graph.tensor(input).packed_size() == graph.tensor(output).packed_size()
                            && arenas.slots[input.0].is_some()
                    });
                }
                match reused {
                    Some(input) => {
                        arenas.share(output, input);
                        inplace += 1;
                    }
                    None => {
                        arenas.allocate(output, scheduled.backend_of(output), graph.tensor(output).packed_size())
                    }
                }
            }

            // Release roots read for the last time here
            let mut released: Vec<TensorId> = Vec::new();
            for &input in &node.inputs {
                let root = graph.root(input);
                if Some(root) == reused || released.contains(&root) || !live.dies_at(root, step) {
                    continue;
                }
                arenas.release(root);
                released.push(root);
            }
            // Nothing reads this result
            if !node.op.is_view() && live.last_use(output).is_none() {
                arenas.release(output);
            }
        }

        let mut backends = BTreeMap::new();
        for (&backend, state) in &arenas.states {
            let plan = BackendPlan {
                backend: self.registry.name_of(backend).to_string(),
                arena_size: state.alloc.high_water(),
                peak_live_bytes: state.alloc.peak_live(),
                total_planned_bytes: state.planned_bytes,
                planned_tensors: state.planned_tensors,
            };
            if let Some(&budget) = self.options.budgets.get(&plan.backend) {
                if plan.arena_size > budget {
                    return Err(PlanError::OutOfArena {
                        backend: plan.backend,
                        required: plan.arena_size,
                        budget,
                    });
                }
            }
            debug!(
                backend = %plan.backend,
                arena = plan.arena_size,
                peak = plan.peak_live_bytes,
                total = plan.total_planned_bytes,
                "planned arena"
            );
            backends.insert(backend, plan);
        }
        debug!(inplace, "memory plan complete");

        Ok(MemoryPlan {
            slots: arenas.slots,
            backends,
            inplace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuConfig;
    use crate::graph::{Graph, GraphBuilder};
    use crate::sched::{PlacementPolicy, Scheduler};
    use crate::tensor::DType;

    fn relu_chain(len: usize) -> Graph {
        let mut b = GraphBuilder::new();
        let mut t = b.input("x", DType::F32, &[64]).unwrap();
        for _ in 0..len {
            t = b.relu(t).unwrap();
        }
        b.mark_output(t).unwrap();
        b.build().unwrap()
    }

    fn plan(graph: &Graph, options: &PlanOptions) -> Result<MemoryPlan, PlanError> {
        let registry = BackendRegistry::cpu(CpuConfig::default()).unwrap();
        let policy = PlacementPolicy::new();
        let scheduled = Scheduler::new(&registry, &policy).schedule(graph).unwrap();
        MemoryPlanner::new(&registry, options).plan(&scheduled)
    }

    #[test]
    fn test_chain_reuses_memory() {
        let options = PlanOptions {
            allow_inplace: false,
            ..PlanOptions::default()
        };
        let plan = plan(&relu_chain(4), &options).unwrap();
        let cpu = plan.backend(BackendId(0)).unwrap();
        assert_eq!(cpu.arena_size, 512);
        assert_eq!(cpu.peak_live_bytes, 512);
        assert_eq!(cpu.total_planned_bytes, 5 * 256);
        assert_eq!(cpu.planned_tensors, 5);
        assert_eq!(plan.inplace_reuses(), 0);
    }

    #[test]
    fn test_inplace_shares_slots() {
        let graph = relu_chain(4);
        let plan = plan(&graph, &PlanOptions::default()).unwrap();
        assert_eq!(plan.inplace_reuses(), 3);
        assert_eq!(plan.arena_size(BackendId(0)), 512);

        // The runtime input is never overwritten
        let x = graph.inputs()[0];
        let out = graph.outputs()[0];
        assert_ne!(plan.slot(x).unwrap().offset, plan.slot(out).unwrap().offset);
    }

    #[test]
    fn test_views_are_not_planned() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", DType::F32, &[4, 8]).unwrap();
        let y = b.relu(x).unwrap();
        let v = b.transpose(y).unwrap();
        let out = b.cont(v).unwrap();
        b.mark_output(out).unwrap();
        let graph = b.build().unwrap();

        let plan = plan(&graph, &PlanOptions::default()).unwrap();
        assert!(plan.slot(v).is_none());
        assert!(plan.slot(y).is_some());
        assert_eq!(plan.inplace_reuses(), 0);
    }

    #[test]
    fn test_budget_exceeded() {
        let mut options = PlanOptions::default();
        options.budgets.insert("cpu".to_string(), 100);
        assert_eq!(
            plan(&relu_chain(2), &options).unwrap_err(),
            PlanError::OutOfArena {
                backend: "cpu".to_string(),
                required: 512,
                budget: 100,
            }
        );

        let mut options = PlanOptions::default();
        options.budgets.insert("gpu".to_string(), 100);
        assert!(matches!(
            plan(&relu_chain(2), &options),
            Err(PlanError::UnknownBackend(_))
        ));
    }
}
