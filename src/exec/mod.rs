//! Plan execution
//!
//! An [`ExecutablePlan`] is a scheduled, memory-planned graph bound to a
//! registry. Each call to [`ExecutablePlan::execute`] uploads the runtime
//! inputs, walks the nodes in order dispatching each to its backend, runs
//! transfers between backends, waits for every backend and reads the outputs
//! back to the host.

mod arena;

use crate::backend::{Backend, BackendError, BackendRegistry, KernelCall, PassId, TensorRef};
use crate::graph::{Graph, NodeId, OpKind, TensorId, TensorKind};
use crate::plan::{MemoryPlan, MemoryPlanner, PlanOptions};
use crate::sched::{PlacementPolicy, ScheduledGraph, Scheduler, TieBreak};
use crate::tensor::{gather_bytes, HostTensor};
use crate::{Error, Result};
use arena::Arenas;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Cooperative cancellation flag, checked between dispatches
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runtime input values by tensor name
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    tensors: HashMap<String, HostTensor>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, tensor: HostTensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: HostTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.tensors.get(name)
    }
}

/// Output values in the order the outputs were marked
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    tensors: Vec<(String, HostTensor)>,
}

impl Outputs {
    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn by_index(&self, index: usize) -> Option<&HostTensor> {
        self.tensors.get(index).map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostTensor)> {
        self.tensors.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn into_vec(self) -> Vec<(String, HostTensor)> {
        self.tensors
    }
}

/// Per-pass options
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Tensor name to backend name; forces a re-plan for this pass
    pub backend_overrides: HashMap<String, String>,
    pub abort: Option<AbortFlag>,
}

impl ExecOptions {
    pub fn with_abort(abort: AbortFlag) -> Self {
        Self {
            abort: Some(abort),
            ..Self::default()
        }
    }

    pub fn pin(mut self, tensor: impl Into<String>, backend: impl Into<String>) -> Self {
        self.backend_overrides.insert(tensor.into(), backend.into());
        self
    }
}

/// Everything that decides how a graph is planned
#[derive(Debug, Clone, Default)]
pub(crate) struct PlanSettings {
    pub policy: PlacementPolicy,
    pub tie_break: TieBreak,
    pub options: PlanOptions,
}

impl PlanSettings {
    pub(crate) fn schedule(&self, registry: &BackendRegistry, graph: &Graph) -> Result<(ScheduledGraph, MemoryPlan)> {
        let scheduled = Scheduler::new(registry, &self.policy)
            .tie_break(self.tie_break)
            .schedule(graph)?;
        let memory = MemoryPlanner::new(registry, &self.options).plan(&scheduled)?;
        Ok((scheduled, memory))
    }
}

/// A graph ready to run: scheduled, planned and owning its arenas
pub struct ExecutablePlan {
    registry: Arc<BackendRegistry>,
    source: Graph,
    settings: PlanSettings,
    scheduled: ScheduledGraph,
    memory: MemoryPlan,
    arenas: Arenas,
}

impl ExecutablePlan {
    pub(crate) fn new(registry: Arc<BackendRegistry>, graph: &Graph, settings: PlanSettings) -> Result<Self> {
        let (scheduled, memory) = settings.schedule(&registry, graph)?;
        Ok(Self {
            registry,
            source: graph.clone(),
            settings,
            scheduled,
            memory,
            arenas: Arenas::default(),
        })
    }

    pub fn scheduled(&self) -> &ScheduledGraph {
        &self.scheduled
    }

    pub fn memory(&self) -> &MemoryPlan {
        &self.memory
    }

    /// Bytes currently held in arenas
    pub fn arena_bytes(&self) -> usize {
        self.arenas.total_bytes()
    }

    /// Check that every node has a kernel on the backend it was placed on
    pub fn validate(&self) -> Result<()> {
        check_kernels(&self.registry, &self.scheduled)
    }

    /// Run one pass
    pub fn execute(&mut self, inputs: &Inputs, options: &ExecOptions) -> Result<Outputs> {
        if options.backend_overrides.is_empty() {
            return run(
                &self.registry,
                &self.scheduled,
                &self.memory,
                &mut self.arenas,
                inputs,
                options.abort.as_ref(),
            );
        }

        let settings = PlanSettings {
            policy: self.settings.policy.with_overrides(&options.backend_overrides),
            ..self.settings.clone()
        };
        let (scheduled, memory) = settings.schedule(&self.registry, &self.source)?;
        debug!(overrides = options.backend_overrides.len(), "re-planned for overrides");
        run(
            &self.registry,
            &scheduled,
            &memory,
            &mut self.arenas,
            inputs,
            options.abort.as_ref(),
        )
    }
}

impl Drop for ExecutablePlan {
    fn drop(&mut self) {
        self.arenas.release(&self.registry);
    }
}

impl std::fmt::Debug for ExecutablePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutablePlan")
            .field("nodes", &self.scheduled.graph().num_nodes())
            .field("splits", &self.scheduled.splits().len())
            .field("transfers", &self.scheduled.num_transfers())
            .finish()
    }
}

pub(crate) fn check_kernels(registry: &BackendRegistry, scheduled: &ScheduledGraph) -> Result<()> {
    let graph = scheduled.graph();
    for (id, node) in graph.nodes() {
        if !node.op.code().needs_kernel() {
            continue;
        }
        let Some(&first) = node.inputs.first() else {
            continue;
        };
        let backend = scheduled.node_backend(id);
        let dtype = graph.tensor(first).dtype;
        if !registry.supports(backend, node.op.code(), dtype) {
            return Err(Error::Backend(BackendError::UnsupportedOperation {
                backend: registry.name_of(backend).to_string(),
                op: node.op.code(),
                dtype,
            }));
        }
    }
    Ok(())
}

/// Memory of `id` for this pass
fn tensor_ref(graph: &Graph, memory: &MemoryPlan, arenas: &Arenas, id: TensorId) -> Result<TensorRef> {
    let info = graph.tensor(id);
    let root = graph.root(id);
    match &graph.tensor(root).kind {
        // Weight views carry the weight's buffer offset already
        TensorKind::Weight(bound) => Ok(TensorRef {
            buffer: bound.buffer.clone(),
            layout: info.layout.clone(),
            dtype: info.dtype,
        }),
        _ => {
            let slot = memory
                .slot(root)
                .ok_or_else(|| Error::Unplanned(graph.display_name(id)))?;
            let buffer = arenas
                .get(slot.backend)
                .ok_or_else(|| Error::Unplanned(graph.display_name(id)))?;
            Ok(TensorRef {
                buffer: buffer.clone(),
                layout: info.layout.with_offset(slot.offset + info.layout.offset()),
                dtype: info.dtype,
            })
        }
    }
}

/// Attribute a deferred kernel failure to the node that caused it
fn sync_error(graph: &Graph, error: BackendError) -> Error {
    let failed = match &error {
        BackendError::KernelFailed { node, op, .. } => graph.get_node(*node).map(|n| (n.output, *op)),
        _ => None,
    };
    match failed {
        Some((output, op)) => Error::ExecutionFailed {
            node: graph.display_name(output),
            op,
            source: error,
        },
        None => Error::Backend(error),
    }
}

/// Read a tensor view into contiguous host bytes
fn read_packed(backend: &dyn Backend, tensor: &TensorRef) -> std::result::Result<Vec<u8>, BackendError> {
    let span = tensor.layout.byte_span(tensor.dtype);
    let raw = backend.read(&tensor.buffer, tensor.layout.offset(), span)?;
    Ok(gather_bytes(tensor.dtype, &raw, &tensor.layout.with_offset(0))?)
}

fn run(
    registry: &BackendRegistry,
    scheduled: &ScheduledGraph,
    memory: &MemoryPlan,
    arenas: &mut Arenas,
    inputs: &Inputs,
    abort: Option<&AbortFlag>,
) -> Result<Outputs> {
    arenas.ensure(registry, memory)?;
    let graph = scheduled.graph();
    let pass = registry.begin_pass();

    if let Err(e) = run_nodes(registry, scheduled, memory, arenas, inputs, abort, pass) {
        // Leave no work of this pass in flight; its deferred failures are
        // superseded by `e`
        for (backend, discarded) in registry.drain_pass(pass) {
            warn!(
                backend = registry.name_of(backend),
                %pass,
                error = %discarded,
                "discarding deferred failure of a failed pass"
            );
        }
        return Err(e);
    }

    registry.synchronize_pass(pass).map_err(|e| sync_error(graph, e))?;

    let mut outputs = Vec::with_capacity(graph.outputs().len());
    for &id in graph.outputs() {
        let tensor = tensor_ref(graph, memory, arenas, id)?;
        let backend = registry.backend(tensor.buffer.backend())?;
        let data = read_packed(backend.as_ref(), &tensor)?;
        let info = graph.tensor(id);
        outputs.push((graph.display_name(id), HostTensor::new(data, info.shape().to_vec(), info.dtype)?));
    }
    Ok(Outputs { tensors: outputs })
}

fn run_nodes(
    registry: &BackendRegistry,
    scheduled: &ScheduledGraph,
    memory: &MemoryPlan,
    arenas: &Arenas,
    inputs: &Inputs,
    abort: Option<&AbortFlag>,
    pass: PassId,
) -> Result<()> {
    let graph = scheduled.graph();

    for &id in graph.inputs() {
        let name = graph.display_name(id);
        let host = inputs.get(&name).ok_or_else(|| Error::MissingInput(name.clone()))?;
        let info = graph.tensor(id);
        if host.dtype() != info.dtype || host.shape() != info.shape() {
            return Err(Error::InputMismatch {
                name,
                expected: info.shape().to_vec(),
                expected_dtype: info.dtype,
                got: host.shape().to_vec(),
                got_dtype: host.dtype(),
            });
        }
        let tensor = tensor_ref(graph, memory, arenas, id)?;
        registry
            .backend(scheduled.backend_of(id))?
            .write(&tensor.buffer, tensor.layout.offset(), host.data())?;
    }

    for (node_id, node) in graph.nodes() {
        if abort.is_some_and(AbortFlag::is_aborted) {
            debug!(%pass, node = %node_id, "pass aborted");
            return Err(Error::Cancelled);
        }
        if node.op.is_view() {
            continue;
        }

        let backend = registry.backend(scheduled.node_backend(node_id))?;
        if node.op == OpKind::Transfer {
            transfer(registry, scheduled, memory, arenas, node_id, pass)?;
            continue;
        }

        let call = KernelCall {
            pass,
            node: node_id,
            op: node.op.clone(),
            inputs: node
                .inputs
                .iter()
                .map(|&t| tensor_ref(graph, memory, arenas, t))
                .collect::<Result<_>>()?,
            output: tensor_ref(graph, memory, arenas, node.output)?,
        };
        let (op, dtype) = call.key();
        if !backend.supports(op, dtype) {
            return Err(Error::Backend(BackendError::UnsupportedOperation {
                backend: backend.name().to_string(),
                op,
                dtype,
            }));
        }

        trace!(node = %node_id, op = %node.op, backend = backend.name(), "dispatch");
        backend.dispatch(&call).map_err(|source| Error::ExecutionFailed {
            node: graph.display_name(node.output),
            op,
            source,
        })?;
    }
    Ok(())
}

fn transfer(
    registry: &BackendRegistry,
    scheduled: &ScheduledGraph,
    memory: &MemoryPlan,
    arenas: &Arenas,
    node_id: NodeId,
    pass: PassId,
) -> Result<()> {
    let graph = scheduled.graph();
    let node = graph.node(node_id);
    let input = node.inputs[0];
    let source = tensor_ref(graph, memory, arenas, input)?;
    let target = tensor_ref(graph, memory, arenas, node.output)?;
    let from = registry.backend(source.buffer.backend())?;
    let to = registry.backend(target.buffer.backend())?;

    // Work queued on the source may still be producing the tensor
    from.synchronize_pass(pass).map_err(|e| sync_error(graph, e))?;

    let failure = |source: BackendError| Error::TransferFailure {
        tensor: graph.display_name(input),
        from: from.name().to_string(),
        to: to.name().to_string(),
        source,
    };
    let data = read_packed(from.as_ref(), &source).map_err(failure)?;
    to.write(&target.buffer, target.layout.offset(), &data).map_err(failure)?;
    trace!(tensor = %graph.display_name(input), from = from.name(), to = to.name(), bytes = data.len(), "transfer");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, NodeId, OpCode};
    use crate::tensor::DType;

    fn one_node() -> Graph {
        let mut b = GraphBuilder::new();
        let x = b.input("x", DType::F32, &[4]).unwrap();
        let y = b.relu(x).unwrap();
        b.set_name(y, "y").unwrap();
        b.mark_output(y).unwrap();
        b.build().unwrap()
    }

    fn kernel_failed(node: usize) -> BackendError {
        BackendError::KernelFailed {
            node: NodeId(node),
            op: OpCode::Relu,
            message: "bad".into(),
        }
    }

    #[test]
    fn test_sync_error_names_the_node() {
        let err = sync_error(&one_node(), kernel_failed(0));
        assert!(matches!(err, Error::ExecutionFailed { node, op: OpCode::Relu, .. } if node == "y"));
    }

    #[test]
    fn test_sync_error_for_unknown_node() {
        // A node id that does not belong to this graph is reported as is
        let err = sync_error(&one_node(), kernel_failed(22));
        assert!(matches!(err, Error::Backend(BackendError::KernelFailed { .. })));
    }
}
