//! Incremental graph construction

use super::shape::{infer, Operand};
use super::{Graph, GraphError, Node, NodeId, OpKind, TensorId, TensorInfo, TensorKind};
use crate::backend::BoundTensor;
use crate::tensor::{DType, Layout};

/// Builds a [`Graph`] one operation at a time.
///
/// Construction is purely descriptive. The first failed call poisons the
/// builder: every later call fails with [`GraphError::Poisoned`] and no graph
/// can be produced from it.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    tensors: Vec<TensorInfo>,
    nodes: Vec<Node>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    poisoned: bool,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, GraphError>) -> Result<T, GraphError> {
        if self.poisoned {
            return Err(GraphError::Poisoned);
        }
        let result = f(self);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn check(&self, id: TensorId) -> Result<&TensorInfo, GraphError> {
        self.tensors.get(id.0).ok_or(GraphError::UnknownTensor(id))
    }

    fn push_tensor(&mut self, info: TensorInfo) -> TensorId {
        self.tensors.push(info);
        TensorId(self.tensors.len() - 1)
    }

    /// Add a weight already resident in a backend buffer
    pub fn weight(&mut self, name: &str, bound: &BoundTensor) -> Result<TensorId, GraphError> {
        self.guarded(|b| {
            bound.layout.check_span(bound.dtype, bound.buffer.size())?;
            Ok(b.push_tensor(TensorInfo {
                name: Some(name.to_string()),
                dtype: bound.dtype,
                layout: bound.layout.clone(),
                kind: TensorKind::Weight(bound.clone()),
            }))
        })
    }

    /// Add a runtime input filled on every execution
    pub fn input(&mut self, name: &str, dtype: DType, shape: &[usize]) -> Result<TensorId, GraphError> {
        self.guarded(|b| {
            let layout = Layout::contiguous(shape)?;
            if dtype.is_quantized() && layout.numel() % dtype.block_size() != 0 {
                return Err(GraphError::InvalidArgument(format!(
                    "input '{}' has {} elements, not a multiple of the {} block size",
                    name,
                    layout.numel(),
                    dtype
                )));
            }
            let id = b.push_tensor(TensorInfo {
                name: Some(name.to_string()),
                dtype,
                layout,
                kind: TensorKind::Input,
            });
            b.inputs.push(id);
            Ok(id)
        })
    }

    /// Append an operation and return its output tensor
    pub fn add_operation(&mut self, op: OpKind, inputs: &[TensorId]) -> Result<TensorId, GraphError> {
        self.guarded(|b| {
            let mut operands = Vec::with_capacity(inputs.len());
            for &id in inputs {
                let info = b.check(id)?;
                operands.push(Operand {
                    dtype: info.dtype,
                    layout: &info.layout,
                });
            }
            let inferred = infer(&op, &operands)?;

            let node = NodeId(b.nodes.len());
            let kind = if inferred.is_view {
                let source = inputs[0];
                let root = match b.tensors[source.0].kind {
                    TensorKind::View { root, .. } => root,
                    _ => source,
                };
                TensorKind::View { node, root }
            } else {
                TensorKind::Computed(node)
            };

            let output = b.push_tensor(TensorInfo {
                name: None,
                dtype: inferred.dtype,
                layout: inferred.layout,
                kind,
            });
            b.nodes.push(Node {
                op,
                inputs: inputs.to_vec(),
                output,
            });
            Ok(output)
        })
    }

    pub fn set_name(&mut self, tensor: TensorId, name: &str) -> Result<(), GraphError> {
        self.guarded(|b| {
            b.check(tensor)?;
            b.tensors[tensor.0].name = Some(name.to_string());
            Ok(())
        })
    }

    pub fn mark_output(&mut self, tensor: TensorId) -> Result<(), GraphError> {
        self.guarded(|b| {
            b.check(tensor)?;
            if !b.outputs.contains(&tensor) {
                b.outputs.push(tensor);
            }
            Ok(())
        })
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        if self.poisoned {
            return Err(GraphError::Poisoned);
        }
        if self.outputs.is_empty() {
            return Err(GraphError::NoOutputs);
        }
        Ok(Graph::from_parts(self.tensors, self.nodes, self.inputs, self.outputs))
    }

    // =========================================================================
    // Convenience wrappers
    // =========================================================================

    pub fn add(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Add, &[a, b])
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Sub, &[a, b])
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Mul, &[a, b])
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Div, &[a, b])
    }

    pub fn scale(&mut self, x: TensorId, factor: f32) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Scale(factor), &[x])
    }

    pub fn silu(&mut self, x: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Silu, &[x])
    }

    pub fn gelu(&mut self, x: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Gelu, &[x])
    }

    pub fn relu(&mut self, x: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Relu, &[x])
    }

    pub fn softmax(&mut self, x: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Softmax, &[x])
    }

    pub fn rms_norm(&mut self, x: TensorId, eps: f32) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::RmsNorm { eps }, &[x])
    }

    /// `[..., M, K] x [..., K, N] -> [..., M, N]`
    pub fn matmul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::MatMul, &[a, b])
    }

    /// Gather rows of a `[V, D]` table by I32 ids
    pub fn get_rows(&mut self, table: TensorId, ids: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::GetRows, &[table, ids])
    }

    pub fn dequantize(&mut self, x: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Dequantize, &[x])
    }

    pub fn quantize(&mut self, x: TensorId, dtype: DType) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Quantize(dtype), &[x])
    }

    pub fn cast(&mut self, x: TensorId, dtype: DType) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Cast(dtype), &[x])
    }

    pub fn cont(&mut self, x: TensorId) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Cont, &[x])
    }

    pub fn reshape(&mut self, x: TensorId, shape: &[usize]) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Reshape(shape.to_vec()), &[x])
    }

    pub fn permute(&mut self, x: TensorId, axes: &[usize]) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Permute(axes.to_vec()), &[x])
    }

    /// Swap the last two dimensions
    pub fn transpose(&mut self, x: TensorId) -> Result<TensorId, GraphError> {
        let rank = self.tensors.get(x.0).map(|t| t.layout.ndim()).unwrap_or(0);
        if rank < 2 {
            return self.guarded(|_| {
                Err(GraphError::InvalidArgument(format!("transpose needs rank >= 2, got {}", rank)))
            });
        }
        let mut axes: Vec<usize> = (0..rank).collect();
        axes.swap(rank - 2, rank - 1);
        self.permute(x, &axes)
    }

    pub fn slice(&mut self, x: TensorId, dim: usize, start: usize, len: usize) -> Result<TensorId, GraphError> {
        self.add_operation(OpKind::Slice { dim, start, len }, &[x])
    }
}
