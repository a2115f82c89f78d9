//! Output shape and type inference
//!
//! Every op's output is a pure function of its inputs' dtypes and layouts.

use super::{GraphError, OpCode, OpKind};
use crate::tensor::{broadcast_shapes, DType, Layout, TensorError, MAX_DIMS};

/// Input description seen by the inference rules
pub(crate) struct Operand<'a> {
    pub dtype: DType,
    pub layout: &'a Layout,
}

/// Inferred output
pub(crate) struct Inferred {
    pub dtype: DType,
    pub layout: Layout,
    /// The output aliases the (single) input's memory
    pub is_view: bool,
}

impl Inferred {
    fn computed(dtype: DType, shape: &[usize]) -> Result<Self, GraphError> {
        Ok(Self {
            dtype,
            layout: Layout::contiguous(shape)?,
            is_view: false,
        })
    }

    fn view(dtype: DType, layout: Layout) -> Self {
        Self {
            dtype,
            layout,
            is_view: true,
        }
    }
}

fn unsupported(op: OpCode, dtype: DType) -> GraphError {
    GraphError::UnsupportedType { op, dtype }
}

fn mismatch(op: OpCode, lhs: &[usize], rhs: &[usize]) -> GraphError {
    GraphError::ShapeMismatch {
        op,
        lhs: lhs.to_vec(),
        rhs: rhs.to_vec(),
    }
}

/// Arithmetic accepts floats and quantized data, never integers
fn check_numeric(op: OpCode, dtype: DType) -> Result<(), GraphError> {
    if dtype.is_integer() {
        return Err(unsupported(op, dtype));
    }
    Ok(())
}

/// Float inputs keep their dtype, quantized inputs produce F32
fn float_result(dtype: DType) -> DType {
    if dtype.is_float() {
        dtype
    } else {
        DType::F32
    }
}

pub(crate) fn infer(op: &OpKind, inputs: &[Operand<'_>]) -> Result<Inferred, GraphError> {
    let code = op.code();
    if inputs.len() != op.arity() {
        return Err(GraphError::InvalidArgument(format!(
            "{} takes {} input(s), got {}",
            code,
            op.arity(),
            inputs.len()
        )));
    }
    let a = &inputs[0];

    match op {
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
            let b = &inputs[1];
            check_numeric(code, a.dtype)?;
            check_numeric(code, b.dtype)?;
            if a.dtype.is_quantized() && b.dtype.is_quantized() && a.dtype.block_size() != b.dtype.block_size() {
                return Err(unsupported(code, b.dtype));
            }
            let shape = broadcast_shapes(a.layout.shape(), b.layout.shape())
                .ok_or_else(|| mismatch(code, a.layout.shape(), b.layout.shape()))?;
            let dtype = if a.dtype == b.dtype {
                float_result(a.dtype)
            } else {
                DType::F32
            };
            Inferred::computed(dtype, &shape)
        }

        OpKind::Scale(_) | OpKind::Silu | OpKind::Gelu | OpKind::Relu | OpKind::Softmax | OpKind::RmsNorm { .. } => {
            check_numeric(code, a.dtype)?;
            Inferred::computed(float_result(a.dtype), a.layout.shape())
        }

        OpKind::MatMul => infer_matmul(a, &inputs[1]),

        OpKind::GetRows => {
            let ids = &inputs[1];
            check_numeric(code, a.dtype)?;
            if ids.dtype != DType::I32 {
                return Err(unsupported(code, ids.dtype));
            }
            if a.layout.ndim() != 2 || ids.layout.ndim() != 1 {
                return Err(mismatch(code, a.layout.shape(), ids.layout.shape()));
            }
            Inferred::computed(DType::F32, &[ids.layout.shape()[0], a.layout.shape()[1]])
        }

        OpKind::Dequantize => {
            if !a.dtype.is_quantized() {
                return Err(unsupported(code, a.dtype));
            }
            Inferred::computed(DType::F32, a.layout.shape())
        }

        OpKind::Quantize(target) => {
            if !a.dtype.is_float() {
                return Err(unsupported(code, a.dtype));
            }
            if !target.is_quantized() {
                return Err(unsupported(code, *target));
            }
            let numel = a.layout.numel();
            if numel % target.block_size() != 0 {
                return Err(mismatch(code, a.layout.shape(), &[target.block_size()]));
            }
            Inferred::computed(*target, a.layout.shape())
        }

        OpKind::Cast(target) => {
            if !a.dtype.is_float() {
                return Err(unsupported(code, a.dtype));
            }
            if !target.is_float() {
                return Err(unsupported(code, *target));
            }
            Inferred::computed(*target, a.layout.shape())
        }

        OpKind::Cont => Inferred::computed(a.dtype, a.layout.shape()),

        OpKind::Reshape(shape) => {
            if shape.is_empty() || shape.len() > MAX_DIMS {
                return Err(GraphError::InvalidArgument(format!(
                    "reshape to rank {} is outside 1..={}",
                    shape.len(),
                    MAX_DIMS
                )));
            }
            match a.layout.reshape(shape) {
                Ok(layout) => Ok(Inferred::view(a.dtype, layout)),
                Err(TensorError::NotContiguous) => Err(GraphError::InvalidArgument(
                    "reshape needs a contiguous input, insert cont first".into(),
                )),
                Err(_) => Err(mismatch(code, a.layout.shape(), shape)),
            }
        }

        OpKind::Permute(axes) => {
            if a.dtype.is_quantized() {
                return Err(unsupported(code, a.dtype));
            }
            let layout = a
                .layout
                .permute(axes)
                .map_err(|_| GraphError::InvalidArgument(format!("invalid permutation {:?}", axes)))?;
            Ok(Inferred::view(a.dtype, layout))
        }

        OpKind::Slice { dim, start, len } => {
            let out_of_range = *dim >= a.layout.ndim()
                || start
                    .checked_add(*len)
                    .map_or(true, |end| end > a.layout.shape()[*dim]);
            if out_of_range || *len == 0 {
                return Err(mismatch(code, a.layout.shape(), &[*dim, *start, *len]));
            }
            if a.dtype.is_quantized() && *dim != 0 {
                return Err(unsupported(code, a.dtype));
            }
            match a.layout.slice(a.dtype, *dim, *start, *len) {
                Ok(layout) => Ok(Inferred::view(a.dtype, layout)),
                Err(TensorError::InvalidDType(dtype)) => Err(unsupported(code, dtype)),
                Err(_) => Err(mismatch(code, a.layout.shape(), &[*dim, *start, *len])),
            }
        }

        OpKind::Transfer => Err(GraphError::InvalidArgument(
            "transfer nodes are inserted by the scheduler".into(),
        )),
    }
}

/// `[..., M, K] x [..., K, N] -> [..., M, N]`, batch dims broadcast
fn infer_matmul(a: &Operand<'_>, b: &Operand<'_>) -> Result<Inferred, GraphError> {
    let code = OpCode::MatMul;
    check_numeric(code, a.dtype)?;
    if !b.dtype.is_float() {
        return Err(unsupported(code, b.dtype));
    }

    let (sa, sb) = (a.layout.shape(), b.layout.shape());
    if sa.len() < 2 || sb.len() < 2 {
        return Err(mismatch(code, sa, sb));
    }
    let (m, k) = (sa[sa.len() - 2], sa[sa.len() - 1]);
    let (k2, n) = (sb[sb.len() - 2], sb[sb.len() - 1]);
    if k != k2 {
        return Err(mismatch(code, sa, sb));
    }

    let batch = broadcast_shapes(&sa[..sa.len() - 2], &sb[..sb.len() - 2]).ok_or_else(|| mismatch(code, sa, sb))?;
    let mut shape = batch;
    shape.extend([m, n]);
    Inferred::computed(DType::F32, &shape)
}
