//! Reference kernels
//!
//! Every kernel decodes its inputs to f32, computes, and encodes the result in
//! the output dtype. Inputs are fully read before the output is written, so
//! an output may share memory with a dying input. Quantized operands are
//! decoded row by row; no full-precision copy of a quantized weight is made.
//! Parallel sections run on whatever rayon pool the caller installed.

use crate::backend::{BackendError, BackendResult, KernelCall, KernelTable, TensorRef};
use crate::graph::{OpCode, OpKind};
use crate::tensor::{
    broadcast_shapes, decode_f32, decode_i32, decode_range, encode_f32, gather_bytes, DType,
};
use rayon::prelude::*;

use super::simd;

// Threshold for using parallel execution (avoid rayon overhead for small arrays)
const PARALLEL_THRESHOLD: usize = 8192;

const FLOATS: [DType; 3] = [DType::F32, DType::F16, DType::BF16];
const QUANTS: [DType; 5] = [DType::Q4_0, DType::Q4_1, DType::Q5_0, DType::Q5_1, DType::Q8_0];

/// Table holding every reference kernel
pub fn reference_kernels() -> KernelTable {
    let numeric: Vec<DType> = FLOATS.iter().chain(QUANTS.iter()).copied().collect();
    let mut table = KernelTable::new();

    table.register_all(OpCode::Add, &numeric, binary);
    table.register_all(OpCode::Sub, &numeric, binary);
    table.register_all(OpCode::Mul, &numeric, binary);
    table.register_all(OpCode::Div, &numeric, binary);
    table.register_all(OpCode::Scale, &numeric, unary);
    table.register_all(OpCode::Silu, &numeric, unary);
    table.register_all(OpCode::Gelu, &numeric, unary);
    table.register_all(OpCode::Relu, &numeric, unary);
    table.register_all(OpCode::Softmax, &numeric, softmax);
    table.register_all(OpCode::RmsNorm, &numeric, rms_norm);
    table.register_all(OpCode::MatMul, &numeric, matmul);
    table.register_all(OpCode::GetRows, &numeric, get_rows);
    table.register_all(OpCode::Dequantize, &QUANTS, convert);
    table.register_all(OpCode::Quantize, &FLOATS, convert);
    table.register_all(OpCode::Cast, &FLOATS, convert);
    table.register_all(OpCode::Cont, &DType::ALL, cont);
    table
}

// =============================================================================
// Helper Functions
// =============================================================================

fn load(t: &TensorRef) -> BackendResult<Vec<f32>> {
    let memory = t.buffer.bytes()?;
    Ok(decode_f32(t.dtype, &memory, &t.layout)?)
}

fn store_bytes(out: &TensorRef, bytes: &[u8]) -> BackendResult<()> {
    if !out.layout.is_contiguous() {
        return Err(BackendError::InvalidArgument("kernel output must be contiguous".into()));
    }
    out.buffer.write_range(out.layout.offset(), bytes)
}

fn store(out: &TensorRef, values: &[f32]) -> BackendResult<()> {
    let mut bytes = vec![0u8; out.layout.packed_size(out.dtype)];
    encode_f32(out.dtype, values, &mut bytes)?;
    store_bytes(out, &bytes)
}

fn input(call: &KernelCall, i: usize) -> BackendResult<&TensorRef> {
    call.inputs.get(i).ok_or_else(|| {
        BackendError::InvalidArgument(format!("{} is missing input {}", call.op, i))
    })
}

fn check_shape(expected: &[usize], got: &[usize]) -> BackendResult<()> {
    if expected != got {
        return Err(BackendError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        });
    }
    Ok(())
}

/// Map a row-major index of `out_shape` onto a broadcast operand of `in_shape`
fn broadcast_index(mut linear: usize, out_shape: &[usize], in_shape: &[usize]) -> usize {
    let skip = out_shape.len() - in_shape.len();
    let mut index = 0;
    let mut stride = 1;
    for d in (0..out_shape.len()).rev() {
        let coord = linear % out_shape[d];
        linear /= out_shape[d];
        if d >= skip {
            let extent = in_shape[d - skip];
            if extent != 1 {
                index += coord * stride;
            }
            stride *= extent;
        }
    }
    index
}

fn map_values(values: &mut [f32], f: impl Fn(f32) -> f32 + Sync + Send) {
    if values.len() >= PARALLEL_THRESHOLD {
        values.par_iter_mut().for_each(|v| *v = f(*v));
    } else {
        for v in values.iter_mut() {
            *v = f(*v);
        }
    }
}

// =============================================================================
// Element-wise Operations
// =============================================================================

/// Broadcasting `Add`, `Sub`, `Mul`, `Div`
fn binary(call: &KernelCall) -> BackendResult<()> {
    let (a, b) = (input(call, 0)?, input(call, 1)?);
    let a_values = load(a)?;
    let b_values = load(b)?;

    let f: fn(f32, f32) -> f32 = match call.op {
        OpKind::Add => |x, y| x + y,
        OpKind::Sub => |x, y| x - y,
        OpKind::Mul => |x, y| x * y,
        OpKind::Div => |x, y| x / y,
        _ => return Err(BackendError::InvalidArgument(format!("{} is not a binary op", call.op))),
    };

    let out_shape = call.output.layout.shape();
    let (a_shape, b_shape) = (a.layout.shape(), b.layout.shape());
    match broadcast_shapes(a_shape, b_shape) {
        Some(shape) => check_shape(&shape, out_shape)?,
        None => check_shape(a_shape, b_shape)?,
    }
    let mut out = vec![0.0f32; call.output.layout.numel()];

    if a_shape == out_shape && b_shape == out_shape {
        for ((o, &x), &y) in out.iter_mut().zip(&a_values).zip(&b_values) {
            *o = f(x, y);
        }
    } else {
        let value_at = |i: usize| {
            let x = a_values[broadcast_index(i, out_shape, a_shape)];
            let y = b_values[broadcast_index(i, out_shape, b_shape)];
            f(x, y)
        };
        if out.len() >= PARALLEL_THRESHOLD {
            out.par_iter_mut().enumerate().for_each(|(i, o)| *o = value_at(i));
        } else {
            for (i, o) in out.iter_mut().enumerate() {
                *o = value_at(i);
            }
        }
    }

    store(&call.output, &out)
}

/// `Scale`, `Silu`, `Gelu`, `Relu`
fn unary(call: &KernelCall) -> BackendResult<()> {
    let x = input(call, 0)?;
    check_shape(x.layout.shape(), call.output.layout.shape())?;
    let mut values = load(x)?;

    // GELU(x) = 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;

    match call.op {
        OpKind::Scale(s) => map_values(&mut values, move |v| v * s),
        OpKind::Silu => map_values(&mut values, |v| v / (1.0 + (-v).exp())),
        OpKind::Gelu => map_values(&mut values, |v| {
            let inner = SQRT_2_OVER_PI * (v + 0.044715 * v * v * v);
            0.5 * v * (1.0 + inner.tanh())
        }),
        OpKind::Relu => map_values(&mut values, |v| v.max(0.0)),
        _ => return Err(BackendError::InvalidArgument(format!("{} is not a unary op", call.op))),
    }

    store(&call.output, &values)
}

// =============================================================================
// Row-wise Operations
// =============================================================================

fn for_each_row(values: &mut [f32], row_len: usize, f: impl Fn(&mut [f32]) + Sync + Send) {
    if row_len == 0 {
        return;
    }
    if values.len() >= PARALLEL_THRESHOLD {
        values.par_chunks_mut(row_len).for_each(f);
    } else {
        values.chunks_mut(row_len).for_each(f);
    }
}

/// Softmax along the last dimension
fn softmax(call: &KernelCall) -> BackendResult<()> {
    let x = input(call, 0)?;
    check_shape(x.layout.shape(), call.output.layout.shape())?;
    let mut values = load(x)?;
    let last_dim = *x.layout.shape().last().unwrap_or(&1);

    for_each_row(&mut values, last_dim, |row| {
        let max = simd::max_f32(row);
        let mut sum = 0.0f32;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        let inv_sum = 1.0 / sum;
        for v in row.iter_mut() {
            *v *= inv_sum;
        }
    });

    store(&call.output, &values)
}

/// RMS normalization along the last dimension: `x / sqrt(mean(x^2) + eps)`
fn rms_norm(call: &KernelCall) -> BackendResult<()> {
    let OpKind::RmsNorm { eps } = call.op else {
        return Err(BackendError::InvalidArgument(format!("{} is not rms_norm", call.op)));
    };
    let x = input(call, 0)?;
    check_shape(x.layout.shape(), call.output.layout.shape())?;
    let mut values = load(x)?;
    let hidden = *x.layout.shape().last().unwrap_or(&1);

    for_each_row(&mut values, hidden, |row| {
        let mean = simd::sum_of_squares(row) / row.len() as f32;
        let inv_rms = 1.0 / (mean + eps).sqrt();
        for v in row.iter_mut() {
            *v *= inv_rms;
        }
    });

    store(&call.output, &values)
}

// =============================================================================
// Matrix Operations
// =============================================================================

/// Batched matrix multiplication: `[..., M, K] x [..., K, N] -> [..., M, N]`.
///
/// `b` is transposed once so every output element is a contiguous dot
/// product. Rows of `a` are decoded one at a time, which keeps quantized
/// weights packed.
fn matmul(call: &KernelCall) -> BackendResult<()> {
    let (a, b) = (input(call, 0)?, input(call, 1)?);
    let (sa, sb) = (a.layout.shape(), b.layout.shape());
    if sa.len() < 2 || sb.len() < 2 {
        return Err(BackendError::InvalidArgument("matmul requires rank >= 2".into()));
    }
    let (m, k) = (sa[sa.len() - 2], sa[sa.len() - 1]);
    let (k2, n) = (sb[sb.len() - 2], sb[sb.len() - 1]);
    if k != k2 {
        return Err(BackendError::ShapeMismatch {
            expected: sa.to_vec(),
            got: sb.to_vec(),
        });
    }

    let out_shape = call.output.layout.shape();
    let out_batch = &out_shape[..out_shape.len() - 2];
    let a_batch = &sa[..sa.len() - 2];
    let b_batch = &sb[..sb.len() - 2];
    let batches: usize = out_batch.iter().product();

    // b^T per batch: [batch_b][n][k]
    let b_values = load(b)?;
    let b_batches: usize = b_batch.iter().product();
    let mut b_t = vec![0.0f32; b_values.len()];
    for bb in 0..b_batches {
        let base = bb * k * n;
        for kk in 0..k {
            for j in 0..n {
                b_t[base + j * k + kk] = b_values[base + kk * n + j];
            }
        }
    }

    let mut out = vec![0.0f32; batches * m * n];
    {
        let a_memory = a.buffer.bytes()?;
        let a_raw: &[u8] = &a_memory;
        a.layout.check_span(a.dtype, a_raw.len())?;

        let row_results: Vec<BackendResult<()>> = out
            .par_chunks_mut(n.max(1))
            .enumerate()
            .map(|(row, out_row)| {
                let batch = row / m.max(1);
                let i = row % m.max(1);
                let a_b = broadcast_index(batch, out_batch, a_batch);
                let b_b = broadcast_index(batch, out_batch, b_batch);

                let mut a_row = vec![0.0f32; k];
                decode_range(a.dtype, a_raw, &a.layout, (a_b * m + i) * k, &mut a_row)?;
                let b_base = b_b * k * n;
                for (j, o) in out_row.iter_mut().enumerate() {
                    let col = &b_t[b_base + j * k..b_base + (j + 1) * k];
                    *o = simd::dot_f32(&a_row, col);
                }
                Ok(())
            })
            .collect();
        row_results.into_iter().collect::<BackendResult<()>>()?;
    }

    store(&call.output, &out)
}

/// Gather rows of a `[V, D]` table: `out[r] = table[ids[r]]`
fn get_rows(call: &KernelCall) -> BackendResult<()> {
    let (table, ids) = (input(call, 0)?, input(call, 1)?);
    if table.layout.ndim() != 2 {
        return Err(BackendError::InvalidArgument("get_rows needs a 2D table".into()));
    }
    let (rows, dim) = (table.layout.shape()[0], table.layout.shape()[1]);
    let ids = {
        let memory = ids.buffer.bytes()?;
        decode_i32(&memory, &ids.layout)?
    };

    let mut out = vec![0.0f32; ids.len() * dim];
    {
        let memory = table.buffer.bytes()?;
        for (&id, out_row) in ids.iter().zip(out.chunks_mut(dim.max(1))) {
            if id < 0 || id as usize >= rows {
                return Err(BackendError::InvalidArgument(format!(
                    "row id {} out of range for table with {} rows",
                    id, rows
                )));
            }
            decode_range(table.dtype, &memory, &table.layout, id as usize * dim, out_row)?;
        }
    }

    store(&call.output, &out)
}

// =============================================================================
// Type conversion
// =============================================================================

/// `Dequantize`, `Quantize` and `Cast`: decode, then encode in the output dtype
fn convert(call: &KernelCall) -> BackendResult<()> {
    let x = input(call, 0)?;
    check_shape(x.layout.shape(), call.output.layout.shape())?;
    let values = load(x)?;
    store(&call.output, &values)
}

/// Materialize a contiguous copy without changing the dtype
fn cont(call: &KernelCall) -> BackendResult<()> {
    let x = input(call, 0)?;
    if x.dtype != call.output.dtype {
        return Err(BackendError::DTypeMismatch {
            expected: x.dtype,
            got: call.output.dtype,
        });
    }
    let bytes = {
        let memory = x.buffer.bytes()?;
        gather_bytes(x.dtype, &memory, &x.layout)?
    };
    store_bytes(&call.output, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendId, Buffer, PassId};
    use crate::graph::NodeId;
    use crate::tensor::{HostTensor, Layout};

    fn tensor(values: &[f32], shape: &[usize]) -> TensorRef {
        let host = HostTensor::from_f32(values, shape.to_vec()).unwrap();
        host_ref(&host)
    }

    fn host_ref(host: &HostTensor) -> TensorRef {
        let buffer = Buffer::new(BackendId(0), host.data().len());
        buffer.write_range(0, host.data()).unwrap();
        TensorRef {
            buffer,
            layout: host.layout().clone(),
            dtype: host.dtype(),
        }
    }

    fn output(dtype: DType, shape: &[usize]) -> TensorRef {
        let layout = Layout::contiguous(shape).unwrap();
        TensorRef {
            buffer: Buffer::new(BackendId(0), layout.packed_size(dtype)),
            layout,
            dtype,
        }
    }

    fn run(op: OpKind, inputs: Vec<TensorRef>, out: TensorRef) -> Vec<f32> {
        let call = KernelCall {
            pass: PassId::default(),
            node: NodeId(0),
            op,
            inputs,
            output: out.clone(),
        };
        let (code, dtype) = call.key();
        let kernel = reference_kernels().get(code, dtype).unwrap();
        kernel(&call).unwrap();
        load(&out).unwrap()
    }

    #[test]
    fn test_add_broadcast() {
        let a = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = tensor(&[10.0, 20.0, 30.0], &[3]);
        let out = run(OpKind::Add, vec![a, b], output(DType::F32, &[2, 3]));
        assert_eq!(out, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_div_column_broadcast() {
        let a = tensor(&[2.0, 4.0, 9.0, 12.0], &[2, 2]);
        let b = tensor(&[2.0, 3.0], &[2, 1]);
        let out = run(OpKind::Div, vec![a, b], output(DType::F32, &[2, 2]));
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_silu_and_relu() {
        let x = tensor(&[-1.0, 0.0, 2.0], &[3]);
        let out = run(OpKind::Relu, vec![x.clone()], output(DType::F32, &[3]));
        assert_eq!(out, vec![0.0, 0.0, 2.0]);

        let out = run(OpKind::Silu, vec![x], output(DType::F32, &[3]));
        assert!((out[2] - 2.0 / (1.0 + (-2.0f32).exp())).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = tensor(&[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], &[2, 3]);
        let out = run(OpKind::Softmax, vec![x], output(DType::F32, &[2, 3]));
        let first: f32 = out[..3].iter().sum();
        assert!((first - 1.0).abs() < 1e-6);
        assert!((out[3] - 1.0 / 3.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);
    }

    #[test]
    fn test_rms_norm() {
        let x = tensor(&[3.0, 4.0], &[1, 2]);
        let out = run(OpKind::RmsNorm { eps: 0.0 }, vec![x], output(DType::F32, &[1, 2]));
        let rms = (12.5f32).sqrt();
        assert!((out[0] - 3.0 / rms).abs() < 1e-6);
        assert!((out[1] - 4.0 / rms).abs() < 1e-6);
    }

    #[test]
    fn test_matmul_2x3_3x2() {
        let a = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = tensor(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2]);
        let out = run(OpKind::MatMul, vec![a, b], output(DType::F32, &[2, 2]));
        assert_eq!(out, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_quantized_rows_inside_one_block() {
        let weights: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0) / 4.0).collect();
        let host = HostTensor::from_f32(&weights, vec![4, 8]).unwrap();
        let q = host.quantize(DType::Q8_0).unwrap();
        let dequantized = q.to_f32_vec().unwrap();

        let x = tensor(&[1.0; 8], &[8, 1]);
        let out = run(OpKind::MatMul, vec![host_ref(&q), x], output(DType::F32, &[4, 1]));
        for (row, &o) in out.iter().enumerate() {
            let expected: f32 = dequantized[row * 8..(row + 1) * 8].iter().sum();
            assert!((o - expected).abs() < 1e-4, "row {}: {} vs {}", row, o, expected);
        }
    }

    #[test]
    fn test_get_rows_bounds() {
        let table = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
        let ids = host_ref(&HostTensor::from_i32(&[2, 0], vec![2]).unwrap());
        let out = run(OpKind::GetRows, vec![table.clone(), ids], output(DType::F32, &[2, 2]));
        assert_eq!(out, vec![5.0, 6.0, 1.0, 2.0]);

        let bad = host_ref(&HostTensor::from_i32(&[3], vec![1]).unwrap());
        let call = KernelCall {
            pass: PassId::default(),
            node: NodeId(0),
            op: OpKind::GetRows,
            inputs: vec![table, bad],
            output: output(DType::F32, &[1, 2]),
        };
        assert!(get_rows(&call).is_err());
    }

    #[test]
    fn test_cont_of_transpose() {
        let x = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let t = TensorRef {
            layout: x.layout.permute(&[1, 0]).unwrap(),
            ..x
        };
        let out = run(OpKind::Cont, vec![t], output(DType::F32, &[3, 2]));
        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_cast_to_f16() {
        let x = tensor(&[0.5, -1.25], &[2]);
        let out = run(OpKind::Cast(DType::F16), vec![x], output(DType::F16, &[2]));
        assert_eq!(out, vec![0.5, -1.25]);
    }

    #[test]
    fn test_broadcast_index() {
        assert_eq!(broadcast_index(5, &[2, 3], &[3]), 2);
        assert_eq!(broadcast_index(5, &[2, 3], &[2, 1]), 1);
        assert_eq!(broadcast_index(4, &[2, 3], &[1, 1]), 0);
    }
}
