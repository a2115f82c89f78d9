//! Element conversion between raw buffer bytes and f32
//!
//! Kernels compute in f32. These helpers read (possibly strided) views out of
//! a buffer and write results back in the output dtype.

use super::quant::{dequantize_elements, quantize_row};
use super::{DType, Layout, TensorError};
use half::{bf16, f16};

#[inline]
fn read_scalar(dtype: DType, bytes: &[u8]) -> f32 {
    match dtype {
        DType::F32 => bytemuck::pod_read_unaligned::<f32>(bytes),
        DType::F16 => bytemuck::pod_read_unaligned::<f16>(bytes).to_f32(),
        DType::BF16 => bytemuck::pod_read_unaligned::<bf16>(bytes).to_f32(),
        DType::I8 => bytes[0] as i8 as f32,
        DType::I32 => bytemuck::pod_read_unaligned::<i32>(bytes) as f32,
        _ => unreachable!("quantized dtypes are decoded by block"),
    }
}

/// Decode every element of a view into a row-major f32 vector.
///
/// `raw` is the whole buffer; the layout's byte offset locates the view.
pub fn decode_f32(dtype: DType, raw: &[u8], layout: &Layout) -> Result<Vec<f32>, TensorError> {
    let mut out = vec![0.0f32; layout.numel()];
    decode_range(dtype, raw, layout, 0, &mut out)?;
    Ok(out)
}

/// Decode logical elements `[first, first + out.len())` of a view.
///
/// Quantized views must be contiguous; only the blocks overlapping the range
/// are decoded.
pub fn decode_range(
    dtype: DType,
    raw: &[u8],
    layout: &Layout,
    first: usize,
    out: &mut [f32],
) -> Result<(), TensorError> {
    layout.check_span(dtype, raw.len())?;
    if first + out.len() > layout.numel() {
        return Err(TensorError::ShapeMismatch {
            expected: layout.numel(),
            got: first + out.len(),
        });
    }
    let base = &raw[layout.offset()..];

    if dtype.is_quantized() {
        if !layout.is_contiguous() {
            return Err(TensorError::NotContiguous);
        }
        dequantize_elements(dtype, base, first, out)?;
        return Ok(());
    }

    let size = dtype.type_size();
    if layout.is_contiguous() {
        for (i, o) in out.iter_mut().enumerate() {
            let at = (first + i) * size;
            *o = read_scalar(dtype, &base[at..at + size]);
        }
    } else {
        for (i, o) in out.iter_mut().enumerate() {
            let at = layout.physical_index(first + i) * size;
            *o = read_scalar(dtype, &base[at..at + size]);
        }
    }
    Ok(())
}

/// Decode an I32 view without going through f32
pub fn decode_i32(raw: &[u8], layout: &Layout) -> Result<Vec<i32>, TensorError> {
    layout.check_span(DType::I32, raw.len())?;
    let base = &raw[layout.offset()..];
    Ok((0..layout.numel())
        .map(|i| {
            let at = layout.physical_index(i) * 4;
            bytemuck::pod_read_unaligned::<i32>(&base[at..at + 4])
        })
        .collect())
}

/// Encode row-major f32 values into `out` using `dtype`.
///
/// Integer targets round to nearest and saturate; quantized targets go
/// through the block quantizer and reject unrepresentable values.
pub fn encode_f32(dtype: DType, values: &[f32], out: &mut [u8]) -> Result<(), TensorError> {
    let expected = dtype.size_for_elements(values.len());
    if out.len() != expected {
        return Err(TensorError::SizeMismatch {
            expected,
            got: out.len(),
        });
    }

    match dtype {
        DType::F32 => {
            for (chunk, &v) in out.chunks_exact_mut(4).zip(values) {
                chunk.copy_from_slice(&v.to_le_bytes());
            }
        }
        DType::F16 => {
            for (chunk, &v) in out.chunks_exact_mut(2).zip(values) {
                chunk.copy_from_slice(&f16::from_f32(v).to_le_bytes());
            }
        }
        DType::BF16 => {
            for (chunk, &v) in out.chunks_exact_mut(2).zip(values) {
                chunk.copy_from_slice(&bf16::from_f32(v).to_le_bytes());
            }
        }
        DType::I8 => {
            for (o, &v) in out.iter_mut().zip(values) {
                *o = v.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8 as u8;
            }
        }
        DType::I32 => {
            for (chunk, &v) in out.chunks_exact_mut(4).zip(values) {
                chunk.copy_from_slice(&(v.round() as i32).to_le_bytes());
            }
        }
        _ => quantize_row(dtype, values, out)?,
    }
    Ok(())
}

/// Copy a view's elements into a packed, row-major byte vector.
///
/// Contiguous views (including every quantized view) are a single copy;
/// strided views of plain dtypes are gathered element by element.
pub fn gather_bytes(dtype: DType, raw: &[u8], layout: &Layout) -> Result<Vec<u8>, TensorError> {
    layout.check_span(dtype, raw.len())?;
    let base = &raw[layout.offset()..];

    if layout.is_contiguous() {
        let len = layout.packed_size(dtype);
        return Ok(base[..len].to_vec());
    }
    if dtype.is_quantized() {
        return Err(TensorError::NotContiguous);
    }

    let size = dtype.type_size();
    let mut out = Vec::with_capacity(layout.numel() * size);
    for i in 0..layout.numel() {
        let at = layout.physical_index(i) * size;
        out.extend_from_slice(&base[at..at + size]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    #[test]
    fn test_decode_transposed_view() {
        let raw = f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let layout = Layout::contiguous(&[2, 3]).unwrap().permute(&[1, 0]).unwrap();
        let values = decode_f32(DType::F32, &raw, &layout).unwrap();
        assert_eq!(values, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_decode_respects_offset() {
        let raw = f32_bytes(&[9.0, 9.0, 1.0, 2.0]);
        let layout = Layout::contiguous(&[2]).unwrap().with_offset(8);
        assert_eq!(decode_f32(DType::F32, &raw, &layout).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_decode_rejects_span_overflow() {
        let raw = f32_bytes(&[1.0, 2.0]);
        let layout = Layout::contiguous(&[3]).unwrap();
        assert!(matches!(
            decode_f32(DType::F32, &raw, &layout),
            Err(TensorError::SpanOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_encode_half_precision() {
        let values = [1.5f32, -2.25, 0.0];
        for dtype in [DType::F16, DType::BF16] {
            let mut out = vec![0u8; 6];
            encode_f32(dtype, &values, &mut out).unwrap();
            let layout = Layout::contiguous(&[3]).unwrap();
            assert_eq!(decode_f32(dtype, &out, &layout).unwrap(), values.to_vec());
        }
    }

    #[test]
    fn test_encode_i8_saturates() {
        let mut out = vec![0u8; 3];
        encode_f32(DType::I8, &[300.0, -300.0, 2.6], &mut out).unwrap();
        assert_eq!(out, vec![127u8, 128u8, 3u8]);
    }

    #[test]
    fn test_gather_strided() {
        let raw = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);
        let layout = Layout::contiguous(&[2, 2]).unwrap().permute(&[1, 0]).unwrap();
        let packed = gather_bytes(DType::F32, &raw, &layout).unwrap();
        assert_eq!(packed, f32_bytes(&[1.0, 3.0, 2.0, 4.0]));
    }

    #[test]
    fn test_decode_i32() {
        let raw: Vec<u8> = bytemuck::cast_slice(&[3i32, -1, 7]).to_vec();
        let layout = Layout::contiguous(&[3]).unwrap();
        assert_eq!(decode_i32(&raw, &layout).unwrap(), vec![3, -1, 7]);
    }
}
