//! Quantization formats, quantizers and dequantizers
//!
//! Every format packs 32 values per block with an f16 scale (and for the
//! `_1` variants an f16 minimum). [`QuantFormat`] describes a format and its
//! documented round-trip error; the row-level functions below are what the
//! kernels and [`HostTensor`](crate::tensor::HostTensor) call.

mod blocks;
mod dequant;
mod quantize;

pub use blocks::*;
pub use dequant::*;
pub use quantize::*;

use super::DType;
use serde::{Deserialize, Serialize};

/// Relative rounding error of an f16 stored parameter (half an ulp)
const F16_REL_ERR: f32 = 1.0 / 2048.0;
/// Absolute rounding error in the f16 subnormal range
const F16_ABS_ERR: f32 = 1.0 / 33_554_432.0;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QuantError {
    #[error("{0} is not a quantized type")]
    NotQuantized(DType),

    #[error("{count} elements is not a multiple of the {dtype} block size {block_size}")]
    PartialBlock {
        dtype: DType,
        count: usize,
        block_size: usize,
    },

    #[error("value {value} in block {block} cannot be represented by {dtype}")]
    OutOfRange { dtype: DType, block: usize, value: f32 },

    #[error("packed buffer of {got} bytes, expected {expected}")]
    SizeMismatch { expected: usize, got: usize },
}

/// How a format derives its per-block parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleMethod {
    /// Symmetric: `d = amax / qmax`, no offset
    AbsMax,
    /// Asymmetric: `d = (max - min) / qmax`, offset `m = min`
    MinMax,
}

/// Static description of a block-quantized format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantFormat {
    pub dtype: DType,
    pub block_size: usize,
    pub type_size: usize,
    pub bits: u32,
    pub method: ScaleMethod,
}

impl QuantFormat {
    pub const Q4_0: Self = Self::new(DType::Q4_0, 4, ScaleMethod::AbsMax);
    pub const Q4_1: Self = Self::new(DType::Q4_1, 4, ScaleMethod::MinMax);
    pub const Q5_0: Self = Self::new(DType::Q5_0, 5, ScaleMethod::AbsMax);
    pub const Q5_1: Self = Self::new(DType::Q5_1, 5, ScaleMethod::MinMax);
    pub const Q8_0: Self = Self::new(DType::Q8_0, 8, ScaleMethod::AbsMax);

    pub const ALL: [Self; 5] = [Self::Q4_0, Self::Q4_1, Self::Q5_0, Self::Q5_1, Self::Q8_0];

    const fn new(dtype: DType, bits: u32, method: ScaleMethod) -> Self {
        Self {
            dtype,
            block_size: dtype.block_size(),
            type_size: dtype.type_size(),
            bits,
            method,
        }
    }

    /// Look up the format of a quantized dtype
    pub fn of(dtype: DType) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.dtype == dtype)
    }

    /// Largest integer code magnitude the quantizer produces
    pub fn qmax(&self) -> f32 {
        match self.method {
            ScaleMethod::AbsMax => ((1u32 << (self.bits - 1)) - 1) as f32,
            ScaleMethod::MinMax => ((1u32 << self.bits) - 1) as f32,
        }
    }

    pub fn has_offset(&self) -> bool {
        self.method == ScaleMethod::MinMax
    }

    /// Unrounded scale the quantizer chooses for `block`
    pub fn scale_for(&self, block: &[f32]) -> f32 {
        match self.method {
            ScaleMethod::AbsMax => block.iter().fold(0.0f32, |a, &x| a.max(x.abs())) / self.qmax(),
            ScaleMethod::MinMax => {
                let (lo, hi) = min_max_of(block);
                (hi - lo) / self.qmax()
            }
        }
    }

    /// Documented per-element bound on `|x - dequantize(quantize(x))|`.
    ///
    /// Half a quantization step, plus the f16 rounding of the stored scale
    /// (amplified by the largest code) and offset, plus a few f32 ulps for
    /// the arithmetic itself.
    pub fn error_bound(&self, block: &[f32]) -> f32 {
        let d = self.scale_for(block);
        let amax = block.iter().fold(0.0f32, |a, &x| a.max(x.abs()));
        let mut bound = 0.5 * d + self.qmax() * f16_rounding(d) + 4.0 * amax * f32::EPSILON;
        if self.has_offset() {
            let (lo, _) = min_max_of(block);
            bound += f16_rounding(lo) + 4.0 * amax * f32::EPSILON;
        }
        bound
    }

    /// Check that every value of `block` can be encoded
    fn check_block(&self, block_idx: usize, block: &[f32]) -> Result<(), QuantError> {
        let f16_max = half::f16::MAX.to_f32();
        let out_of_range = |value: f32| QuantError::OutOfRange {
            dtype: self.dtype,
            block: block_idx,
            value,
        };

        if let Some(&bad) = block.iter().find(|x| !x.is_finite()) {
            return Err(out_of_range(bad));
        }
        let scale = self.scale_for(block);
        if !scale.is_finite() || scale > f16_max {
            let worst = block.iter().fold(0.0f32, |a, &x| if x.abs() > a.abs() { x } else { a });
            return Err(out_of_range(worst));
        }
        if self.has_offset() {
            let (lo, _) = min_max_of(block);
            if lo.abs() > f16_max {
                return Err(out_of_range(lo));
            }
        }
        Ok(())
    }
}

fn min_max_of(block: &[f32]) -> (f32, f32) {
    block
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)))
}

fn f16_rounding(x: f32) -> f32 {
    (x.abs() * F16_REL_ERR).max(F16_ABS_ERR)
}

fn format_or_err(dtype: DType) -> Result<QuantFormat, QuantError> {
    QuantFormat::of(dtype).ok_or(QuantError::NotQuantized(dtype))
}

/// Quantize a row of floats into packed blocks of `dtype`.
///
/// `src.len()` must be a multiple of the block size and `dst` must hold
/// exactly the packed size. Values the format cannot encode are rejected
/// instead of saturated.
pub fn quantize_row(dtype: DType, src: &[f32], dst: &mut [u8]) -> Result<(), QuantError> {
    let format = format_or_err(dtype)?;
    if src.len() % format.block_size != 0 {
        return Err(QuantError::PartialBlock {
            dtype,
            count: src.len(),
            block_size: format.block_size,
        });
    }
    let expected = dtype.size_for_elements(src.len());
    if dst.len() != expected {
        return Err(QuantError::SizeMismatch {
            expected,
            got: dst.len(),
        });
    }
    for (i, block) in src.chunks_exact(format.block_size).enumerate() {
        format.check_block(i, block)?;
    }

    match dtype {
        DType::Q4_0 => quantize_blocks::<BlockQ4_0>(src, dst),
        DType::Q4_1 => quantize_blocks::<BlockQ4_1>(src, dst),
        DType::Q5_0 => quantize_blocks::<BlockQ5_0>(src, dst),
        DType::Q5_1 => quantize_blocks::<BlockQ5_1>(src, dst),
        DType::Q8_0 => quantize_blocks::<BlockQ8_0>(src, dst),
        other => return Err(QuantError::NotQuantized(other)),
    }
    Ok(())
}

/// Dequantize packed blocks of `dtype` into `dst`
pub fn dequantize_row(dtype: DType, src: &[u8], dst: &mut [f32]) -> Result<(), QuantError> {
    let format = format_or_err(dtype)?;
    if dst.len() % format.block_size != 0 {
        return Err(QuantError::PartialBlock {
            dtype,
            count: dst.len(),
            block_size: format.block_size,
        });
    }
    let expected = dtype.size_for_elements(dst.len());
    if src.len() != expected {
        return Err(QuantError::SizeMismatch {
            expected,
            got: src.len(),
        });
    }
    match dtype {
        DType::Q4_0 => dequantize_blocks::<BlockQ4_0>(src, dst),
        DType::Q4_1 => dequantize_blocks::<BlockQ4_1>(src, dst),
        DType::Q5_0 => dequantize_blocks::<BlockQ5_0>(src, dst),
        DType::Q5_1 => dequantize_blocks::<BlockQ5_1>(src, dst),
        DType::Q8_0 => dequantize_blocks::<BlockQ8_0>(src, dst),
        other => return Err(QuantError::NotQuantized(other)),
    }
    Ok(())
}

/// Dequantize logical elements `[first, first + dst.len())` of a packed tensor.
///
/// `src` is the packed tensor starting at its first block.
pub fn dequantize_elements(
    dtype: DType,
    src: &[u8],
    first: usize,
    dst: &mut [f32],
) -> Result<(), QuantError> {
    let needed = dtype.size_for_elements(first + dst.len());
    if src.len() < needed {
        return Err(QuantError::SizeMismatch {
            expected: needed,
            got: src.len(),
        });
    }
    match dtype {
        DType::Q4_0 => dequantize_span::<BlockQ4_0>(src, first, dst),
        DType::Q4_1 => dequantize_span::<BlockQ4_1>(src, first, dst),
        DType::Q5_0 => dequantize_span::<BlockQ5_0>(src, first, dst),
        DType::Q5_1 => dequantize_span::<BlockQ5_1>(src, first, dst),
        DType::Q8_0 => dequantize_span::<BlockQ8_0>(src, first, dst),
        other => return Err(QuantError::NotQuantized(other)),
    }
    Ok(())
}
