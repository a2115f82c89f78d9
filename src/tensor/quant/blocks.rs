//! Packed block layouts, byte-compatible with GGUF tensor data

use bytemuck::{Pod, Zeroable};
use half::f16;

/// Elements per block for every legacy format
pub const QK: usize = 32;

/// 4-bit symmetric: scale, then 32 nibbles
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ4_0 {
    pub d: f16,
    pub qs: [u8; QK / 2],
}

/// 4-bit with offset: scale, minimum, then 32 nibbles
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ4_1 {
    pub d: f16,
    pub m: f16,
    pub qs: [u8; QK / 2],
}

/// 5-bit symmetric; bit `i` of `qh` is the fifth bit of element `i`
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ5_0 {
    pub d: f16,
    pub qh: [u8; 4],
    pub qs: [u8; QK / 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ5_1 {
    pub d: f16,
    pub m: f16,
    pub qh: [u8; 4],
    pub qs: [u8; QK / 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ8_0 {
    pub d: f16,
    pub qs: [i8; QK],
}

/// Common interface over the packed block types.
///
/// Lets row-level code stay generic over the format while the per-format
/// arithmetic lives in plain functions.
pub trait QuantBlock: Pod {
    fn dequantize_into(&self, output: &mut [f32; QK]);
    fn quantize_from(input: &[f32; QK]) -> Self;
}

macro_rules! impl_quant_block {
    ($block:ty, $deq:path, $q:path) => {
        impl QuantBlock for $block {
            #[inline]
            fn dequantize_into(&self, output: &mut [f32; QK]) {
                $deq(self, output)
            }

            #[inline]
            fn quantize_from(input: &[f32; QK]) -> Self {
                $q(input)
            }
        }
    };
}

impl_quant_block!(BlockQ4_0, super::dequantize_q4_0, super::quantize_q4_0);
impl_quant_block!(BlockQ4_1, super::dequantize_q4_1, super::quantize_q4_1);
impl_quant_block!(BlockQ5_0, super::dequantize_q5_0, super::quantize_q5_0);
impl_quant_block!(BlockQ5_1, super::dequantize_q5_1, super::quantize_q5_1);
impl_quant_block!(BlockQ8_0, super::dequantize_q8_0, super::quantize_q8_0);

// Packed sizes must agree with the dtype table
const _: () = {
    use crate::tensor::DType;
    assert!(std::mem::size_of::<BlockQ4_0>() == DType::Q4_0.type_size());
    assert!(std::mem::size_of::<BlockQ4_1>() == DType::Q4_1.type_size());
    assert!(std::mem::size_of::<BlockQ5_0>() == DType::Q5_0.type_size());
    assert!(std::mem::size_of::<BlockQ5_1>() == DType::Q5_1.type_size());
    assert!(std::mem::size_of::<BlockQ8_0>() == DType::Q8_0.type_size());
};
