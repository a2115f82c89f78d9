//! Block quantizers
//!
//! Symmetric formats (Q4_0, Q5_0, Q8_0) pick `d = amax / qmax` and round each
//! value into `[-qmax, qmax]`; offset formats (Q4_1, Q5_1) map `[min, max]`
//! onto `[0, 2^bits - 1]`. The output decodes with the llama.cpp dequantizers.

use super::blocks::*;
use half::f16;

fn abs_max(input: &[f32; 32]) -> f32 {
    input.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()))
}

fn min_max(input: &[f32; 32]) -> (f32, f32) {
    input
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)))
}

#[inline]
fn inverse(d: f32) -> f32 {
    if d != 0.0 {
        1.0 / d
    } else {
        0.0
    }
}

/// Quantize f32 values to Q4_0 block
pub fn quantize_q4_0(input: &[f32; 32]) -> BlockQ4_0 {
    // Map [-amax, amax] to [-7, 7]
    let d = abs_max(input) / 7.0;
    let id = inverse(d);

    let mut qs = [0u8; 16];
    for i in 0..16 {
        // Shift into [1, 15]
        let lo = ((input[i] * id).round() as i32).clamp(-7, 7) + 8;
        let hi = ((input[i + 16] * id).round() as i32).clamp(-7, 7) + 8;
        qs[i] = (lo as u8) | ((hi as u8) << 4);
    }

    BlockQ4_0 {
        d: f16::from_f32(d),
        qs,
    }
}

/// Quantize f32 values to Q4_1 block
pub fn quantize_q4_1(input: &[f32; 32]) -> BlockQ4_1 {
    let (min_val, max_val) = min_max(input);

    let d = (max_val - min_val) / 15.0;
    let m = min_val;
    let id = inverse(d);

    let mut qs = [0u8; 16];
    for i in 0..16 {
        let lo = (((input[i] - m) * id).round() as i32).clamp(0, 15);
        let hi = (((input[i + 16] - m) * id).round() as i32).clamp(0, 15);
        qs[i] = (lo as u8) | ((hi as u8) << 4);
    }

    BlockQ4_1 {
        d: f16::from_f32(d),
        m: f16::from_f32(m),
        qs,
    }
}

/// Split 5-bit codes into the nibble array and the packed high bits
fn pack_5bit(codes: &[u32; 32]) -> ([u8; 16], [u8; 4]) {
    let mut qs = [0u8; 16];
    let mut qh = 0u32;
    for i in 0..16 {
        let lo = codes[i];
        let hi = codes[i + 16];
        qs[i] = ((lo & 0x0F) as u8) | (((hi & 0x0F) as u8) << 4);
        qh |= ((lo >> 4) & 1) << i;
        qh |= ((hi >> 4) & 1) << (i + 16);
    }
    (qs, qh.to_le_bytes())
}

/// Quantize f32 values to Q5_0 block
pub fn quantize_q5_0(input: &[f32; 32]) -> BlockQ5_0 {
    // Map [-amax, amax] to [-15, 15]
    let d = abs_max(input) / 15.0;
    let id = inverse(d);

    let codes: [u32; 32] =
        std::array::from_fn(|i| (((input[i] * id).round() as i32).clamp(-15, 15) + 16) as u32);
    let (qs, qh) = pack_5bit(&codes);

    BlockQ5_0 {
        d: f16::from_f32(d),
        qh,
        qs,
    }
}

/// Quantize f32 values to Q5_1 block
pub fn quantize_q5_1(input: &[f32; 32]) -> BlockQ5_1 {
    let (min_val, max_val) = min_max(input);

    let d = (max_val - min_val) / 31.0;
    let m = min_val;
    let id = inverse(d);

    let codes: [u32; 32] =
        std::array::from_fn(|i| (((input[i] - m) * id).round() as i32).clamp(0, 31) as u32);
    let (qs, qh) = pack_5bit(&codes);

    BlockQ5_1 {
        d: f16::from_f32(d),
        m: f16::from_f32(m),
        qh,
        qs,
    }
}

/// Quantize f32 values to Q8_0 block
pub fn quantize_q8_0(input: &[f32; 32]) -> BlockQ8_0 {
    // Map [-amax, amax] to [-127, 127]
    let d = abs_max(input) / 127.0;
    let id = inverse(d);

    let mut qs = [0i8; 32];
    for i in 0..32 {
        qs[i] = (input[i] * id).round().clamp(-127.0, 127.0) as i8;
    }

    BlockQ8_0 {
        d: f16::from_f32(d),
        qs,
    }
}

/// Encode `input.len() / 32` blocks into `output`
pub fn quantize_blocks<B: QuantBlock>(input: &[f32], output: &mut [u8]) {
    let type_size = std::mem::size_of::<B>();
    debug_assert_eq!(input.len() / QK * type_size, output.len());

    for (values, out) in input.chunks_exact(QK).zip(output.chunks_exact_mut(type_size)) {
        let mut chunk = [0.0f32; QK];
        chunk.copy_from_slice(values);
        let block = B::quantize_from(&chunk);
        out.copy_from_slice(bytemuck::bytes_of(&block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::quant::{dequantize_q4_0, dequantize_q4_1, dequantize_q5_1, dequantize_q8_0};

    #[test]
    fn test_q4_0_roundtrip() {
        let original: [f32; 32] = std::array::from_fn(|i| (i as f32 - 16.0) * 0.1);

        let block = quantize_q4_0(&original);
        let mut decoded = [0.0f32; 32];
        dequantize_q4_0(&block, &mut decoded);

        for (o, d) in original.iter().zip(decoded.iter()) {
            assert!(
                (o - d).abs() < 0.15,
                "Q4_0 roundtrip error too large: original={}, decoded={}",
                o,
                d
            );
        }
    }

    #[test]
    fn test_q4_1_roundtrip() {
        let original: [f32; 32] = std::array::from_fn(|i| (i as f32 - 16.0) * 0.1 + 1.0);

        let block = quantize_q4_1(&original);
        let mut decoded = [0.0f32; 32];
        dequantize_q4_1(&block, &mut decoded);

        for (o, d) in original.iter().zip(decoded.iter()) {
            assert!((o - d).abs() < 0.15, "original={}, decoded={}", o, d);
        }
    }

    #[test]
    fn test_q5_1_extremes_are_exact_codes() {
        let original: [f32; 32] = std::array::from_fn(|i| i as f32);
        let block = quantize_q5_1(&original);
        let mut decoded = [0.0f32; 32];
        dequantize_q5_1(&block, &mut decoded);

        // 31 levels over [0, 31] gives d = 1, all representable exactly
        for (o, d) in original.iter().zip(decoded.iter()) {
            assert_eq!(o, d);
        }
    }

    #[test]
    fn test_q8_0_zeros() {
        let original = [0.0f32; 32];
        let block = quantize_q8_0(&original);
        let mut decoded = [0.0f32; 32];
        dequantize_q8_0(&block, &mut decoded);

        for d in decoded.iter() {
            assert_eq!(*d, 0.0);
        }
    }
}
