//! Dequantization functions for converting quantized blocks to f32
//!
//! The arithmetic matches llama.cpp's reference dequantizers, so blocks read
//! from GGUF files decode to the same values.

use super::blocks::*;

/// Nibble codes in element order: low nibbles first, then high nibbles
fn unpack_4bit(qs: &[u8; 16]) -> [u32; QK] {
    std::array::from_fn(|i| {
        let byte = qs[i % 16];
        if i < 16 {
            (byte & 0x0F) as u32
        } else {
            (byte >> 4) as u32
        }
    })
}

/// Inverse of the quantizer's 5-bit packing
fn unpack_5bit(qs: &[u8; 16], qh: [u8; 4]) -> [u32; QK] {
    let high = u32::from_le_bytes(qh);
    let mut codes = unpack_4bit(qs);
    for (i, code) in codes.iter_mut().enumerate() {
        *code |= ((high >> i) & 1) << 4;
    }
    codes
}

/// Codes 0..=15, centered on 8
pub fn dequantize_q4_0(block: &BlockQ4_0, output: &mut [f32; QK]) {
    let d = block.d.to_f32();
    for (o, code) in output.iter_mut().zip(unpack_4bit(&block.qs)) {
        *o = (code as i32 - 8) as f32 * d;
    }
}

pub fn dequantize_q4_1(block: &BlockQ4_1, output: &mut [f32; QK]) {
    let (d, m) = (block.d.to_f32(), block.m.to_f32());
    for (o, code) in output.iter_mut().zip(unpack_4bit(&block.qs)) {
        *o = code as f32 * d + m;
    }
}

/// Codes 0..=31, centered on 16
pub fn dequantize_q5_0(block: &BlockQ5_0, output: &mut [f32; QK]) {
    let d = block.d.to_f32();
    for (o, code) in output.iter_mut().zip(unpack_5bit(&block.qs, block.qh)) {
        *o = (code as i32 - 16) as f32 * d;
    }
}

pub fn dequantize_q5_1(block: &BlockQ5_1, output: &mut [f32; QK]) {
    let (d, m) = (block.d.to_f32(), block.m.to_f32());
    for (o, code) in output.iter_mut().zip(unpack_5bit(&block.qs, block.qh)) {
        *o = code as f32 * d + m;
    }
}

pub fn dequantize_q8_0(block: &BlockQ8_0, output: &mut [f32; QK]) {
    let d = block.d.to_f32();
    for (o, &q) in output.iter_mut().zip(&block.qs) {
        *o = q as f32 * d;
    }
}

/// Decode a run of packed blocks into `output`.
///
/// `src` must hold exactly `output.len() / 32` blocks. Blocks are read
/// unaligned so callers may hand in any sub-slice of a buffer.
pub fn dequantize_blocks<B: QuantBlock>(src: &[u8], output: &mut [f32]) {
    let type_size = std::mem::size_of::<B>();
    debug_assert_eq!(src.len() / type_size * QK, output.len());

    let mut tmp = [0.0f32; QK];
    for (raw, out) in src.chunks_exact(type_size).zip(output.chunks_exact_mut(QK)) {
        let block: B = bytemuck::pod_read_unaligned(raw);
        block.dequantize_into(&mut tmp);
        out.copy_from_slice(&tmp);
    }
}

/// Decode elements `[first, first + output.len())` of a packed tensor.
///
/// Only the blocks overlapping the range are decoded, one at a time, so the
/// scratch space stays at a single block regardless of the range length.
pub fn dequantize_span<B: QuantBlock>(src: &[u8], first: usize, output: &mut [f32]) {
    let type_size = std::mem::size_of::<B>();
    let mut tmp = [0.0f32; QK];
    let mut written = 0;

    while written < output.len() {
        let element = first + written;
        let block_idx = element / QK;
        let within = element % QK;
        let raw = &src[block_idx * type_size..(block_idx + 1) * type_size];
        let block: B = bytemuck::pod_read_unaligned(raw);
        block.dequantize_into(&mut tmp);

        let take = (QK - within).min(output.len() - written);
        output[written..written + take].copy_from_slice(&tmp[within..within + take]);
        written += take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_dequantize_q4_0_known_block() {
        let block = BlockQ4_0 {
            d: f16::from_f32(0.5),
            qs: [0x8F; 16],
        };
        let mut out = [0.0f32; 32];
        dequantize_q4_0(&block, &mut out);
        // low nibble 0xF -> 7, high nibble 0x8 -> 0
        assert_eq!(out[0], 3.5);
        assert_eq!(out[16], 0.0);
    }

    #[test]
    fn test_dequantize_q5_0_uses_high_bits() {
        let mut block = BlockQ5_0 {
            d: f16::from_f32(1.0),
            qh: [0; 4],
            qs: [0; 16],
        };
        let mut out = [0.0f32; 32];
        dequantize_q5_0(&block, &mut out);
        assert!(out.iter().all(|&v| v == -16.0));

        block.qh = 1u32.to_le_bytes();
        dequantize_q5_0(&block, &mut out);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], -16.0);
    }

    #[test]
    fn test_dequantize_span_crosses_blocks() {
        let blocks = [
            BlockQ8_0 {
                d: f16::from_f32(1.0),
                qs: std::array::from_fn(|i| i as i8),
            },
            BlockQ8_0 {
                d: f16::from_f32(1.0),
                qs: std::array::from_fn(|i| (i + 32) as i8),
            },
        ];
        let raw: &[u8] = bytemuck::cast_slice(&blocks[..]);

        let mut out = [0.0f32; 8];
        dequantize_span::<BlockQ8_0>(raw, 28, &mut out);
        assert_eq!(out, [28.0, 29.0, 30.0, 31.0, 32.0, 33.0, 34.0, 35.0]);
    }
}
