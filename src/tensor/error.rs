//! Tensor error types

use super::DType;

#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected} elements, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("Invalid dtype for operation: {0}")]
    InvalidDType(DType),

    #[error("Tensor is not contiguous")]
    NotContiguous,

    #[error("Tensor rank {0} is outside 1..={max}", max = super::MAX_DIMS)]
    InvalidRank(usize),

    #[error("Tensor span of {span} bytes at offset {offset} exceeds buffer of {size} bytes")]
    SpanOutOfBounds {
        offset: usize,
        span: usize,
        size: usize,
    },

    #[error("Quantization error: {0}")]
    Quant(#[from] super::quant::QuantError),
}
