//! Tensor descriptors for llama-graph
//!
//! This module provides the element types, view geometry and host-side
//! tensors shared by every other part of the engine, together with the
//! block-quantized formats.

mod convert;
mod dtype;
mod error;
mod host;
mod layout;
pub mod quant;

pub use convert::{decode_f32, decode_i32, decode_range, encode_f32, gather_bytes};
pub use dtype::DType;
pub use error::TensorError;
pub use host::HostTensor;
pub use layout::{broadcast_shapes, compute_strides, Layout, MAX_DIMS};
