use super::BackendId;
use crate::graph::{NodeId, OpCode};
use crate::tensor::DType;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("Backend not available: {0}")]
    NotAvailable(String),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("DType mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("Backend '{backend}' has no kernel for {op} on {dtype}")]
    UnsupportedOperation {
        backend: String,
        op: OpCode,
        dtype: DType,
    },

    #[error("Buffer owned by backend {owner} used on backend '{backend}'")]
    ForeignBuffer { backend: String, owner: BackendId },

    #[error("Buffer {0} has been freed")]
    BufferFreed(u64),

    #[error("Access of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("Kernel {op} failed at node {node}: {message}")]
    KernelFailed {
        node: NodeId,
        op: OpCode,
        message: String,
    },

    #[error("Command stream of '{0}' is closed")]
    StreamClosed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] crate::tensor::TensorError),
}
