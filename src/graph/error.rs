use super::{OpCode, TensorId};
use crate::tensor::{DType, TensorError};

#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("Shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: OpCode,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    #[error("Unsupported type {dtype} for {op}")]
    UnsupportedType { op: OpCode, dtype: DType },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown tensor {0}")]
    UnknownTensor(TensorId),

    #[error("Graph has no outputs")]
    NoOutputs,

    #[error("Graph builder is poisoned by an earlier error")]
    Poisoned,

    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),
}
