//! Operation catalogue

use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fieldless operation tag, used as the kernel table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    Add,
    Sub,
    Mul,
    Div,
    Scale,
    Silu,
    Gelu,
    Relu,
    Softmax,
    RmsNorm,
    #[serde(rename = "matmul")]
    MatMul,
    GetRows,
    Dequantize,
    Quantize,
    Cast,
    Cont,
    Reshape,
    Permute,
    Slice,
    Transfer,
}

impl OpCode {
    /// Every op code, in declaration order
    pub const ALL: [OpCode; 20] = [
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Scale,
        OpCode::Silu,
        OpCode::Gelu,
        OpCode::Relu,
        OpCode::Softmax,
        OpCode::RmsNorm,
        OpCode::MatMul,
        OpCode::GetRows,
        OpCode::Dequantize,
        OpCode::Quantize,
        OpCode::Cast,
        OpCode::Cont,
        OpCode::Reshape,
        OpCode::Permute,
        OpCode::Slice,
        OpCode::Transfer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Scale => "scale",
            Self::Silu => "silu",
            Self::Gelu => "gelu",
            Self::Relu => "relu",
            Self::Softmax => "softmax",
            Self::RmsNorm => "rms_norm",
            Self::MatMul => "matmul",
            Self::GetRows => "get_rows",
            Self::Dequantize => "dequantize",
            Self::Quantize => "quantize",
            Self::Cast => "cast",
            Self::Cont => "cont",
            Self::Reshape => "reshape",
            Self::Permute => "permute",
            Self::Slice => "slice",
            Self::Transfer => "transfer",
        }
    }

    /// Views alias their source and never reach a kernel
    pub fn is_view(&self) -> bool {
        matches!(self, Self::Reshape | Self::Permute | Self::Slice)
    }

    /// Ops that dispatch a kernel on their backend
    pub fn needs_kernel(&self) -> bool {
        !self.is_view() && *self != Self::Transfer
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operation together with its parameters
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Scale(f32),
    Silu,
    Gelu,
    Relu,
    /// Along the last dimension
    Softmax,
    /// `x / sqrt(mean(x^2) + eps)` along the last dimension
    RmsNorm { eps: f32 },
    MatMul,
    GetRows,
    Dequantize,
    Quantize(DType),
    Cast(DType),
    Cont,
    Reshape(Vec<usize>),
    Permute(Vec<usize>),
    Slice { dim: usize, start: usize, len: usize },
    /// Device-to-device copy inserted by the scheduler
    Transfer,
}

impl OpKind {
    pub fn code(&self) -> OpCode {
        match self {
            Self::Add => OpCode::Add,
            Self::Sub => OpCode::Sub,
            Self::Mul => OpCode::Mul,
            Self::Div => OpCode::Div,
            Self::Scale(_) => OpCode::Scale,
            Self::Silu => OpCode::Silu,
            Self::Gelu => OpCode::Gelu,
            Self::Relu => OpCode::Relu,
            Self::Softmax => OpCode::Softmax,
            Self::RmsNorm { .. } => OpCode::RmsNorm,
            Self::MatMul => OpCode::MatMul,
            Self::GetRows => OpCode::GetRows,
            Self::Dequantize => OpCode::Dequantize,
            Self::Quantize(_) => OpCode::Quantize,
            Self::Cast(_) => OpCode::Cast,
            Self::Cont => OpCode::Cont,
            Self::Reshape(_) => OpCode::Reshape,
            Self::Permute(_) => OpCode::Permute,
            Self::Slice { .. } => OpCode::Slice,
            Self::Transfer => OpCode::Transfer,
        }
    }

    pub fn name(&self) -> &'static str {
        self.code().name()
    }

    pub fn is_view(&self) -> bool {
        self.code().is_view()
    }

    /// Number of inputs the op takes
    pub fn arity(&self) -> usize {
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::MatMul | Self::GetRows => 2,
            _ => 1,
        }
    }

    /// Whether the output may share its range with a dying input of the same
    /// byte size. Every element of the output depends only on inputs the
    /// kernel has already read.
    pub fn can_inplace(&self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Scale(_)
                | Self::Silu
                | Self::Gelu
                | Self::Relu
                | Self::Softmax
                | Self::RmsNorm { .. }
                | Self::Cast(_)
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scale(s) => write!(f, "scale({})", s),
            Self::RmsNorm { eps } => write!(f, "rms_norm(eps={})", eps),
            Self::Quantize(dtype) => write!(f, "quantize({})", dtype),
            Self::Cast(dtype) => write!(f, "cast({})", dtype),
            Self::Reshape(shape) => write!(f, "reshape({:?})", shape),
            Self::Permute(axes) => write!(f, "permute({:?})", axes),
            Self::Slice { dim, start, len } => {
                write!(f, "slice(dim={}, {}..{})", dim, start, start.saturating_add(*len))
            }
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_names() {
        for code in OpCode::ALL {
            assert!(!code.name().is_empty());
        }
        assert_eq!(OpKind::RmsNorm { eps: 1e-5 }.code(), OpCode::RmsNorm);
        assert_eq!(OpKind::Quantize(DType::Q4_0).to_string(), "quantize(q4_0)");
        assert_eq!(OpKind::Slice { dim: 0, start: 2, len: 3 }.to_string(), "slice(dim=0, 2..5)");
        let huge = OpKind::Slice { dim: 1, start: usize::MAX, len: 2 };
        assert_eq!(huge.to_string(), format!("slice(dim=1, {}..{})", usize::MAX, usize::MAX));
    }

    #[test]
    fn test_view_and_kernel_classes() {
        assert!(OpCode::Reshape.is_view());
        assert!(!OpCode::Transfer.needs_kernel());
        assert!(OpCode::MatMul.needs_kernel());
        assert!(!OpKind::MatMul.can_inplace());
        assert!(OpKind::Add.can_inplace());
    }
}
