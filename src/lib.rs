//! llama-graph: a backend-abstracted tensor graph engine for quantized LLM inference
//!
//! Weights are loaded from GGUF files into backend buffers, a forward pass is
//! described as a graph, and the engine schedules it over the registered
//! backends, plans arena memory and executes it.

pub mod backend;
pub mod config;
pub mod engine;
pub mod exec;
pub mod gguf;
pub mod graph;
pub mod loader;
pub mod plan;
pub mod sched;
pub mod tensor;

pub use backend::{Backend, BackendError, BackendId, BackendRegistry, BoundTensor, Buffer, DeviceKind};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, PlanReport};
pub use exec::{AbortFlag, ExecOptions, ExecutablePlan, Inputs, Outputs};
pub use gguf::{GgufError, GgufFile};
pub use graph::{Graph, GraphBuilder, GraphError, OpCode, OpKind, TensorId};
pub use plan::{AllocStrategy, PlanError};
pub use sched::{PlacementPolicy, SchedError, TieBreak};
pub use tensor::{quant::QuantError, DType, HostTensor, TensorError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("GGUF error: {0}")]
    Gguf(#[from] gguf::GgufError),
    #[error("Tensor error: {0}")]
    Tensor(#[from] tensor::TensorError),
    #[error("Quantization error: {0}")]
    Quant(#[from] tensor::quant::QuantError),
    #[error("Backend error: {0}")]
    Backend(#[from] backend::BackendError),
    #[error("Graph error: {0}")]
    Graph(#[from] graph::GraphError),
    #[error("Scheduling error: {0}")]
    Sched(#[from] sched::SchedError),
    #[error("Planning error: {0}")]
    Plan(#[from] plan::PlanError),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Input '{name}' expects {expected_dtype} {expected:?}, got {got_dtype} {got:?}")]
    InputMismatch {
        name: String,
        expected: Vec<usize>,
        expected_dtype: DType,
        got: Vec<usize>,
        got_dtype: DType,
    },

    #[error("Tensor '{0}' has no memory assigned")]
    Unplanned(String),

    #[error("Transfer of '{tensor}' from {from} to {to} failed: {source}")]
    TransferFailure {
        tensor: String,
        from: String,
        to: String,
        source: backend::BackendError,
    },

    #[error("Execution failed at '{node}' ({op}): {source}")]
    ExecutionFailed {
        node: String,
        op: OpCode,
        source: backend::BackendError,
    },

    #[error("Execution cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
