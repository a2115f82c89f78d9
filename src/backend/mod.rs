//! Hardware backends for graph execution
//!
//! This module defines the `Backend` trait, an abstraction over devices that
//! own memory and run kernels. The engine only talks to this trait, so new
//! devices (including test doubles) plug in without engine changes.

mod buffer;
pub mod cpu;
mod error;
mod kernel;
mod registry;
pub mod stream;

pub use buffer::Buffer;
pub use error::BackendError;
pub use kernel::{KernelFn, KernelTable};
pub use registry::BackendRegistry;

use crate::graph::{NodeId, OpCode, OpKind};
use crate::tensor::{DType, HostTensor, Layout};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Position of a backend inside its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub usize);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One execution pass, as seen by the backends it dispatches to.
///
/// Deferred failures are recorded against the pass that caused them.
/// `PassId(0)` stands for work submitted outside any pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub u64);

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pass {}", self.0)
    }
}

/// Device class of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

/// A tensor view inside a backend buffer
#[derive(Debug, Clone)]
pub struct TensorRef {
    pub buffer: Buffer,
    pub layout: Layout,
    pub dtype: DType,
}

/// A leaf tensor resident in a backend buffer
#[derive(Debug, Clone)]
pub struct BoundTensor {
    pub name: String,
    pub buffer: Buffer,
    pub layout: Layout,
    pub dtype: DType,
}

impl BoundTensor {
    pub fn backend(&self) -> BackendId {
        self.buffer.backend()
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn to_ref(&self) -> TensorRef {
        TensorRef {
            buffer: self.buffer.clone(),
            layout: self.layout.clone(),
            dtype: self.dtype,
        }
    }
}

/// Everything a kernel needs to compute one node
#[derive(Debug, Clone)]
pub struct KernelCall {
    pub pass: PassId,
    pub node: NodeId,
    pub op: OpKind,
    pub inputs: Vec<TensorRef>,
    pub output: TensorRef,
}

impl KernelCall {
    /// Kernel table key: the op and the dtype of the first input
    pub fn key(&self) -> (OpCode, DType) {
        let dtype = self.inputs.first().map_or(self.output.dtype, |t| t.dtype);
        (self.op.code(), dtype)
    }

    fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.inputs.iter().map(|t| &t.buffer).chain(std::iter::once(&self.output.buffer))
    }

    /// Fail if any tensor of the call lives outside `backend`
    pub fn check_owner(&self, backend: BackendId, name: &str) -> BackendResult<()> {
        self.buffers().try_for_each(|b| b.check_owner(backend, name))
    }
}

/// Compute device trait
///
/// A backend owns buffers, moves bytes between host and device, and runs
/// kernels looked up by `(OpCode, DType)`. Dispatch may be asynchronous;
/// `synchronize` blocks until every previously submitted command is done.
pub trait Backend: Send + Sync {
    fn id(&self) -> BackendId;

    /// Get the name of this backend
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Check if this backend is available on the current system
    fn is_available(&self) -> bool {
        true
    }

    /// Required alignment of tensor offsets inside an arena
    fn alignment(&self) -> usize {
        32
    }

    // =========================================================================
    // Memory operations
    // =========================================================================

    fn alloc_buffer(&self, size: usize) -> BackendResult<Buffer>;

    fn free_buffer(&self, buffer: Buffer) -> BackendResult<()>;

    /// Host to device copy
    fn write(&self, buffer: &Buffer, offset: usize, data: &[u8]) -> BackendResult<()>;

    /// Device to host copy, ordered after every earlier command
    fn read(&self, buffer: &Buffer, offset: usize, len: usize) -> BackendResult<Vec<u8>>;

    /// Copy a host tensor into a fresh buffer of this backend
    fn upload(&self, name: &str, tensor: &HostTensor) -> BackendResult<BoundTensor> {
        let buffer = self.alloc_buffer(tensor.data().len())?;
        self.write(&buffer, 0, tensor.data())?;
        Ok(BoundTensor {
            name: name.to_string(),
            buffer,
            layout: tensor.layout().clone(),
            dtype: tensor.dtype(),
        })
    }

    // =========================================================================
    // Kernels
    // =========================================================================

    /// Whether a kernel exists for `op` with first-input type `dtype`
    fn supports(&self, op: OpCode, dtype: DType) -> bool;

    fn dispatch(&self, call: &KernelCall) -> BackendResult<()>;

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Block until all submitted work has completed, reporting deferred failures
    fn synchronize(&self) -> BackendResult<()>;

    /// Like `synchronize`, but report only the deferred failures of `pass`
    /// and forget them. Backends without deferred work need not override it.
    fn synchronize_pass(&self, _pass: PassId) -> BackendResult<()> {
        self.synchronize()
    }

    /// Non-blocking completion query
    fn is_idle(&self) -> bool;
}

/// Look up the kernel for `call` in `table`, failing with `UnsupportedOperation`
pub fn lookup_kernel(table: &KernelTable, backend: &str, call: &KernelCall) -> BackendResult<KernelFn> {
    let (op, dtype) = call.key();
    table.get(op, dtype).ok_or_else(|| BackendError::UnsupportedOperation {
        backend: backend.to_string(),
        op,
        dtype,
    })
}
