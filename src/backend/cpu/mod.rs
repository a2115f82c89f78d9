//! CPU backend implementation
//!
//! Buffers live in host memory and kernels run synchronously on a dedicated
//! rayon pool, so a single operation is split over disjoint row ranges while
//! nodes still execute one after another.

mod ops;
pub mod simd;

pub use ops::reference_kernels;

use crate::backend::{
    lookup_kernel, Backend, BackendError, BackendId, BackendResult, Buffer, DeviceKind, KernelCall,
    KernelTable,
};
use crate::graph::OpCode;
use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

/// CPU backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub name: String,
    /// Worker threads; 0 uses one per logical core
    pub threads: usize,
    /// Arena offset alignment in bytes
    pub alignment: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            name: "cpu".to_string(),
            threads: 0,
            alignment: 32,
        }
    }
}

/// CPU backend using SIMD operations and a rayon pool for parallelism
pub struct CpuBackend {
    id: BackendId,
    name: String,
    alignment: usize,
    pool: rayon::ThreadPool,
    kernels: KernelTable,
    /// Whether AVX2 is available
    has_avx2: bool,
}

impl CpuBackend {
    pub fn new(id: BackendId, config: CpuConfig) -> BackendResult<Self> {
        let threads = if config.threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            config.threads
        };
        if !config.alignment.is_power_of_two() {
            return Err(BackendError::InvalidArgument(format!(
                "alignment {} is not a power of two",
                config.alignment
            )));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name({
                let name = config.name.clone();
                move |i| format!("{}-worker-{}", name, i)
            })
            .build()
            .map_err(|e| BackendError::NotAvailable(format!("{}: {}", config.name, e)))?;

        let has_avx2 = simd::has_avx2();
        if !has_avx2 {
            warn!(backend = %config.name, "AVX2 not detected, using scalar dot products");
        }
        info!(backend = %config.name, threads, "created CPU backend");

        Ok(Self {
            id,
            name: config.name,
            alignment: config.alignment,
            pool,
            kernels: reference_kernels(),
            has_avx2,
        })
    }

    /// Get the number of threads used by this backend
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Check if AVX2 SIMD is available
    pub fn has_avx2(&self) -> bool {
        self.has_avx2
    }

    pub fn kernels(&self) -> &KernelTable {
        &self.kernels
    }
}

impl Backend for CpuBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn alloc_buffer(&self, size: usize) -> BackendResult<Buffer> {
        Ok(Buffer::new(self.id, size))
    }

    fn free_buffer(&self, buffer: Buffer) -> BackendResult<()> {
        buffer.check_owner(self.id, &self.name)?;
        buffer.release();
        Ok(())
    }

    fn write(&self, buffer: &Buffer, offset: usize, data: &[u8]) -> BackendResult<()> {
        buffer.check_owner(self.id, &self.name)?;
        buffer.write_range(offset, data)
    }

    fn read(&self, buffer: &Buffer, offset: usize, len: usize) -> BackendResult<Vec<u8>> {
        buffer.check_owner(self.id, &self.name)?;
        buffer.read_range(offset, len)
    }

    fn supports(&self, op: OpCode, dtype: DType) -> bool {
        self.kernels.contains(op, dtype)
    }

    fn dispatch(&self, call: &KernelCall) -> BackendResult<()> {
        call.check_owner(self.id, &self.name)?;
        let kernel = lookup_kernel(&self.kernels, &self.name, call)?;
        trace!(backend = %self.name, node = %call.node, op = %call.op, "dispatch");
        self.pool.install(|| kernel(call))
    }

    fn synchronize(&self) -> BackendResult<()> {
        // Dispatch is synchronous
        Ok(())
    }

    fn is_idle(&self) -> bool {
        true
    }
}
