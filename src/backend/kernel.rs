//! Kernel tables keyed by `(OpCode, DType)`

use super::{BackendResult, KernelCall};
use crate::graph::OpCode;
use crate::tensor::DType;
use std::collections::HashMap;

/// A kernel computes one node from its call description
pub type KernelFn = fn(&KernelCall) -> BackendResult<()>;

/// Per-backend dispatch table
#[derive(Clone, Default)]
pub struct KernelTable {
    kernels: HashMap<(OpCode, DType), KernelFn>,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op: OpCode, dtype: DType, kernel: KernelFn) {
        self.kernels.insert((op, dtype), kernel);
    }

    /// Register one kernel for several first-input dtypes
    pub fn register_all(&mut self, op: OpCode, dtypes: &[DType], kernel: KernelFn) {
        for &dtype in dtypes {
            self.register(op, dtype, kernel);
        }
    }

    pub fn get(&self, op: OpCode, dtype: DType) -> Option<KernelFn> {
        self.kernels.get(&(op, dtype)).copied()
    }

    pub fn contains(&self, op: OpCode, dtype: DType) -> bool {
        self.kernels.contains_key(&(op, dtype))
    }

    /// Keep only the entries `keep` accepts
    pub fn retain(&mut self, mut keep: impl FnMut(OpCode, DType) -> bool) {
        self.kernels.retain(|&(op, dtype), _| keep(op, dtype));
    }

    /// Registered keys in a stable order
    pub fn keys(&self) -> Vec<(OpCode, DType)> {
        let mut keys: Vec<_> = self.kernels.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl std::fmt::Debug for KernelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelTable").field("kernels", &self.kernels.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &KernelCall) -> BackendResult<()> {
        Ok(())
    }

    #[test]
    fn test_register_and_retain() {
        let mut table = KernelTable::new();
        table.register_all(OpCode::Add, &[DType::F32, DType::F16], noop);
        table.register(OpCode::MatMul, DType::Q4_0, noop);
        assert_eq!(table.len(), 3);
        assert!(table.contains(OpCode::Add, DType::F16));

        table.retain(|op, _| op != OpCode::Add);
        assert_eq!(table.keys(), vec![(OpCode::MatMul, DType::Q4_0)]);
        assert!(table.get(OpCode::Add, DType::F32).is_none());
    }
}
