//! Backend-owned memory regions

use super::{BackendError, BackendId, BackendResult};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

struct BufferInner {
    id: u64,
    backend: BackendId,
    size: usize,
    freed: AtomicBool,
    memory: RwLock<Vec<u8>>,
}

/// Handle to a contiguous memory region owned by exactly one backend.
///
/// Handles are cheap to clone. The memory is released when the owning
/// backend frees the buffer or when the last handle drops.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Allocate `size` zeroed bytes tagged with `backend`
    pub fn new(backend: BackendId, size: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                backend,
                size,
                freed: AtomicBool::new(false),
                memory: RwLock::new(vec![0u8; size]),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Backend that owns this buffer
    pub fn backend(&self) -> BackendId {
        self.inner.backend
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn is_freed(&self) -> bool {
        self.inner.freed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same memory
    pub fn same_memory(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fail unless this buffer belongs to `backend`
    pub fn check_owner(&self, backend: BackendId, name: &str) -> BackendResult<()> {
        if self.inner.backend != backend {
            return Err(BackendError::ForeignBuffer {
                backend: name.to_string(),
                owner: self.inner.backend,
            });
        }
        Ok(())
    }

    fn check_live(&self) -> BackendResult<()> {
        if self.is_freed() {
            return Err(BackendError::BufferFreed(self.inner.id));
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> BackendResult<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.inner.size) {
            return Err(BackendError::OutOfBounds {
                offset,
                len,
                size: self.inner.size,
            });
        }
        Ok(())
    }

    /// Shared access to the raw bytes
    pub fn bytes(&self) -> BackendResult<RwLockReadGuard<'_, Vec<u8>>> {
        self.check_live()?;
        Ok(self.inner.memory.read())
    }

    /// Exclusive access to the raw bytes
    pub fn bytes_mut(&self) -> BackendResult<RwLockWriteGuard<'_, Vec<u8>>> {
        self.check_live()?;
        Ok(self.inner.memory.write())
    }

    /// Copy `len` bytes starting at `offset` out of the buffer
    pub fn read_range(&self, offset: usize, len: usize) -> BackendResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let memory = self.bytes()?;
        Ok(memory[offset..offset + len].to_vec())
    }

    /// Copy `data` into the buffer at `offset`
    pub fn write_range(&self, offset: usize, data: &[u8]) -> BackendResult<()> {
        self.check_range(offset, data.len())?;
        let mut memory = self.bytes_mut()?;
        memory[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Drop the memory and mark every handle as freed
    pub fn release(&self) {
        if !self.inner.freed.swap(true, Ordering::AcqRel) {
            *self.inner.memory.write() = Vec::new();
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend)
            .field("size", &self.inner.size)
            .field("freed", &self.is_freed())
            .finish()
    }
}
