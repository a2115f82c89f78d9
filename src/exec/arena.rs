//! Per-backend arena buffers owned by an executable plan

use crate::backend::{BackendId, BackendRegistry, Buffer};
use crate::plan::MemoryPlan;
use crate::Result;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One buffer per backend, grown on demand and reused across passes
#[derive(Debug, Default)]
pub(crate) struct Arenas {
    buffers: BTreeMap<BackendId, Buffer>,
}

impl Arenas {
    /// Make sure every backend of `plan` has an arena at least as large as
    /// the plan requires
    pub(crate) fn ensure(&mut self, registry: &BackendRegistry, plan: &MemoryPlan) -> Result<()> {
        for (backend, report) in plan.backends() {
            if report.arena_size == 0 {
                continue;
            }
            if let Some(buffer) = self.buffers.get(&backend) {
                if buffer.size() >= report.arena_size {
                    continue;
                }
            }

            let device = registry.backend(backend)?;
            if let Some(old) = self.buffers.remove(&backend) {
                device.free_buffer(old)?;
            }
            let buffer = device.alloc_buffer(report.arena_size)?;
            debug!(backend = device.name(), size = report.arena_size, "allocated arena");
            self.buffers.insert(backend, buffer);
        }
        Ok(())
    }

    pub(crate) fn get(&self, backend: BackendId) -> Option<&Buffer> {
        self.buffers.get(&backend)
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.buffers.values().map(Buffer::size).sum()
    }

    /// Hand every arena back to its backend
    pub(crate) fn release(&mut self, registry: &BackendRegistry) {
        for (backend, buffer) in std::mem::take(&mut self.buffers) {
            let freed = registry.backend(backend).and_then(|b| b.free_buffer(buffer));
            if let Err(e) = freed {
                warn!(backend = %backend, error = %e, "failed to free arena");
            }
        }
    }
}
