//! Backend registry
//!
//! An explicit context object holding every backend of an engine, addressed
//! by [`BackendId`] in registration order. Nothing here is global: two
//! registries are fully independent.

use super::cpu::{CpuBackend, CpuConfig};
use super::stream::{StreamBackend, StreamConfig};
use super::{Backend, BackendError, BackendId, BackendResult, PassId};
use crate::graph::OpCode;
use crate::tensor::DType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
    default: Option<BackendId>,
    /// Last pass handed out; `PassId(0)` is never issued
    passes: AtomicU64,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a single CPU backend
    pub fn cpu(config: CpuConfig) -> BackendResult<Self> {
        let mut registry = Self::new();
        registry.register(|id| CpuBackend::new(id, config))?;
        Ok(registry)
    }

    /// Build the CPU backend followed by every configured stream backend
    pub fn from_configs(cpu: &CpuConfig, streams: &[StreamConfig]) -> BackendResult<Self> {
        let mut registry = Self::cpu(cpu.clone())?;
        for config in streams {
            let config = config.clone();
            registry.register(|id| StreamBackend::new(id, config))?;
        }
        Ok(registry)
    }

    /// Register a backend built by `make` with the id it will be addressed by.
    ///
    /// The first backend registered becomes the default.
    pub fn register<B, F>(&mut self, make: F) -> BackendResult<BackendId>
    where
        B: Backend + 'static,
        F: FnOnce(BackendId) -> BackendResult<B>,
    {
        let id = BackendId(self.backends.len());
        let backend = make(id)?;
        if backend.id() != id {
            return Err(BackendError::InvalidArgument(format!(
                "backend '{}' reports id {} but was registered as {}",
                backend.name(),
                backend.id(),
                id
            )));
        }
        if self.by_name(backend.name()).is_some() {
            return Err(BackendError::InvalidArgument(format!(
                "backend name '{}' is already registered",
                backend.name()
            )));
        }
        if !backend.is_available() {
            return Err(BackendError::NotAvailable(backend.name().to_string()));
        }

        info!(backend = backend.name(), id = id.0, kind = ?backend.kind(), "registered backend");
        self.backends.push(Arc::new(backend));
        if self.default.is_none() {
            self.default = Some(id);
        }
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BackendId> + '_ {
        (0..self.backends.len()).map(BackendId)
    }

    pub fn get(&self, id: BackendId) -> Option<&Arc<dyn Backend>> {
        self.backends.get(id.0)
    }

    /// Like [`get`](Self::get) but failing with `UnknownBackend`
    pub fn backend(&self, id: BackendId) -> BackendResult<&Arc<dyn Backend>> {
        self.get(id).ok_or_else(|| BackendError::UnknownBackend(id.to_string()))
    }

    pub fn by_name(&self, name: &str) -> Option<BackendId> {
        self.backends.iter().position(|b| b.name() == name).map(BackendId)
    }

    pub fn name_of(&self, id: BackendId) -> &str {
        self.get(id).map_or("<unknown>", |b| b.name())
    }

    pub fn default_backend(&self) -> BackendResult<BackendId> {
        self.default
            .ok_or_else(|| BackendError::NotAvailable("no backend registered".into()))
    }

    pub fn set_default(&mut self, id: BackendId) -> BackendResult<()> {
        self.backend(id)?;
        self.default = Some(id);
        Ok(())
    }

    /// Capability query for one backend
    pub fn supports(&self, id: BackendId, op: OpCode, dtype: DType) -> bool {
        self.get(id).is_some_and(|b| b.supports(op, dtype))
    }

    /// Block until every backend is idle.
    ///
    /// All backends are drained even if one fails; the first failure is
    /// returned.
    pub fn synchronize_all(&self) -> BackendResult<()> {
        let failures = self
            .backends
            .iter()
            .filter_map(|b| b.synchronize().err().map(|e| (b.id(), e)))
            .collect();
        self.first_failure(failures)
    }

    /// Token for a new execution pass
    pub fn begin_pass(&self) -> PassId {
        PassId(self.passes.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Block until every backend is idle, reporting only failures of `pass`
    pub fn synchronize_pass(&self, pass: PassId) -> BackendResult<()> {
        self.first_failure(self.drain_pass(pass))
    }

    /// Block until every backend is idle and clear the deferred failures of
    /// `pass`, returning them
    pub fn drain_pass(&self, pass: PassId) -> Vec<(BackendId, BackendError)> {
        self.backends
            .iter()
            .filter_map(|b| b.synchronize_pass(pass).err().map(|e| (b.id(), e)))
            .collect()
    }

    fn first_failure(&self, failures: Vec<(BackendId, BackendError)>) -> BackendResult<()> {
        let mut failures = failures.into_iter();
        let Some((_, first)) = failures.next() else {
            return Ok(());
        };
        for (id, other) in failures {
            warn!(backend = self.name_of(id), error = %other, "dropping further backend failure");
        }
        Err(first)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("BackendRegistry")
            .field("backends", &names)
            .field("default", &self.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_addresses_by_registration_order() {
        let registry = BackendRegistry::from_configs(
            &CpuConfig::default(),
            &[StreamConfig::named("accel0"), StreamConfig::named("accel1")],
        )
        .unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.by_name("cpu"), Some(BackendId(0)));
        assert_eq!(registry.by_name("accel1"), Some(BackendId(2)));
        assert_eq!(registry.default_backend().unwrap(), BackendId(0));
        assert!(registry.supports(BackendId(1), OpCode::MatMul, DType::Q4_0));
        assert!(registry.synchronize_all().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut registry = BackendRegistry::cpu(CpuConfig::default()).unwrap();
        let err = registry.register(|id| CpuBackend::new(id, CpuConfig::default()));
        assert!(matches!(err, Err(BackendError::InvalidArgument(_))));
    }

    #[test]
    fn test_pass_tokens_are_unique() {
        let registry = BackendRegistry::cpu(CpuConfig::default()).unwrap();
        let first = registry.begin_pass();
        let second = registry.begin_pass();
        assert_ne!(first, PassId::default());
        assert!(second > first);
        assert!(registry.drain_pass(first).is_empty());
        assert!(registry.synchronize_pass(second).is_ok());
    }

    #[test]
    fn test_empty_registry_has_no_default() {
        let registry = BackendRegistry::new();
        assert!(registry.default_backend().is_err());
        assert!(!registry.supports(BackendId(0), OpCode::Add, DType::F32));
    }
}
