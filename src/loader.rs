//! Binding GGUF tensors to backend buffers
//!
//! Each tensor goes to the backend the placement policy names for it: the
//! first matching rule, then the policy default, then the registry default.

use crate::backend::{Backend, BackendId, BackendRegistry, BoundTensor};
use crate::gguf::{GgufError, GgufFile};
use crate::graph::{GraphBuilder, TensorId};
use crate::sched::{PlacementPolicy, SchedError};
use crate::tensor::HostTensor;
use crate::Result;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Weights resident in backend buffers, by tensor name
#[derive(Debug, Default, Clone)]
pub struct WeightSet {
    tensors: BTreeMap<String, BoundTensor>,
}

impl WeightSet {
    pub fn get(&self, name: &str) -> Option<&BoundTensor> {
        self.tensors.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BoundTensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Bytes held on `backend`
    pub fn bytes_on(&self, backend: BackendId) -> usize {
        self.tensors
            .values()
            .filter(|t| t.backend() == backend)
            .map(|t| t.buffer.size())
            .sum()
    }

    /// Add the named weight to a graph under construction
    pub fn bind(&self, builder: &mut GraphBuilder, name: &str) -> Result<TensorId> {
        let bound = self
            .get(name)
            .ok_or_else(|| GgufError::TensorNotFound(name.to_string()))?;
        Ok(builder.weight(name, bound)?)
    }
}

fn backend_for(registry: &BackendRegistry, policy: &PlacementPolicy, name: &str) -> Result<BackendId> {
    let chosen = policy.backend_for(name).or(policy.default_backend.as_deref());
    let id = match chosen {
        Some(backend) => registry
            .by_name(backend)
            .ok_or_else(|| SchedError::UnknownBackend(backend.to_string()))?,
        None => registry.default_backend().map_err(|_| SchedError::NoBackends)?,
    };
    Ok(id)
}

/// Upload every tensor of `file` to the backend chosen by `policy`
pub fn load_weights(file: &GgufFile, registry: &BackendRegistry, policy: &PlacementPolicy) -> Result<WeightSet> {
    let mut weights = WeightSet::default();
    for info in file.tensors() {
        let id = backend_for(registry, policy, &info.name)?;
        let backend = registry.backend(id)?;

        let host = HostTensor::new(file.bytes_of(info).to_vec(), info.shape(), info.dtype())?;
        let bound = backend.upload(&info.name, &host)?;
        debug!(
            tensor = %info.name,
            dtype = %info.dtype(),
            shape = ?info.shape(),
            backend = backend.name(),
            "uploaded weight"
        );
        weights.tensors.insert(info.name.clone(), bound);
    }

    for id in registry.ids() {
        let bytes = weights.bytes_on(id);
        if bytes > 0 {
            info!(backend = registry.name_of(id), bytes, "weights resident");
        }
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuConfig;
    use crate::backend::stream::StreamConfig;
    use crate::gguf::GgufBuilder;
    use crate::tensor::DType;

    fn write_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("weights.gguf");
        let embd = HostTensor::from_f32(&[0.5; 8], vec![2, 4]).unwrap();
        let ffn = HostTensor::from_f32(&[1.5; 64], vec![2, 32]).unwrap().quantize(DType::Q4_0).unwrap();
        GgufBuilder::new()
            .architecture("llama")
            .host_tensor("token_embd.weight", &embd)
            .host_tensor("blk.0.ffn_up.weight", &ffn)
            .write_to_file(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_load_follows_policy() {
        let dir = tempfile::tempdir().unwrap();
        let file = GgufFile::open(write_file(&dir)).unwrap();
        let registry =
            BackendRegistry::from_configs(&CpuConfig::default(), &[StreamConfig::named("accel")]).unwrap();
        let policy = PlacementPolicy::new().rule("blk.*", "accel");

        let weights = load_weights(&file, &registry, &policy).unwrap();
        assert_eq!(weights.len(), 2);

        let accel = registry.by_name("accel").unwrap();
        let ffn = weights.get("blk.0.ffn_up.weight").unwrap();
        assert_eq!(ffn.backend(), accel);
        assert_eq!(ffn.dtype, DType::Q4_0);
        assert_eq!(ffn.shape(), &[2, 32]);

        let embd = weights.get("token_embd.weight").unwrap();
        assert_eq!(embd.backend(), registry.default_backend().unwrap());
        assert_eq!(weights.bytes_on(accel), 36);
    }

    #[test]
    fn test_unknown_backend_in_rule() {
        let dir = tempfile::tempdir().unwrap();
        let file = GgufFile::open(write_file(&dir)).unwrap();
        let registry = BackendRegistry::cpu(CpuConfig::default()).unwrap();
        let policy = PlacementPolicy::new().with_default("gpu");
        assert!(matches!(
            load_weights(&file, &registry, &policy),
            Err(crate::Error::Sched(SchedError::UnknownBackend(_)))
        ));
    }
}
