//! GGUF file writer
//!
//! Used to export weight sets and to produce fixtures for tests and benches.
//! Metadata keys are written sorted so output is deterministic.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::constants::{GgmlType, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_V2, GGUF_VERSION_V3};
use super::reader::align_offset;
use super::types::{MetadataArray, MetadataValue};
use super::GgufError;
use crate::tensor::{DType, HostTensor};

/// A tensor queued for writing
#[derive(Debug, Clone)]
pub struct TensorToWrite {
    pub name: String,
    /// Dimensions in ggml order, innermost first
    pub dims: Vec<u64>,
    pub dtype: GgmlType,
    pub data: Vec<u8>,
}

impl TensorToWrite {
    pub fn new(name: impl Into<String>, dims: Vec<u64>, dtype: GgmlType, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dims,
            dtype,
            data,
        }
    }

    /// Take the bytes and row-major shape of a host tensor
    pub fn from_host(name: impl Into<String>, tensor: &HostTensor) -> Self {
        Self::new(
            name,
            tensor.shape().iter().rev().map(|&d| d as u64).collect(),
            tensor.dtype().into(),
            tensor.data().to_vec(),
        )
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    fn check(&self) -> Result<(), GgufError> {
        let expected = DType::from(self.dtype).size_for_elements(self.num_elements());
        if self.data.len() != expected {
            return Err(GgufError::InvalidData(format!(
                "tensor '{}' has {} bytes, expected {}",
                self.name,
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }
}

pub struct GgufWriter<W: Write> {
    writer: BufWriter<W>,
    position: u64,
    version: u32,
    alignment: usize,
    metadata: BTreeMap<String, MetadataValue>,
    tensors: Vec<TensorToWrite>,
}

impl GgufWriter<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, GgufError> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write> GgufWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            position: 0,
            version: GGUF_VERSION_V3,
            alignment: GGUF_DEFAULT_ALIGNMENT,
            metadata: BTreeMap::new(),
            tensors: Vec::new(),
        }
    }

    /// Set GGUF version (2 or 3)
    pub fn set_version(&mut self, version: u32) -> &mut Self {
        self.version = version;
        self
    }

    /// Set data alignment, recorded as `general.alignment` when not the default
    pub fn set_alignment(&mut self, alignment: usize) -> &mut Self {
        self.alignment = alignment;
        self
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: MetadataValue) -> &mut Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.add_metadata(key, MetadataValue::String(value.into()))
    }

    pub fn add_u32(&mut self, key: impl Into<String>, value: u32) -> &mut Self {
        self.add_metadata(key, MetadataValue::Uint32(value))
    }

    pub fn add_f32(&mut self, key: impl Into<String>, value: f32) -> &mut Self {
        self.add_metadata(key, MetadataValue::Float32(value))
    }

    pub fn add_tensor(&mut self, tensor: TensorToWrite) -> &mut Self {
        self.tensors.push(tensor);
        self
    }

    /// Write header, metadata, tensor directory and data
    pub fn write(mut self) -> Result<(), GgufError> {
        if self.version != GGUF_VERSION_V2 && self.version != GGUF_VERSION_V3 {
            return Err(GgufError::UnsupportedVersion(self.version));
        }
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(GgufError::InvalidData(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        for tensor in &self.tensors {
            tensor.check()?;
        }
        if self.alignment != GGUF_DEFAULT_ALIGNMENT {
            self.metadata
                .insert("general.alignment".into(), MetadataValue::Uint32(self.alignment as u32));
        }

        let metadata = std::mem::take(&mut self.metadata);
        let tensors = std::mem::take(&mut self.tensors);

        self.put(&GGUF_MAGIC.to_le_bytes())?;
        self.put(&self.version.to_le_bytes())?;
        self.put(&(tensors.len() as u64).to_le_bytes())?;
        self.put(&(metadata.len() as u64).to_le_bytes())?;

        for (key, value) in &metadata {
            self.write_string(key)?;
            self.put(&(value.value_type() as u32).to_le_bytes())?;
            self.write_value(value)?;
        }

        let mut offset = 0u64;
        for tensor in &tensors {
            self.write_string(&tensor.name)?;
            self.put(&(tensor.dims.len() as u32).to_le_bytes())?;
            for dim in &tensor.dims {
                self.put(&dim.to_le_bytes())?;
            }
            self.put(&(tensor.dtype as u32).to_le_bytes())?;
            self.put(&offset.to_le_bytes())?;
            offset = align_offset(offset + tensor.data.len() as u64, self.alignment);
        }

        self.pad()?;
        for tensor in &tensors {
            self.put(&tensor.data)?;
            self.pad()?;
        }

        self.writer.flush()?;
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), GgufError> {
        self.writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn pad(&mut self) -> Result<(), GgufError> {
        let padding = align_offset(self.position, self.alignment) - self.position;
        self.put(&vec![0u8; padding as usize])
    }

    fn write_string(&mut self, s: &str) -> Result<(), GgufError> {
        self.put(&(s.len() as u64).to_le_bytes())?;
        self.put(s.as_bytes())
    }

    /// Value payload without its type tag
    fn write_value(&mut self, value: &MetadataValue) -> Result<(), GgufError> {
        match value {
            MetadataValue::Uint8(v) => self.put(&[*v]),
            MetadataValue::Int8(v) => self.put(&v.to_le_bytes()),
            MetadataValue::Uint16(v) => self.put(&v.to_le_bytes()),
            MetadataValue::Int16(v) => self.put(&v.to_le_bytes()),
            MetadataValue::Uint32(v) => self.put(&v.to_le_bytes()),
            MetadataValue::Int32(v) => self.put(&v.to_le_bytes()),
            MetadataValue::Uint64(v) => self.put(&v.to_le_bytes()),
            MetadataValue::Int64(v) => self.put(&v.to_le_bytes()),
            MetadataValue::Float32(v) => self.put(&v.to_le_bytes()),
            MetadataValue::Float64(v) => self.put(&v.to_le_bytes()),
            MetadataValue::Bool(v) => self.put(&[*v as u8]),
            MetadataValue::String(v) => self.write_string(v),
            MetadataValue::Array(arr) => self.write_array(arr),
        }
    }

    fn write_array(&mut self, arr: &MetadataArray) -> Result<(), GgufError> {
        if let Some(bad) = arr.values.iter().find(|v| v.value_type() != arr.element_type) {
            return Err(GgufError::InvalidData(format!(
                "array of {:?} holds a {:?}",
                arr.element_type,
                bad.value_type()
            )));
        }
        self.put(&(arr.element_type as u32).to_le_bytes())?;
        self.put(&(arr.values.len() as u64).to_le_bytes())?;
        arr.values.iter().try_for_each(|v| self.write_value(v))
    }
}

/// Owned counterpart of [`GgufWriter`] for one-shot file creation
#[derive(Debug, Default)]
pub struct GgufBuilder {
    version: Option<u32>,
    alignment: Option<usize>,
    metadata: BTreeMap<String, MetadataValue>,
    tensors: Vec<TensorToWrite>,
}

impl GgufBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    pub fn architecture(self, arch: &str) -> Self {
        self.metadata("general.architecture", MetadataValue::String(arch.to_string()))
    }

    pub fn metadata(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn tensor(mut self, tensor: TensorToWrite) -> Self {
        self.tensors.push(tensor);
        self
    }

    /// Queue a host tensor under `name`
    pub fn host_tensor(self, name: &str, tensor: &HostTensor) -> Self {
        self.tensor(TensorToWrite::from_host(name, tensor))
    }

    pub fn write_to<W: Write>(self, sink: W) -> Result<(), GgufError> {
        let mut writer = GgufWriter::new(sink);
        if let Some(version) = self.version {
            writer.set_version(version);
        }
        if let Some(alignment) = self.alignment {
            writer.set_alignment(alignment);
        }
        for (key, value) in self.metadata {
            writer.add_metadata(key, value);
        }
        for tensor in self.tensors {
            writer.add_tensor(tensor);
        }
        writer.write()
    }

    pub fn write_to_file<P: AsRef<Path>>(self, path: P) -> Result<(), GgufError> {
        self.write_to(File::create(path)?)
    }
}
