//! GGUF file format parser and writer

mod constants;
mod error;
mod reader;
mod types;
mod writer;

pub use constants::{GgmlType, GgufMetadataValueType, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC};
pub use error::GgufError;
pub use reader::GgufReader;
pub use types::{GgufData, GgufHeader, MetadataArray, MetadataValue, TensorInfo};
pub use writer::{GgufBuilder, GgufWriter, TensorToWrite};

use crate::tensor::HostTensor;
use std::path::Path;

/// GGUF file handle with memory-mapped tensor data
pub struct GgufFile {
    pub data: GgufData,
    mmap: memmap2::Mmap,
}

impl GgufFile {
    /// Parse the directory and map the file.
    ///
    /// Every tensor's byte range is checked against the file length here, so
    /// `tensor_data` never reads past the mapping.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GgufError> {
        let file = std::fs::File::open(&path)?;
        let data = GgufReader::open(&path)?.read()?;
        // SAFETY: the mapping is read-only and lives as long as this handle.
        // Truncating the file while it is mapped is undefined behaviour, as
        // documented by memmap2.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };

        let file_len = mmap.len() as u64;
        for info in &data.tensors {
            let end = data.data_offset + info.offset + info.data_size() as u64;
            if end > file_len {
                return Err(GgufError::TensorOutOfBounds {
                    name: info.name.clone(),
                    end,
                    file_len,
                });
            }
        }

        tracing::debug!(
            path = %path.as_ref().display(),
            version = data.header.version,
            tensors = data.tensors.len(),
            "opened GGUF file"
        );
        Ok(Self { data, mmap })
    }

    pub fn tensors(&self) -> &[TensorInfo] {
        &self.data.tensors
    }

    /// Raw bytes of a tensor
    pub fn tensor_data(&self, name: &str) -> Result<&[u8], GgufError> {
        let info = self
            .data
            .get_tensor(name)
            .ok_or_else(|| GgufError::TensorNotFound(name.to_string()))?;
        Ok(self.bytes_of(info))
    }

    pub(crate) fn bytes_of(&self, info: &TensorInfo) -> &[u8] {
        let start = (self.data.data_offset + info.offset) as usize;
        &self.mmap[start..start + info.data_size()]
    }

    /// Copy a tensor out of the mapping with its row-major shape
    pub fn host_tensor(&self, name: &str) -> Result<HostTensor, GgufError> {
        let info = self
            .data
            .get_tensor(name)
            .ok_or_else(|| GgufError::TensorNotFound(name.to_string()))?;
        HostTensor::new(self.bytes_of(info).to_vec(), info.shape(), info.dtype())
            .map_err(|e| GgufError::InvalidData(format!("tensor '{}': {}", name, e)))
    }
}

impl std::fmt::Debug for GgufFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgufFile")
            .field("version", &self.data.header.version)
            .field("tensors", &self.data.tensors.len())
            .field("bytes", &self.mmap.len())
            .finish()
    }
}
