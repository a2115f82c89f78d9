//! Parsed GGUF structures

use std::collections::HashMap;

use super::constants::{GgmlType, GgufMetadataValueType, GGUF_DEFAULT_ALIGNMENT};
use crate::tensor::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// A typed metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Array(MetadataArray),
    Uint64(u64),
    Int64(i64),
    Float64(f64),
}

impl MetadataValue {
    pub fn value_type(&self) -> GgufMetadataValueType {
        match self {
            Self::Uint8(_) => GgufMetadataValueType::Uint8,
            Self::Int8(_) => GgufMetadataValueType::Int8,
            Self::Uint16(_) => GgufMetadataValueType::Uint16,
            Self::Int16(_) => GgufMetadataValueType::Int16,
            Self::Uint32(_) => GgufMetadataValueType::Uint32,
            Self::Int32(_) => GgufMetadataValueType::Int32,
            Self::Float32(_) => GgufMetadataValueType::Float32,
            Self::Bool(_) => GgufMetadataValueType::Bool,
            Self::String(_) => GgufMetadataValueType::String,
            Self::Array(_) => GgufMetadataValueType::Array,
            Self::Uint64(_) => GgufMetadataValueType::Uint64,
            Self::Int64(_) => GgufMetadataValueType::Int64,
            Self::Float64(_) => GgufMetadataValueType::Float64,
        }
    }

    /// Unsigned integer value of any width
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Uint8(v) => Some(v as u64),
            Self::Uint16(v) => Some(v as u64),
            Self::Uint32(v) => Some(v as u64),
            Self::Uint64(v) => Some(v),
            Self::Int32(v) if v >= 0 => Some(v as u64),
            Self::Int64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::Float32(v) => Some(v),
            Self::Float64(v) => Some(v as f32),
            _ => None,
        }
    }
}

/// Homogeneous metadata array
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataArray {
    pub element_type: GgufMetadataValueType,
    pub values: Vec<MetadataValue>,
}

impl MetadataArray {
    pub fn new(element_type: GgufMetadataValueType, values: Vec<MetadataValue>) -> Self {
        Self { element_type, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One entry of the tensor directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    /// Dimensions in ggml order, innermost first
    pub dims: Vec<u64>,
    pub ggml_type: GgmlType,
    /// Offset from the start of the data section
    pub offset: u64,
}

impl TensorInfo {
    /// Row-major shape, outermost first
    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().rev().map(|&d| d as usize).collect()
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    pub fn dtype(&self) -> DType {
        self.ggml_type.into()
    }

    /// Size of the tensor data in bytes
    pub fn data_size(&self) -> usize {
        self.dtype().size_for_elements(self.numel())
    }
}

/// Everything in a GGUF file except the tensor bytes
#[derive(Debug, Clone)]
pub struct GgufData {
    pub header: GgufHeader,
    pub metadata: HashMap<String, MetadataValue>,
    pub tensors: Vec<TensorInfo>,
    /// Absolute file offset of the data section
    pub data_offset: u64,
}

impl GgufData {
    pub fn get_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn get_metadata(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get_metadata(key)?.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get_metadata(key)?.as_str()
    }

    pub fn alignment(&self) -> usize {
        self.get_metadata("general.alignment")
            .and_then(MetadataValue::as_u64)
            .map_or(GGUF_DEFAULT_ALIGNMENT, |a| a as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_info_shape_is_reversed() {
        let info = TensorInfo {
            name: "blk.0.ffn_up.weight".into(),
            dims: vec![64, 3],
            ggml_type: GgmlType::Q8_0,
            offset: 0,
        };
        assert_eq!(info.shape(), vec![3, 64]);
        assert_eq!(info.numel(), 192);
        // 6 blocks of 34 bytes
        assert_eq!(info.data_size(), 204);
    }

    #[test]
    fn test_metadata_accessors() {
        assert_eq!(MetadataValue::Uint8(7).as_u64(), Some(7));
        assert_eq!(MetadataValue::Int32(-1).as_u64(), None);
        assert_eq!(MetadataValue::String("llama".into()).as_str(), Some("llama"));
        assert_eq!(MetadataValue::Float64(0.5).as_f32(), Some(0.5));
    }
}
