//! GGUF file reader

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::constants::{GgmlType, GgufMetadataValueType, GGUF_MAGIC, GGUF_VERSION_V2, GGUF_VERSION_V3};
use super::error::GgufError;
use super::types::{GgufData, GgufHeader, MetadataArray, MetadataValue, TensorInfo};
use crate::tensor::DType;

const MAX_DIMS: u32 = 4;

pub struct GgufReader<R> {
    reader: R,
    version: u32,
    /// Total length of the source, bounding every declared length
    len: u64,
}

impl GgufReader<BufReader<File>> {
    /// Open a GGUF file from a path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GgufError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> GgufReader<R> {
    /// Validate the magic and version of any Read + Seek source
    pub fn new(mut reader: R) -> Result<Self, GgufError> {
        let magic = u32::from_le_bytes(read_array(&mut reader)?);
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidMagic(magic));
        }

        let version = u32::from_le_bytes(read_array(&mut reader)?);
        if version != GGUF_VERSION_V2 && version != GGUF_VERSION_V3 {
            return Err(GgufError::UnsupportedVersion(version));
        }

        let position = reader.stream_position()?;
        let len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(position))?;
        Ok(Self { reader, version, len })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Parse the header, metadata and tensor directory
    pub fn read(mut self) -> Result<GgufData, GgufError> {
        let tensor_count = self.read_u64()?;
        let metadata_kv_count = self.read_u64()?;
        let header = GgufHeader {
            version: self.version,
            tensor_count,
            metadata_kv_count,
        };

        let mut metadata = HashMap::new();
        for _ in 0..metadata_kv_count {
            let key = self.read_string()?;
            let value_type = self.read_value_type()?;
            let value = self.read_value(value_type)?;
            metadata.insert(key, value);
        }

        let mut tensors = Vec::new();
        for _ in 0..tensor_count {
            tensors.push(self.read_tensor_info()?);
        }

        let mut data = GgufData {
            header,
            metadata,
            tensors,
            data_offset: 0,
        };
        let alignment = data.alignment();
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(GgufError::InvalidData(format!("alignment {} is not a power of two", alignment)));
        }
        if let Some(t) = data.tensors.iter().find(|t| t.offset % alignment as u64 != 0) {
            return Err(GgufError::InvalidData(format!(
                "tensor '{}' offset {} is not aligned to {}",
                t.name, t.offset, alignment
            )));
        }

        data.data_offset = align_offset(self.reader.stream_position()?, alignment);
        Ok(data)
    }

    fn read_u32(&mut self) -> Result<u32, GgufError> {
        Ok(u32::from_le_bytes(read_array(&mut self.reader)?))
    }

    fn read_u64(&mut self) -> Result<u64, GgufError> {
        Ok(u64::from_le_bytes(read_array(&mut self.reader)?))
    }

    /// Read a count of items taking at least `item_size` bytes each.
    ///
    /// A count that cannot fit in the rest of the source is a truncated file
    /// and is rejected before anything is allocated for it.
    fn read_length(&mut self, item_size: u64) -> Result<usize, GgufError> {
        let count = self.read_u64()?;
        let remaining = self.len.saturating_sub(self.reader.stream_position()?);
        if count.saturating_mul(item_size) > remaining {
            return Err(GgufError::UnexpectedEof);
        }
        usize::try_from(count)
            .map_err(|_| GgufError::InvalidData(format!("length {} does not fit in memory", count)))
    }

    fn read_string(&mut self) -> Result<String, GgufError> {
        let len = self.read_length(1)?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).map_err(eof)?;
        String::from_utf8(buf).map_err(|_| GgufError::InvalidUtf8)
    }

    fn read_value_type(&mut self) -> Result<GgufMetadataValueType, GgufError> {
        let id = self.read_u32()?;
        GgufMetadataValueType::try_from(id).map_err(GgufError::InvalidMetadataType)
    }

    fn read_value(&mut self, value_type: GgufMetadataValueType) -> Result<MetadataValue, GgufError> {
        Ok(match value_type {
            GgufMetadataValueType::Uint8 => MetadataValue::Uint8(u8::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::Int8 => MetadataValue::Int8(i8::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::Uint16 => MetadataValue::Uint16(u16::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::Int16 => MetadataValue::Int16(i16::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::Uint32 => MetadataValue::Uint32(u32::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::Int32 => MetadataValue::Int32(i32::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::Float32 => MetadataValue::Float32(f32::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::Bool => MetadataValue::Bool(u8::from_le_bytes(read_array(&mut self.reader)?) != 0),
            GgufMetadataValueType::Uint64 => MetadataValue::Uint64(u64::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::Int64 => MetadataValue::Int64(i64::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::Float64 => MetadataValue::Float64(f64::from_le_bytes(read_array(&mut self.reader)?)),
            GgufMetadataValueType::String => MetadataValue::String(self.read_string()?),
            GgufMetadataValueType::Array => {
                let element_type = self.read_value_type()?;
                let len = self.read_length(encoded_size(element_type))?;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(self.read_value(element_type)?);
                }
                MetadataValue::Array(MetadataArray::new(element_type, values))
            }
        })
    }

    fn read_tensor_info(&mut self) -> Result<TensorInfo, GgufError> {
        let name = self.read_string()?;

        let n_dims = self.read_u32()?;
        if n_dims == 0 || n_dims > MAX_DIMS {
            return Err(GgufError::InvalidData(format!("tensor '{}' has {} dimensions", name, n_dims)));
        }
        let mut dims = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            dims.push(self.read_u64()?);
        }

        let type_id = self.read_u32()?;
        let ggml_type = GgmlType::try_from(type_id).map_err(GgufError::InvalidTensorType)?;

        // Quantized rows must hold whole blocks
        let block = DType::from(ggml_type).block_size() as u64;
        if dims[0] % block != 0 {
            return Err(GgufError::InvalidData(format!(
                "tensor '{}' row length {} is not a multiple of {}",
                name, dims[0], block
            )));
        }

        let offset = self.read_u64()?;
        Ok(TensorInfo {
            name,
            dims,
            ggml_type,
            offset,
        })
    }
}

/// Fewest bytes one value of `value_type` occupies
fn encoded_size(value_type: GgufMetadataValueType) -> u64 {
    match value_type {
        GgufMetadataValueType::Uint8 | GgufMetadataValueType::Int8 | GgufMetadataValueType::Bool => 1,
        GgufMetadataValueType::Uint16 | GgufMetadataValueType::Int16 => 2,
        GgufMetadataValueType::Uint32 | GgufMetadataValueType::Int32 | GgufMetadataValueType::Float32 => 4,
        GgufMetadataValueType::Uint64
        | GgufMetadataValueType::Int64
        | GgufMetadataValueType::Float64
        | GgufMetadataValueType::String => 8,
        // element type tag and count
        GgufMetadataValueType::Array => 12,
    }
}

fn eof(e: std::io::Error) -> GgufError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        GgufError::UnexpectedEof
    } else {
        GgufError::Io(e)
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N], GgufError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(eof)?;
    Ok(buf)
}

/// Round `offset` up to a multiple of `alignment`
pub(crate) fn align_offset(offset: u64, alignment: usize) -> u64 {
    let alignment = alignment as u64;
    offset.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header(version: u32, tensors: u64, kvs: u64) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        data.extend_from_slice(&version.to_le_bytes());
        data.extend_from_slice(&tensors.to_le_bytes());
        data.extend_from_slice(&kvs.to_le_bytes());
        data
    }

    fn push_string(data: &mut Vec<u8>, s: &str) {
        data.extend_from_slice(&(s.len() as u64).to_le_bytes());
        data.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn test_align_offset() {
        assert_eq!(align_offset(0, 32), 0);
        assert_eq!(align_offset(1, 32), 32);
        assert_eq!(align_offset(32, 32), 32);
        assert_eq!(align_offset(33, 32), 64);
        assert_eq!(align_offset(100, 32), 128);
    }

    #[test]
    fn test_invalid_magic() {
        let bad_data = vec![0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00];
        let result = GgufReader::new(Cursor::new(bad_data));
        assert!(matches!(result, Err(GgufError::InvalidMagic(0))));
    }

    #[test]
    fn test_unsupported_version() {
        for version in [1u32, 99] {
            let result = GgufReader::new(Cursor::new(header(version, 0, 0)));
            assert!(matches!(result, Err(GgufError::UnsupportedVersion(v)) if v == version));
        }
    }

    #[test]
    fn test_truncated_file() {
        let mut data = header(3, 0, 1);
        push_string(&mut data, "general.name");
        let err = GgufReader::new(Cursor::new(data)).unwrap().read().unwrap_err();
        assert!(matches!(err, GgufError::UnexpectedEof));
    }

    #[test]
    fn test_metadata_and_directory() {
        let mut data = header(2, 1, 2);
        push_string(&mut data, "general.architecture");
        data.extend_from_slice(&(GgufMetadataValueType::String as u32).to_le_bytes());
        push_string(&mut data, "llama");
        push_string(&mut data, "tokenizer.scores");
        data.extend_from_slice(&(GgufMetadataValueType::Array as u32).to_le_bytes());
        data.extend_from_slice(&(GgufMetadataValueType::Float32 as u32).to_le_bytes());
        data.extend_from_slice(&2u64.to_le_bytes());
        data.extend_from_slice(&0.5f32.to_le_bytes());
        data.extend_from_slice(&(-1.0f32).to_le_bytes());

        push_string(&mut data, "token_embd.weight");
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&8u64.to_le_bytes());
        data.extend_from_slice(&2u64.to_le_bytes());
        data.extend_from_slice(&(GgmlType::F16 as u32).to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        let directory_end = data.len() as u64;

        let parsed = GgufReader::new(Cursor::new(data)).unwrap().read().unwrap();
        assert_eq!(parsed.header.version, 2);
        assert_eq!(parsed.get_string("general.architecture"), Some("llama"));
        match parsed.get_metadata("tokenizer.scores") {
            Some(MetadataValue::Array(arr)) => {
                assert_eq!(arr.element_type, GgufMetadataValueType::Float32);
                assert_eq!(arr.values, vec![MetadataValue::Float32(0.5), MetadataValue::Float32(-1.0)]);
            }
            other => panic!("unexpected value {:?}", other),
        }

        let info = parsed.get_tensor("token_embd.weight").unwrap();
        assert_eq!(info.shape(), vec![2, 8]);
        assert_eq!(info.data_size(), 32);
        assert_eq!(parsed.data_offset, align_offset(directory_end, 32));
    }

    #[test]
    fn test_declared_lengths_bounded_by_file() {
        let mut data = header(3, 0, 1);
        data.extend_from_slice(&u64::MAX.to_le_bytes());
        data.extend_from_slice(b"general");
        let err = GgufReader::new(Cursor::new(data)).unwrap().read().unwrap_err();
        assert!(matches!(err, GgufError::UnexpectedEof));

        // 1000 declared u32 values with 8 bytes behind them
        let mut data = header(3, 0, 1);
        push_string(&mut data, "tokenizer.ids");
        data.extend_from_slice(&(GgufMetadataValueType::Array as u32).to_le_bytes());
        data.extend_from_slice(&(GgufMetadataValueType::Uint32 as u32).to_le_bytes());
        data.extend_from_slice(&1000u64.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        let err = GgufReader::new(Cursor::new(data)).unwrap().read().unwrap_err();
        assert!(matches!(err, GgufError::UnexpectedEof));
    }

    #[test]
    fn test_unknown_tensor_type() {
        let mut data = header(3, 1, 0);
        push_string(&mut data, "w");
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&256u64.to_le_bytes());
        data.extend_from_slice(&12u32.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        let err = GgufReader::new(Cursor::new(data)).unwrap().read().unwrap_err();
        assert!(matches!(err, GgufError::InvalidTensorType(12)));
    }

    #[test]
    fn test_partial_quant_row_rejected() {
        let mut data = header(3, 1, 0);
        push_string(&mut data, "w");
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&40u64.to_le_bytes());
        data.extend_from_slice(&(GgmlType::Q4_0 as u32).to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        let err = GgufReader::new(Cursor::new(data)).unwrap().read().unwrap_err();
        assert!(matches!(err, GgufError::InvalidData(_)));
    }
}
