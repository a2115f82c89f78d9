//! Host-side tensors used for inputs, outputs and uploads

use super::quant::quantize_row;
use super::{decode_f32, DType, Layout, TensorError};

/// An owned, contiguous tensor living in host memory
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    data: Vec<u8>,
    layout: Layout,
    dtype: DType,
}

impl HostTensor {
    /// Create a new tensor from raw little-endian bytes
    pub fn new(data: Vec<u8>, shape: Vec<usize>, dtype: DType) -> Result<Self, TensorError> {
        let layout = Layout::contiguous(&shape)?;
        let numel = layout.numel();
        if dtype.is_quantized() && numel % dtype.block_size() != 0 {
            return Err(TensorError::ShapeMismatch {
                expected: numel.next_multiple_of(dtype.block_size()),
                got: numel,
            });
        }

        let expected_size = dtype.size_for_elements(numel);
        if data.len() != expected_size {
            return Err(TensorError::SizeMismatch {
                expected: expected_size,
                got: data.len(),
            });
        }

        Ok(Self { data, layout, dtype })
    }

    /// Create a tensor filled with zero bytes
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self, TensorError> {
        let numel: usize = shape.iter().product();
        Self::new(vec![0u8; dtype.size_for_elements(numel)], shape, dtype)
    }

    /// Create an F32 tensor
    pub fn from_f32(data: &[f32], shape: Vec<usize>) -> Result<Self, TensorError> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(TensorError::ShapeMismatch {
                expected: numel,
                got: data.len(),
            });
        }
        Self::new(bytemuck::cast_slice(data).to_vec(), shape, DType::F32)
    }

    /// Create an I32 tensor (row ids for `GetRows`)
    pub fn from_i32(data: &[i32], shape: Vec<usize>) -> Result<Self, TensorError> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(TensorError::ShapeMismatch {
                expected: numel,
                got: data.len(),
            });
        }
        Self::new(bytemuck::cast_slice(data).to_vec(), shape, DType::I32)
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn ndim(&self) -> usize {
        self.layout.ndim()
    }

    pub fn numel(&self) -> usize {
        self.layout.numel()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Raw packed bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Contiguous layout describing this tensor
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Decode every element to f32, dequantizing if needed
    pub fn to_f32_vec(&self) -> Result<Vec<f32>, TensorError> {
        decode_f32(self.dtype, &self.data, &self.layout)
    }

    /// Quantize a float tensor into `dtype`
    pub fn quantize(&self, dtype: DType) -> Result<Self, TensorError> {
        if !self.dtype.is_float() || !dtype.is_quantized() {
            return Err(TensorError::InvalidDType(dtype));
        }
        let values = self.to_f32_vec()?;
        let mut packed = vec![0u8; dtype.size_for_elements(values.len())];
        quantize_row(dtype, &values, &mut packed)?;
        Self::new(packed, self.shape().to_vec(), dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_tensor_zeros() {
        let t = HostTensor::zeros(vec![2, 3], DType::F32).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.ndim(), 2);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.data().len(), 24);
        assert_eq!(t.to_f32_vec().unwrap(), vec![0.0; 6]);
    }

    #[test]
    fn test_host_tensor_from_f32_shape_mismatch() {
        let result = HostTensor::from_f32(&[1.0, 2.0, 3.0], vec![2, 3]);
        match result {
            Err(TensorError::ShapeMismatch { expected, got }) => {
                assert_eq!(expected, 6);
                assert_eq!(got, 3);
            }
            _ => panic!("Expected ShapeMismatch error"),
        }
    }

    #[test]
    fn test_host_tensor_new_size_mismatch() {
        // F32 needs 24 bytes for 6 elements, but we provide 20
        let result = HostTensor::new(vec![0u8; 20], vec![2, 3], DType::F32);
        assert!(matches!(
            result,
            Err(TensorError::SizeMismatch { expected: 24, got: 20 })
        ));
    }

    #[test]
    fn test_host_tensor_rejects_partial_quant_block() {
        let result = HostTensor::zeros(vec![4, 4], DType::Q8_0);
        assert!(result.is_err());
        assert!(HostTensor::zeros(vec![4, 8], DType::Q8_0).is_ok());
    }

    #[test]
    fn test_host_tensor_rank_limits() {
        assert!(matches!(
            HostTensor::zeros(vec![1, 1, 1, 1, 1], DType::F32),
            Err(TensorError::InvalidRank(5))
        ));
        assert!(HostTensor::zeros(vec![], DType::F32).is_err());
    }

    #[test]
    fn test_host_tensor_quantize() {
        let values: Vec<f32> = (0..64).map(|i| i as f32 / 8.0).collect();
        let t = HostTensor::from_f32(&values, vec![2, 32]).unwrap();
        let q = t.quantize(DType::Q8_0).unwrap();
        assert_eq!(q.dtype(), DType::Q8_0);
        assert_eq!(q.data().len(), 68);

        let back = q.to_f32_vec().unwrap();
        for (o, d) in values.iter().zip(back.iter()) {
            assert!((o - d).abs() < 0.05, "original={}, decoded={}", o, d);
        }
    }
}
