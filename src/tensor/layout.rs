//! Shape, stride and offset descriptors
//!
//! Strides are counted in elements, as in the rest of the crate. The byte
//! position of an element of a plain dtype is `offset + index * type_size`;
//! quantized tensors are always packed, so their element index maps onto a
//! block index instead.

use super::{DType, TensorError};

/// Maximum tensor rank supported by the engine
pub const MAX_DIMS: usize = 4;

/// Compute strides from shape (row-major order)
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return vec![];
    }
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len() - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Broadcast two shapes against each other.
///
/// Shapes are right-aligned; an extent of 1 pairs with any extent.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// View geometry of a tensor inside its buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Row-major contiguous layout starting at byte 0
    pub fn contiguous(shape: &[usize]) -> Result<Self, TensorError> {
        if shape.is_empty() || shape.len() > MAX_DIMS {
            return Err(TensorError::InvalidRank(shape.len()));
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            offset: 0,
        })
    }

    /// Layout with explicit strides (in elements) and byte offset
    pub fn strided(shape: &[usize], strides: &[usize], offset: usize) -> Result<Self, TensorError> {
        if shape.is_empty() || shape.len() > MAX_DIMS {
            return Err(TensorError::InvalidRank(shape.len()));
        }
        if shape.len() != strides.len() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.len(),
                got: strides.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            offset,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Byte offset of element 0 inside the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Same geometry shifted to a new byte offset
    pub fn with_offset(&self, offset: usize) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    /// Check if the layout is row-major contiguous (unit extents are ignored)
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for (&dim, &stride) in self.shape.iter().zip(self.strides.iter()).rev() {
            if dim == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }

    /// Largest element index addressed by this view
    pub fn max_index(&self) -> usize {
        self.shape
            .iter()
            .zip(self.strides.iter())
            .map(|(&d, &s)| d.saturating_sub(1) * s)
            .sum()
    }

    /// Bytes addressed by the view, counted from its offset
    pub fn byte_span(&self, dtype: DType) -> usize {
        if self.numel() == 0 {
            return 0;
        }
        dtype.size_for_elements(self.max_index() + 1)
    }

    /// Bytes a contiguous tensor with this shape would occupy
    pub fn packed_size(&self, dtype: DType) -> usize {
        dtype.size_for_elements(self.numel())
    }

    /// Verify the view fits inside a buffer of `size` bytes
    pub fn check_span(&self, dtype: DType, size: usize) -> Result<(), TensorError> {
        let span = self.byte_span(dtype);
        if self.offset + span > size {
            return Err(TensorError::SpanOutOfBounds {
                offset: self.offset,
                span,
                size,
            });
        }
        Ok(())
    }

    /// Map a row-major logical index to the element index inside the buffer
    pub fn physical_index(&self, mut linear: usize) -> usize {
        let mut index = 0;
        for (&dim, &stride) in self.shape.iter().zip(self.strides.iter()).rev() {
            if dim == 0 {
                return 0;
            }
            index += (linear % dim) * stride;
            linear /= dim;
        }
        index
    }

    /// Physical element index of every logical element, in row-major order
    pub fn physical_indices(&self) -> Vec<usize> {
        if self.is_contiguous() {
            return (0..self.numel()).collect();
        }
        (0..self.numel()).map(|i| self.physical_index(i)).collect()
    }

    /// Reinterpret a contiguous view with a new shape
    pub fn reshape(&self, shape: &[usize]) -> Result<Self, TensorError> {
        let numel: usize = shape.iter().product();
        if numel != self.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.numel(),
                got: numel,
            });
        }
        if !self.is_contiguous() {
            return Err(TensorError::NotContiguous);
        }
        Ok(Self::contiguous(shape)?.with_offset(self.offset))
    }

    /// Reorder dimensions: output dim `i` is input dim `axes[i]`
    pub fn permute(&self, axes: &[usize]) -> Result<Self, TensorError> {
        if axes.len() != self.ndim() {
            return Err(TensorError::ShapeMismatch {
                expected: self.ndim(),
                got: axes.len(),
            });
        }
        let mut seen = [false; MAX_DIMS];
        for &axis in axes {
            if axis >= self.ndim() || seen[axis] {
                return Err(TensorError::ShapeMismatch {
                    expected: self.ndim(),
                    got: axis,
                });
            }
            seen[axis] = true;
        }
        Ok(Self {
            shape: axes.iter().map(|&a| self.shape[a]).collect(),
            strides: axes.iter().map(|&a| self.strides[a]).collect(),
            offset: self.offset,
        })
    }

    /// Narrow dimension `dim` to `len` elements starting at `start`
    pub fn slice(&self, dtype: DType, dim: usize, start: usize, len: usize) -> Result<Self, TensorError> {
        let end = start.checked_add(len);
        if dim >= self.ndim() || end.map_or(true, |end| end > self.shape[dim]) {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.get(dim).copied().unwrap_or(0),
                got: end.unwrap_or(usize::MAX),
            });
        }
        let skipped = start * self.strides[dim];
        if dtype.is_quantized() && skipped % dtype.block_size() != 0 {
            return Err(TensorError::InvalidDType(dtype));
        }
        let mut shape = self.shape.clone();
        shape[dim] = len;
        Ok(Self {
            shape,
            strides: self.strides.clone(),
            offset: self.offset + dtype.size_for_elements(skipped),
        })
    }
}
