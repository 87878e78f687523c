//! Minimal tensor representation for the serving path
//!
//! The executor only needs contiguous buffers it can append to a batch,
//! slice per-input, and hand to the model's forward. Framework wrappers
//! behind [`crate::ModelInstance`] own the real device memory; this type
//! models the buffer identity, device placement, and view slicing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Where a tensor's memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "gpu:{}", id),
        }
    }
}

/// Tensor shape; dimension 0 is the batch dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// Elements per single input, i.e. the product of every dimension
    /// after the batch dimension
    pub fn elements_per_input(&self) -> usize {
        self.0.iter().skip(1).product()
    }

    /// Total elements across the whole shape
    pub fn num_elements(&self) -> usize {
        self.0.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// A contiguous buffer, shared by reference; slicing produces views into
/// the same allocation
#[derive(Debug, Clone)]
pub struct Tensor {
    device: Device,
    data: Arc<Vec<f32>>,
    offset: usize,
    len: usize,
}

impl Tensor {
    /// Allocate a zero-filled tensor
    pub fn zeros(len: usize, device: Device) -> Self {
        Self {
            device,
            data: Arc::new(vec![0.0; len]),
            offset: 0,
            len,
        }
    }

    /// Wrap an existing buffer
    pub fn from_vec(data: Vec<f32>, device: Device) -> Self {
        let len = data.len();
        Self {
            device,
            data: Arc::new(data),
            offset: 0,
            len,
        }
    }

    /// A view of `len` elements starting at `offset`
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        assert!(
            offset + len <= self.len,
            "slice [{}, {}) out of bounds for tensor of {} elements",
            offset,
            offset + len,
            self.len
        );
        Self {
            device: self.device,
            data: Arc::clone(&self.data),
            offset: self.offset + offset,
            len,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The underlying elements of this view
    pub fn as_slice(&self) -> &[f32] {
        &self.data[self.offset..self.offset + self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_elements() {
        let shape = Shape::new([16, 3, 224, 224]);
        assert_eq!(shape.elements_per_input(), 3 * 224 * 224);
        assert_eq!(shape.num_elements(), 16 * 3 * 224 * 224);
        assert_eq!(shape.to_string(), "[16, 3, 224, 224]");
    }

    #[test]
    fn test_tensor_slicing() {
        let tensor = Tensor::from_vec((0..10).map(|i| i as f32).collect(), Device::Cpu);
        let view = tensor.slice(4, 3);
        assert_eq!(view.as_slice(), &[4.0, 5.0, 6.0]);

        let nested = view.slice(1, 2);
        assert_eq!(nested.as_slice(), &[5.0, 6.0]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_tensor_slice_bounds() {
        let tensor = Tensor::zeros(4, Device::Gpu(0));
        let _ = tensor.slice(2, 3);
    }
}
