//! Tensor data types and operations
//!
//! This module provides the dense `f32` tensor exchanged between clients and
//! the orchestrator, along with the handful of operations the descriptor and
//! parameter code needs (stacking samples into a batch, averaging across the
//! batch axis, flattening).

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ModelError;

/// Shape of a tensor as a vector of dimensions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    /// Dimensions of the tensor
    dims: Vec<usize>,
}

impl TensorShape {
    /// Creates a new tensor shape from dimensions
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Returns the dimensions as a slice
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the number of dimensions (rank)
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns the total number of elements
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Creates a shape for a 1D tensor
    pub fn d1(dim: usize) -> Self {
        Self::new(vec![dim])
    }

    /// Creates a shape for a 3D tensor
    pub fn d3(dim0: usize, dim1: usize, dim2: usize) -> Self {
        Self::new(vec![dim0, dim1, dim2])
    }

    /// Shape with a leading batch dimension prepended
    pub fn batched(&self, batch: usize) -> Self {
        let mut dims = Vec::with_capacity(self.dims.len() + 1);
        dims.push(batch);
        dims.extend_from_slice(&self.dims);
        Self::new(dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl From<&[usize]> for TensorShape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

/// Dense row-major `f32` tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Data values in row-major order
    data: Vec<f32>,
    /// Shape of the tensor
    shape: TensorShape,
}

impl Tensor {
    /// Creates a tensor, checking that the data fills the shape exactly
    pub fn new(data: Vec<f32>, shape: impl Into<TensorShape>) -> Result<Self, ModelError> {
        let shape = shape.into();
        if data.len() != shape.num_elements() {
            return Err(ModelError::InvalidTensor {
                reason: format!(
                    "{} values cannot fill shape {shape} ({} elements)",
                    data.len(),
                    shape.num_elements()
                ),
            });
        }
        Ok(Self { data, shape })
    }

    /// Creates a 1D tensor from a vector
    pub fn from_vec(data: Vec<f32>) -> Self {
        let shape = TensorShape::d1(data.len());
        Self { data, shape }
    }

    /// Creates a tensor filled with zeros
    pub fn zeros(shape: impl Into<TensorShape>) -> Self {
        let shape = shape.into();
        Self {
            data: vec![0.0; shape.num_elements()],
            shape,
        }
    }

    /// Creates a 1D tensor of `len` values drawn uniformly from `[0, 1)`
    pub fn random_uniform<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Self {
        let data = (0..len).map(|_| rng.gen::<f32>()).collect();
        Self::from_vec(data)
    }

    /// Returns the shape of the tensor
    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    /// Returns the data as a slice
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consumes the tensor and returns its data
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Returns the number of elements in the tensor
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the tensor has no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the same data under a new shape
    pub fn reshape(self, shape: impl Into<TensorShape>) -> Result<Self, ModelError> {
        Self::new(self.data, shape)
    }

    /// Views the tensor as an ndarray
    pub fn view(&self) -> Result<ArrayViewD<'_, f32>, ModelError> {
        ArrayViewD::from_shape(IxDyn(self.shape.dims()), &self.data).map_err(|e| {
            ModelError::InvalidTensor {
                reason: format!("{} values under shape {}: {e}", self.data.len(), self.shape),
            }
        })
    }

    /// Copies the tensor into an owned ndarray
    pub fn to_array(&self) -> Result<ArrayD<f32>, ModelError> {
        Ok(self.view()?.to_owned())
    }

    /// Stacks equally-shaped samples along a new leading batch axis
    pub fn stack(samples: &[Tensor]) -> Result<Self, ModelError> {
        let first = samples.first().ok_or_else(|| ModelError::InvalidTensor {
            reason: "cannot stack an empty list of tensors".to_string(),
        })?;
        let mut data = Vec::with_capacity(first.len() * samples.len());
        for (i, sample) in samples.iter().enumerate() {
            if sample.shape != first.shape {
                return Err(ModelError::ShapeMismatch {
                    layer: format!("sample {i}"),
                    expected: first.shape.dims().to_vec(),
                    actual: sample.shape.dims().to_vec(),
                });
            }
            data.extend_from_slice(&sample.data);
        }
        Ok(Self {
            data,
            shape: first.shape.batched(samples.len()),
        })
    }

    /// Averages across the leading (batch) axis
    pub fn mean_rows(&self) -> Result<Self, ModelError> {
        if self.shape.rank() == 0 || self.shape.dims()[0] == 0 {
            return Err(ModelError::InvalidTensor {
                reason: format!("cannot average rows of shape {}", self.shape),
            });
        }
        let mean = self
            .view()?
            .mean_axis(Axis(0))
            .ok_or_else(|| ModelError::InvalidTensor {
                reason: "empty batch axis".to_string(),
            })?;
        Ok(mean.into())
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor<f32>({}, {} elements)", self.shape, self.len())
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(array: ArrayD<f32>) -> Self {
        let shape = TensorShape::new(array.shape().to_vec());
        let data = if array.is_standard_layout() {
            array.into_raw_vec()
        } else {
            array.iter().copied().collect()
        };
        Self { data, shape }
    }
}
