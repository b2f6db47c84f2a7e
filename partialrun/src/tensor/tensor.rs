//! Tensor container.
//!
//! `Tensor<T>` owns flat row-major storage with shape/stride metadata.
use anyhow::{anyhow, Result};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

use super::shape::{compute_strides, numel, offset_for};

/// Tensor construction options (shape override).
#[derive(Debug, Clone, Default)]
pub struct TensorOptions {
    /// Optional explicit shape. Defaults to a 1-D shape over the data.
    pub shape: Option<Vec<usize>>,
}

/// Owned tensor container with shape and stride metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub data: Vec<T>,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl<T> Tensor<T> {
    /// Build a 1-D tensor from a flat data vector.
    ///
    /// # Example
    /// ```no_run
    /// # use partialrun::Tensor;
    /// # fn main() -> anyhow::Result<()> {
    /// let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0])?;
    /// # Ok(()) }
    /// ```
    pub fn from_vec(data: Vec<T>) -> Result<Self> {
        Self::from_vec_with_opts(data, TensorOptions::default())
    }

    /// Build a tensor with explicit options.
    ///
    /// # Example
    /// ```no_run
    /// # use partialrun::{Tensor, TensorOptions};
    /// # fn main() -> anyhow::Result<()> {
    /// let t = Tensor::from_vec_with_opts(
    ///     vec![1.0f32, 2.0, 3.0, 4.0],
    ///     TensorOptions { shape: Some(vec![2, 2]) },
    /// )?;
    /// # Ok(()) }
    /// ```
    pub fn from_vec_with_opts(data: Vec<T>, opts: TensorOptions) -> Result<Self> {
        let shape = match opts.shape {
            Some(shape) => shape,
            None => vec![data.len()],
        };
        let expected = numel(&shape);
        if expected != data.len() {
            return Err(anyhow!(
                "tensor shape {:?} expects {} values, got {}",
                shape,
                expected,
                data.len()
            ));
        }
        let strides = compute_strides(&shape);
        Ok(Self {
            data,
            shape,
            strides,
        })
    }

    /// Shorthand for [`Tensor::from_vec_with_opts`] with an explicit shape.
    pub fn with_shape(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        Self::from_vec_with_opts(
            data,
            TensorOptions {
                shape: Some(shape.to_vec()),
            },
        )
    }

    /// Create a scalar tensor from a single value.
    pub fn from_scalar(value: T) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
            strides: Vec::new(),
        }
    }

    /// Create a 1-D tensor, panicking on invalid input.
    pub fn new(data: Vec<T>) -> Self {
        Tensor::from_vec(data).unwrap_or_else(|err| panic!("tensor creation failed: {}", err))
    }

    /// Return the raw data length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the tensor shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Return the tensor strides.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Return the logical element count.
    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    /// Access a value by multidimensional indices.
    pub fn at(&self, indices: &[usize]) -> &T {
        let offset = offset_for(&self.shape, &self.strides, indices)
            .unwrap_or_else(|err| panic!("tensor index error: {}", err));
        &self.data[offset]
    }

    /// Clone the tensor data into a vector.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.data.clone()
    }

    /// Clone with fallible allocation of the backing storage.
    pub(crate) fn try_clone(&self) -> std::result::Result<Self, std::collections::TryReserveError>
    where
        T: Clone,
    {
        let mut data = Vec::new();
        data.try_reserve_exact(self.data.len())?;
        data.extend_from_slice(&self.data);
        Ok(Self {
            data,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
        })
    }
}

impl<T> From<Vec<T>> for Tensor<T> {
    fn from(value: Vec<T>) -> Self {
        Tensor::new(value)
    }
}

impl<T: Serialize> Serialize for Tensor<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Tensor", 2)?;
        state.serialize_field("shape", &self.shape)?;
        state.serialize_field("data", &self.data)?;
        state.end()
    }
}

#[derive(Deserialize)]
struct TensorDoc<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Tensor<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let doc = TensorDoc::<T>::deserialize(deserializer)?;
        Tensor::with_shape(doc.data, &doc.shape).map_err(de::Error::custom)
    }
}
