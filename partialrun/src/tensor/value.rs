use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::{numel, Tensor, BF16, F16};

macro_rules! tensor_value_from {
    ($ty:ty, $variant:ident) => {
        impl From<Tensor<$ty>> for TensorValue {
            fn from(value: Tensor<$ty>) -> Self {
                TensorValue::$variant(value)
            }
        }
    };
}

tensor_value_from!(f32, F32);
tensor_value_from!(f64, F64);
tensor_value_from!(F16, F16);
tensor_value_from!(BF16, BF16);
tensor_value_from!(i64, I64);
tensor_value_from!(i32, I32);
tensor_value_from!(u32, U32);
tensor_value_from!(bool, Bool);

/// Supported element dtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    F16,
    BF16,
    I64,
    I32,
    U32,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn byte_width(self) -> usize {
        match self {
            DType::Bool => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }
}

/// Runtime tensor value with an enum over concrete dtypes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorValue {
    F32(Tensor<f32>),
    F64(Tensor<f64>),
    F16(Tensor<F16>),
    BF16(Tensor<BF16>),
    I64(Tensor<i64>),
    I32(Tensor<i32>),
    U32(Tensor<u32>),
    Bool(Tensor<bool>),
}

impl TensorValue {
    /// Return the dtype of this value.
    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F32(_) => DType::F32,
            TensorValue::F64(_) => DType::F64,
            TensorValue::F16(_) => DType::F16,
            TensorValue::BF16(_) => DType::BF16,
            TensorValue::I64(_) => DType::I64,
            TensorValue::I32(_) => DType::I32,
            TensorValue::U32(_) => DType::U32,
            TensorValue::Bool(_) => DType::Bool,
        }
    }

    /// Return the logical element count.
    pub fn len(&self) -> usize {
        numel(self.shape())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the tensor shape.
    pub fn shape(&self) -> &[usize] {
        match self {
            TensorValue::F32(tensor) => tensor.shape(),
            TensorValue::F64(tensor) => tensor.shape(),
            TensorValue::F16(tensor) => tensor.shape(),
            TensorValue::BF16(tensor) => tensor.shape(),
            TensorValue::I64(tensor) => tensor.shape(),
            TensorValue::I32(tensor) => tensor.shape(),
            TensorValue::U32(tensor) => tensor.shape(),
            TensorValue::Bool(tensor) => tensor.shape(),
        }
    }

    /// Size of the backing storage in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().byte_width()
    }

    /// Construct a zero-filled tensor for a dtype and shape.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let len = numel(shape);
        let zeros = |dtype| -> Result<TensorValue> {
            Ok(match dtype {
                DType::F32 => TensorValue::F32(Tensor::with_shape(vec![0.0; len], shape)?),
                DType::F64 => TensorValue::F64(Tensor::with_shape(vec![0.0; len], shape)?),
                DType::F16 => {
                    TensorValue::F16(Tensor::with_shape(vec![F16 { bits: 0 }; len], shape)?)
                }
                DType::BF16 => {
                    TensorValue::BF16(Tensor::with_shape(vec![BF16 { bits: 0 }; len], shape)?)
                }
                DType::I64 => TensorValue::I64(Tensor::with_shape(vec![0; len], shape)?),
                DType::I32 => TensorValue::I32(Tensor::with_shape(vec![0; len], shape)?),
                DType::U32 => TensorValue::U32(Tensor::with_shape(vec![0; len], shape)?),
                DType::Bool => TensorValue::Bool(Tensor::with_shape(vec![false; len], shape)?),
            })
        };
        zeros(dtype).unwrap_or_else(|err| panic!("tensor zeros failed: {}", err))
    }

    /// Clone the value, reporting allocation failure instead of aborting.
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = match self {
            TensorValue::F32(t) => t.try_clone().map(TensorValue::F32),
            TensorValue::F64(t) => t.try_clone().map(TensorValue::F64),
            TensorValue::F16(t) => t.try_clone().map(TensorValue::F16),
            TensorValue::BF16(t) => t.try_clone().map(TensorValue::BF16),
            TensorValue::I64(t) => t.try_clone().map(TensorValue::I64),
            TensorValue::I32(t) => t.try_clone().map(TensorValue::I32),
            TensorValue::U32(t) => t.try_clone().map(TensorValue::U32),
            TensorValue::Bool(t) => t.try_clone().map(TensorValue::Bool),
        };
        cloned.map_err(|err| anyhow!("failed to allocate {} bytes: {}", self.byte_len(), err))
    }

    /// Copy the contents of `src` into this value's existing storage.
    pub fn copy_from(&mut self, src: &TensorValue) -> Result<()> {
        if self.dtype() != src.dtype() || self.shape() != src.shape() {
            return Err(anyhow!(
                "cannot copy {:?}{:?} into {:?}{:?}",
                src.dtype(),
                src.shape(),
                self.dtype(),
                self.shape()
            ));
        }
        match (self, src) {
            (TensorValue::F32(dst), TensorValue::F32(src)) => dst.data.copy_from_slice(&src.data),
            (TensorValue::F64(dst), TensorValue::F64(src)) => dst.data.copy_from_slice(&src.data),
            (TensorValue::F16(dst), TensorValue::F16(src)) => dst.data.copy_from_slice(&src.data),
            (TensorValue::BF16(dst), TensorValue::BF16(src)) => {
                dst.data.copy_from_slice(&src.data)
            }
            (TensorValue::I64(dst), TensorValue::I64(src)) => dst.data.copy_from_slice(&src.data),
            (TensorValue::I32(dst), TensorValue::I32(src)) => dst.data.copy_from_slice(&src.data),
            (TensorValue::U32(dst), TensorValue::U32(src)) => dst.data.copy_from_slice(&src.data),
            (TensorValue::Bool(dst), TensorValue::Bool(src)) => {
                dst.data.copy_from_slice(&src.data)
            }
            _ => unreachable!("dtype checked above"),
        }
        Ok(())
    }

    /// Raw little-endian view of the element storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            TensorValue::F32(t) => bytemuck::cast_slice(&t.data).to_vec(),
            TensorValue::F64(t) => bytemuck::cast_slice(&t.data).to_vec(),
            TensorValue::F16(t) => bytemuck::cast_slice(&t.data).to_vec(),
            TensorValue::BF16(t) => bytemuck::cast_slice(&t.data).to_vec(),
            TensorValue::I64(t) => bytemuck::cast_slice(&t.data).to_vec(),
            TensorValue::I32(t) => bytemuck::cast_slice(&t.data).to_vec(),
            TensorValue::U32(t) => bytemuck::cast_slice(&t.data).to_vec(),
            TensorValue::Bool(t) => t.data.iter().map(|value| *value as u8).collect(),
        }
    }

    /// Borrow as an f32 tensor.
    pub fn as_f32(&self) -> Result<&Tensor<f32>> {
        match self {
            TensorValue::F32(tensor) => Ok(tensor),
            other => Err(anyhow!("expected f32 tensor, got {:?}", other.dtype())),
        }
    }

    /// Borrow as an f64 tensor.
    pub fn as_f64(&self) -> Result<&Tensor<f64>> {
        match self {
            TensorValue::F64(tensor) => Ok(tensor),
            other => Err(anyhow!("expected f64 tensor, got {:?}", other.dtype())),
        }
    }

    /// Borrow as an i64 tensor.
    pub fn as_i64(&self) -> Result<&Tensor<i64>> {
        match self {
            TensorValue::I64(tensor) => Ok(tensor),
            other => Err(anyhow!("expected i64 tensor, got {:?}", other.dtype())),
        }
    }

    /// Borrow as a u32 tensor.
    pub fn as_u32(&self) -> Result<&Tensor<u32>> {
        match self {
            TensorValue::U32(tensor) => Ok(tensor),
            other => Err(anyhow!("expected u32 tensor, got {:?}", other.dtype())),
        }
    }
}
