mod scalar;
mod shape;
#[allow(clippy::module_inception)]
mod tensor;
mod value;

pub use scalar::{FloatElement, BF16, F16};
pub use shape::{checked_numel, compute_strides, numel, shape_matches};
pub use tensor::{Tensor, TensorOptions};
pub use value::{DType, TensorValue};
