//! Float kernels used to build forward/backward graphs.
//!
//! Every kernel is generic over [`FloatElement`] and dispatched over the
//! closed set of float `TensorValue` variants.
use anyhow::Result;
use rayon::prelude::*;

use crate::graph::{OpAttrs, OpKind};
use crate::tensor::{FloatElement, Tensor, TensorValue};

use super::{expect_inputs, host_kernel, invalid, HostKernel};

macro_rules! float_unary {
    ($op:expr, $value:expr, |$x:ident| $body:expr) => {
        match $value {
            TensorValue::F32($x) => TensorValue::from($body?),
            TensorValue::F64($x) => TensorValue::from($body?),
            TensorValue::F16($x) => TensorValue::from($body?),
            TensorValue::BF16($x) => TensorValue::from($body?),
            other => {
                return Err(invalid(format!(
                    "{} expects a float tensor, got {:?}",
                    $op,
                    other.dtype()
                )))
            }
        }
    };
}

macro_rules! float_binary {
    ($op:expr, $a:expr, $b:expr, |$x:ident, $y:ident| $body:expr) => {
        match ($a, $b) {
            (TensorValue::F32($x), TensorValue::F32($y)) => TensorValue::from($body?),
            (TensorValue::F64($x), TensorValue::F64($y)) => TensorValue::from($body?),
            (TensorValue::F16($x), TensorValue::F16($y)) => TensorValue::from($body?),
            (TensorValue::BF16($x), TensorValue::BF16($y)) => TensorValue::from($body?),
            (a, b) => {
                return Err(invalid(format!(
                    "{} expects matching float tensors, got {:?} and {:?}",
                    $op,
                    a.dtype(),
                    b.dtype()
                )))
            }
        }
    };
}

fn map<T: FloatElement>(x: &Tensor<T>, f: impl Fn(f64) -> f64) -> Result<Tensor<T>> {
    let data = x
        .data
        .iter()
        .map(|value| T::from_f64(f(value.to_f64())))
        .collect();
    Tensor::with_shape(data, x.shape())
}

fn zip<T: FloatElement>(
    op: &str,
    a: &Tensor<T>,
    b: &Tensor<T>,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor<T>> {
    if a.shape() != b.shape() {
        return Err(invalid(format!(
            "{} shape mismatch: {:?} vs {:?}",
            op,
            a.shape(),
            b.shape()
        )));
    }
    let data = a
        .data
        .iter()
        .zip(b.data.iter())
        .map(|(x, y)| T::from_f64(f(x.to_f64(), y.to_f64())))
        .collect();
    Tensor::with_shape(data, a.shape())
}

fn dims2<T>(op: &str, x: &Tensor<T>) -> Result<(usize, usize)> {
    match x.shape() {
        [rows, cols] => Ok((*rows, *cols)),
        other => Err(invalid(format!("{} expects a 2-D tensor, got {:?}", op, other))),
    }
}

/// `[m, k] x [k, n] -> [m, n]`, rows computed in parallel.
pub fn matmul<T: FloatElement>(a: &Tensor<T>, b: &Tensor<T>) -> Result<Tensor<T>> {
    let (m, k) = dims2("matmul", a)?;
    let (k2, n) = dims2("matmul", b)?;
    if k != k2 {
        return Err(invalid(format!(
            "matmul inner dims differ: [{}x{}] x [{}x{}]",
            m, k, k2, n
        )));
    }
    let mut out = vec![T::from_f64(0.0); m * n];
    if n > 0 {
        out.par_chunks_mut(n).enumerate().for_each(|(row, dst)| {
            for (col, slot) in dst.iter_mut().enumerate() {
                let mut acc = 0.0f64;
                for inner in 0..k {
                    acc += a.data[row * k + inner].to_f64() * b.data[inner * n + col].to_f64();
                }
                *slot = T::from_f64(acc);
            }
        });
    }
    Tensor::with_shape(out, &[m, n])
}

pub fn transpose<T: FloatElement>(x: &Tensor<T>) -> Result<Tensor<T>> {
    let (rows, cols) = dims2("transpose", x)?;
    let mut out = Vec::with_capacity(rows * cols);
    for col in 0..cols {
        for row in 0..rows {
            out.push(x.data[row * cols + col]);
        }
    }
    Tensor::with_shape(out, &[cols, rows])
}

/// Column sums of a 2-D tensor.
pub fn reduce_sum_rows<T: FloatElement>(x: &Tensor<T>) -> Result<Tensor<T>> {
    let (rows, cols) = dims2("reduce_sum_rows", x)?;
    let mut acc = vec![0.0f64; cols];
    for row in 0..rows {
        for (col, slot) in acc.iter_mut().enumerate() {
            *slot += x.data[row * cols + col].to_f64();
        }
    }
    Tensor::with_shape(acc.into_iter().map(T::from_f64).collect(), &[cols])
}

fn identity_kernel(_: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("identity", inputs, 1)?;
    Ok(vec![inputs[0].try_clone()?])
}

fn add_kernel(_: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("add", inputs, 2)?;
    let out = float_binary!("add", inputs[0], inputs[1], |a, b| zip("add", a, b, |x, y| x + y));
    Ok(vec![out])
}

fn sub_kernel(_: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("sub", inputs, 2)?;
    let out = float_binary!("sub", inputs[0], inputs[1], |a, b| zip("sub", a, b, |x, y| x - y));
    Ok(vec![out])
}

fn mul_kernel(_: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("mul", inputs, 2)?;
    let out = float_binary!("mul", inputs[0], inputs[1], |a, b| zip("mul", a, b, |x, y| x * y));
    Ok(vec![out])
}

fn scale_kernel(attrs: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("scale", inputs, 1)?;
    let alpha = attrs.float("alpha")?.unwrap_or(1.0);
    let out = float_unary!("scale", inputs[0], |x| map(x, |v| v * alpha));
    Ok(vec![out])
}

fn relu_kernel(_: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("relu", inputs, 1)?;
    let out = float_unary!("relu", inputs[0], |x| map(x, |v| if v > 0.0 { v } else { 0.0 }));
    Ok(vec![out])
}

/// Inputs `(dy, x)`: passes `dy` where `x > 0`.
fn relu_grad_kernel(_: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("relu_grad", inputs, 2)?;
    let out = float_binary!("relu_grad", inputs[0], inputs[1], |dy, x| zip(
        "relu_grad",
        dy,
        x,
        |g, v| if v > 0.0 { g } else { 0.0 }
    ));
    Ok(vec![out])
}

fn matmul_kernel(_: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("matmul", inputs, 2)?;
    let out = float_binary!("matmul", inputs[0], inputs[1], |a, b| matmul(a, b));
    Ok(vec![out])
}

fn transpose_kernel(_: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("transpose", inputs, 1)?;
    let out = float_unary!("transpose", inputs[0], |x| transpose(x));
    Ok(vec![out])
}

fn reduce_sum_rows_kernel(_: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("reduce_sum_rows", inputs, 1)?;
    let out = float_unary!("reduce_sum_rows", inputs[0], |x| reduce_sum_rows(x));
    Ok(vec![out])
}

pub(crate) fn entries() -> Vec<(OpKind, HostKernel)> {
    vec![
        (OpKind::Identity, host_kernel(identity_kernel)),
        (OpKind::Add, host_kernel(add_kernel)),
        (OpKind::Sub, host_kernel(sub_kernel)),
        (OpKind::Mul, host_kernel(mul_kernel)),
        (OpKind::Scale, host_kernel(scale_kernel)),
        (OpKind::Relu, host_kernel(relu_kernel)),
        (OpKind::ReluGrad, host_kernel(relu_grad_kernel)),
        (OpKind::MatMul, host_kernel(matmul_kernel)),
        (OpKind::Transpose, host_kernel(transpose_kernel)),
        (OpKind::ReduceSumRows, host_kernel(reduce_sum_rows_kernel)),
    ]
}
