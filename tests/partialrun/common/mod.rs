#![allow(dead_code)]

use std::env;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use partialrun::{
    AttrValue, DType, Device, Graph, OpAttrs, OpKind, Session, SessionOptions, StreamAssignment,
    Tensor, TensorValue,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Clone, Copy)]
struct FloatTol {
    abs: f64,
    rel: f64,
}

impl FloatTol {
    fn for_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F16 => Some(Self { abs: 0.6, rel: 0.08 }),
            DType::BF16 => Some(Self { abs: 0.1, rel: 0.02 }),
            DType::F32 => Some(Self { abs: 1e-4, rel: 1e-4 }),
            DType::F64 => Some(Self { abs: 1e-7, rel: 1e-7 }),
            _ => None,
        }
    }
}

/// Stream counts to run each scenario with, from `TEST_STREAMS` (default `1,2`).
pub fn test_stream_counts() -> Vec<usize> {
    let raw = env::var("TEST_STREAMS").unwrap_or_else(|_| "1,2".to_string());
    let mut counts = Vec::new();
    for item in raw.split(',') {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<usize>() {
            Ok(count) if count > 0 => counts.push(count),
            _ => panic!(
                "unknown TEST_STREAMS entry '{}'; expected a positive stream count",
                trimmed
            ),
        }
    }
    if counts.is_empty() {
        counts.push(1);
    }
    counts
}

pub fn options_for(streams: usize) -> SessionOptions {
    let options = SessionOptions::default().with_streams(vec![Device::Cpu; streams]);
    if streams > 1 {
        options.with_assignment(StreamAssignment::RoundRobin)
    } else {
        options
    }
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_f32(rng: &mut StdRng, shape: &[usize]) -> Result<Tensor<f32>> {
    let len = shape.iter().product::<usize>();
    let data = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Tensor::with_shape(data, shape)
}

pub fn f32_value(data: Vec<f32>, shape: &[usize]) -> Result<TensorValue> {
    Ok(TensorValue::from(Tensor::with_shape(data, shape)?))
}

pub const W1_SHAPE: [usize; 2] = [4, 3];
pub const W2_SHAPE: [usize; 2] = [3, 2];

/// Two-layer perceptron with a yield between the forward and backward pass.
///
/// Nodes 0..4 are the forward pass, node 4 yields `activation_4` and receives
/// `d_activation_4`, nodes 5..13 compute `grad_w1` and `grad_w2`.
pub fn training_graph(w1: &Tensor<f32>, w2: &Tensor<f32>) -> Result<Graph> {
    let none = OpAttrs::none;
    let mut g = Graph::new();
    g.add_input("x", Some(DType::F32), Some(vec![0, 4]))?;
    g.add_initializer("w1", TensorValue::from(w1.clone()))?;
    g.add_initializer("w2", TensorValue::from(w2.clone()))?;
    g.add_node("fc1", OpKind::MatMul, none(), &["x", "w1"], &["activation_1"])?;
    g.add_node("relu1", OpKind::Relu, none(), &["activation_1"], &["activation_2"])?;
    g.add_node("fc2", OpKind::MatMul, none(), &["activation_2", "w2"], &["activation_3"])?;
    g.add_node("relu2", OpKind::Relu, none(), &["activation_3"], &["activation_4"])?;
    g.add_node("yield", OpKind::Yield, none(), &["activation_4"], &["d_activation_4"])?;
    g.annotate("d_activation_4", Some(DType::F32), Some(vec![0, 2]))?;
    g.add_node(
        "relu2_grad",
        OpKind::ReluGrad,
        none(),
        &["d_activation_4", "activation_3"],
        &["d_activation_3"],
    )?;
    g.add_node("w2_transpose", OpKind::Transpose, none(), &["w2"], &["w2_t"])?;
    g.add_node(
        "fc2_input_grad",
        OpKind::MatMul,
        none(),
        &["d_activation_3", "w2_t"],
        &["d_activation_2"],
    )?;
    g.add_node(
        "relu1_grad",
        OpKind::ReluGrad,
        none(),
        &["d_activation_2", "activation_1"],
        &["d_activation_1"],
    )?;
    g.add_node(
        "activation_2_transpose",
        OpKind::Transpose,
        none(),
        &["activation_2"],
        &["activation_2_t"],
    )?;
    g.add_node(
        "fc2_weight_grad",
        OpKind::MatMul,
        none(),
        &["activation_2_t", "d_activation_3"],
        &["grad_w2"],
    )?;
    g.add_node("x_transpose", OpKind::Transpose, none(), &["x"], &["x_t"])?;
    g.add_node(
        "fc1_weight_grad",
        OpKind::MatMul,
        none(),
        &["x_t", "d_activation_1"],
        &["grad_w1"],
    )?;
    g.mark_output("grad_w1")?;
    g.mark_output("grad_w2")?;
    Ok(g)
}

pub fn training_session(seed: u64, options: SessionOptions) -> Result<(Arc<Session>, StdRng)> {
    let mut rng = rng(seed);
    let w1 = random_f32(&mut rng, &W1_SHAPE)?;
    let w2 = random_f32(&mut rng, &W2_SHAPE)?;
    let session = Session::new(training_graph(&w1, &w2)?, options)?;
    Ok((Arc::new(session), rng))
}

/// Chain without a yield; nodes alternate streams under round-robin so most
/// edges cross streams.
pub fn diamond_graph(w: &Tensor<f32>) -> Result<Graph> {
    let none = OpAttrs::none;
    let mut g = Graph::new();
    g.add_input("x", Some(DType::F32), Some(vec![0, 3]))?;
    g.add_initializer("w", TensorValue::from(w.clone()))?;
    g.add_node("project", OpKind::MatMul, none(), &["x", "w"], &["a"])?;
    g.add_node("rectify", OpKind::Relu, none(), &["a"], &["b"])?;
    g.add_node(
        "halve",
        OpKind::Scale,
        OpAttrs::none().with("alpha", AttrValue::Float(0.5)),
        &["a"],
        &["c"],
    )?;
    g.add_node("join", OpKind::Add, none(), &["b", "c"], &["d"])?;
    g.add_node("gate", OpKind::Mul, none(), &["d", "a"], &["e"])?;
    g.add_node("flip", OpKind::Transpose, none(), &["e"], &["f"])?;
    g.add_node("column_sums", OpKind::ReduceSumRows, none(), &["e"], &["g"])?;
    g.mark_output("f")?;
    g.mark_output("g")?;
    Ok(g)
}

pub fn diamond_session(seed: u64, options: SessionOptions) -> Result<(Session, StdRng)> {
    let mut rng = rng(seed);
    let w = random_f32(&mut rng, &[3, 3])?;
    Ok((Session::new(diamond_graph(&w)?, options)?, rng))
}

fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
        }
    }
    out
}

fn transpose(a: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = a[r * cols + c];
        }
    }
    out
}

fn relu(a: &[f32]) -> Vec<f32> {
    a.iter().map(|v| v.max(0.0)).collect()
}

fn relu_grad(dy: &[f32], x: &[f32]) -> Vec<f32> {
    dy.iter()
        .zip(x)
        .map(|(dy, x)| if *x > 0.0 { *dy } else { 0.0 })
        .collect()
}

/// Host reference of one training step: `(activation_4, grad_w1, grad_w2)`.
pub fn reference_step(
    x: &Tensor<f32>,
    w1: &Tensor<f32>,
    w2: &Tensor<f32>,
    d_activation_4: &Tensor<f32>,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let batch = x.shape()[0];
    let a1 = matmul(&x.data, &w1.data, batch, 4, 3);
    let a2 = relu(&a1);
    let a3 = matmul(&a2, &w2.data, batch, 3, 2);
    let a4 = relu(&a3);
    let d3 = relu_grad(&d_activation_4.data, &a3);
    let d2 = matmul(&d3, &transpose(&w2.data, 3, 2), batch, 2, 3);
    let d1 = relu_grad(&d2, &a1);
    let grad_w2 = matmul(&transpose(&a2, batch, 3), &d3, 3, batch, 2);
    let grad_w1 = matmul(&transpose(&x.data, batch, 4), &d1, 4, batch, 3);
    (a4, grad_w1, grad_w2)
}

pub fn session_weights(session: &Session) -> Result<(Tensor<f32>, Tensor<f32>)> {
    let graph = session.graph();
    let lookup = |name: &str| -> Result<Tensor<f32>> {
        let id = graph
            .value_id(name)
            .ok_or_else(|| anyhow!("missing value {}", name))?;
        let value = graph
            .initializer(id)
            .ok_or_else(|| anyhow!("{} is not an initializer", name))?;
        Ok(value.as_f32()?.clone())
    };
    Ok((lookup("w1")?, lookup("w2")?))
}

pub fn assert_close(actual: &TensorValue, expected: &[f32], shape: &[usize]) -> Result<()> {
    let expected = f32_value(expected.to_vec(), shape)?;
    assert_tensor_close(actual, &expected)
}

pub fn assert_tensor_close(actual: &TensorValue, expected: &TensorValue) -> Result<()> {
    if actual.dtype() != expected.dtype() {
        return Err(anyhow!(
            "dtype mismatch: actual {:?} expected {:?}",
            actual.dtype(),
            expected.dtype()
        ));
    }
    if actual.shape() != expected.shape() {
        return Err(anyhow!(
            "shape mismatch: actual {:?} expected {:?}",
            actual.shape(),
            expected.shape()
        ));
    }
    match (actual, expected) {
        (TensorValue::I64(a), TensorValue::I64(b)) => exact_match(&a.data, &b.data),
        (TensorValue::U32(a), TensorValue::U32(b)) => exact_match(&a.data, &b.data),
        _ => compare_floats(actual, expected),
    }
}

fn exact_match<T: PartialEq + std::fmt::Debug>(actual: &[T], expected: &[T]) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(anyhow!("tensor values differ: {:?} vs {:?}", actual, expected))
    }
}

fn compare_floats(actual: &TensorValue, expected: &TensorValue) -> Result<()> {
    let dtype = actual.dtype();
    let Some(tol) = FloatTol::for_dtype(dtype) else {
        return Err(anyhow!("missing float tolerance for {:?}", dtype));
    };
    let actual_vals = float_values(actual)?;
    let expected_vals = float_values(expected)?;
    for (idx, (a, b)) in actual_vals.iter().zip(expected_vals.iter()).enumerate() {
        if a.is_nan() && b.is_nan() {
            continue;
        }
        if a == b {
            continue;
        }
        let diff = (a - b).abs();
        if diff <= tol.abs {
            continue;
        }
        let scale = a.abs().max(b.abs());
        if diff > tol.rel * scale {
            return Err(anyhow!(
                "value mismatch at index {}: {} vs {} (abs {}, rel {})",
                idx,
                a,
                b,
                tol.abs,
                tol.rel
            ));
        }
    }
    Ok(())
}

fn float_values(value: &TensorValue) -> Result<Vec<f64>> {
    match value {
        TensorValue::F16(tensor) => Ok(tensor.data.iter().map(|v| v.to_f32() as f64).collect()),
        TensorValue::BF16(tensor) => Ok(tensor.data.iter().map(|v| v.to_f32() as f64).collect()),
        TensorValue::F32(tensor) => Ok(tensor.data.iter().map(|v| *v as f64).collect()),
        TensorValue::F64(tensor) => Ok(tensor.data.clone()),
        _ => Err(anyhow!("expected float tensor, got {:?}", value.dtype())),
    }
}
