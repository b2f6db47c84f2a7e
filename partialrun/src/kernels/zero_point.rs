//! Mask-based compaction and restoration.
//!
//! Erase keeps the elements passing a [`KeepRule`], packs one presence bit per
//! element into `u32` words (bit `i % 32` of word `i / 32`) and records the
//! input shape as `i64`. Restore rebuilds the dense tensor from an inclusive
//! prefix sum of the presence bits.
use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::graph::{OpAttrs, OpKind};
use crate::tensor::{checked_numel, FloatElement, Tensor, TensorValue};

use super::{expect_inputs, host_kernel, invalid, HostKernel};

pub const BITS_PER_MASK_WORD: usize = 32;

const PREFIX_CHUNK: usize = 4096;

/// Which elements survive an erase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum KeepRule {
    /// Keep everything different from the zero point.
    NotEqual(f32),
    /// Keep everything `>= threshold`.
    AtLeast(f32),
}

impl Default for KeepRule {
    fn default() -> Self {
        KeepRule::NotEqual(0.0)
    }
}

impl KeepRule {
    pub fn keeps(&self, value: f64) -> bool {
        match self {
            KeepRule::NotEqual(zero_point) => value != *zero_point as f64,
            KeepRule::AtLeast(threshold) => value >= *threshold as f64,
        }
    }
}

pub fn mask_words(element_count: usize) -> usize {
    (element_count + BITS_PER_MASK_WORD - 1) / BITS_PER_MASK_WORD
}

/// Compact `input` to its kept elements.
///
/// Returns `(values, mask, shape)`.
pub fn zero_point_erase<T: FloatElement>(
    input: &Tensor<T>,
    rule: KeepRule,
) -> crate::Result<(Tensor<T>, Tensor<u32>, Tensor<i64>)> {
    let data = &input.data;
    let mut mask = vec![0u32; mask_words(data.len())];
    mask.par_iter_mut().enumerate().for_each(|(word, bits)| {
        let start = word * BITS_PER_MASK_WORD;
        let end = (start + BITS_PER_MASK_WORD).min(data.len());
        for (bit, value) in data[start..end].iter().enumerate() {
            if rule.keeps(value.to_f64()) {
                *bits |= 1 << bit;
            }
        }
    });
    let values = data
        .iter()
        .copied()
        .filter(|value| rule.keeps(value.to_f64()))
        .collect::<Vec<_>>();
    let shape = input
        .shape()
        .iter()
        .map(|dim| *dim as i64)
        .collect::<Vec<_>>();
    let rank = shape.len();
    let kept = values.len();
    let words = mask.len();
    Ok((
        Tensor::with_shape(values, &[kept])?,
        Tensor::with_shape(mask, &[words])?,
        Tensor::with_shape(shape, &[rank])?,
    ))
}

/// Inclusive prefix sum of presence flags, computed in parallel chunks.
fn presence_prefix_sum(mask: &[u32], len: usize) -> Vec<usize> {
    let mut prefix = (0..len)
        .into_par_iter()
        .map(|i| ((mask[i / BITS_PER_MASK_WORD] >> (i % BITS_PER_MASK_WORD)) & 1) as usize)
        .collect::<Vec<_>>();
    prefix.par_chunks_mut(PREFIX_CHUNK).for_each(|chunk| {
        for i in 1..chunk.len() {
            chunk[i] += chunk[i - 1];
        }
    });
    let mut offsets = Vec::with_capacity(prefix.len() / PREFIX_CHUNK + 1);
    let mut running = 0usize;
    for chunk in prefix.chunks(PREFIX_CHUNK) {
        offsets.push(running);
        running += chunk.last().copied().unwrap_or(0);
    }
    prefix
        .par_chunks_mut(PREFIX_CHUNK)
        .zip(offsets.par_iter())
        .for_each(|(chunk, offset)| {
            for slot in chunk.iter_mut() {
                *slot += *offset;
            }
        });
    prefix
}

/// Rebuild the dense tensor; erased positions get `fill`.
pub fn zero_point_restore<T: FloatElement>(
    values: &Tensor<T>,
    mask: &Tensor<u32>,
    shape: &Tensor<i64>,
    fill: T,
) -> crate::Result<Tensor<T>> {
    let dims = shape
        .data
        .iter()
        .map(|dim| {
            usize::try_from(*dim)
                .map_err(|_| crate::Error::invalid(format!("negative dim {} in shape", dim)))
        })
        .collect::<crate::Result<Vec<_>>>()?;
    let len = checked_numel(&dims).ok_or_else(|| {
        crate::Error::invalid(format!("shape {:?} overflows the element count", dims))
    })?;
    if mask.data.len() != mask_words(len) {
        return Err(crate::Error::invalid(format!(
            "mask has {} words, shape {:?} needs {}",
            mask.data.len(),
            dims,
            mask_words(len)
        )));
    }
    let prefix = presence_prefix_sum(&mask.data, len);
    let kept = prefix.last().copied().unwrap_or(0);
    if kept != values.data.len() {
        return Err(crate::Error::invalid(format!(
            "mask keeps {} elements but {} values were given",
            kept,
            values.data.len()
        )));
    }
    let out = (0..len)
        .into_par_iter()
        .map(|i| {
            let before = if i == 0 { 0 } else { prefix[i - 1] };
            if prefix[i] - before == 1 {
                values.data[prefix[i] - 1]
            } else {
                fill
            }
        })
        .collect::<Vec<_>>();
    Ok(Tensor::with_shape(out, &dims)?)
}

fn keep_rule(attrs: &OpAttrs) -> Result<KeepRule> {
    if let Some(threshold) = attrs.float("threshold")? {
        return Ok(KeepRule::AtLeast(threshold as f32));
    }
    Ok(KeepRule::NotEqual(
        attrs.float("zero_point")?.unwrap_or(0.0) as f32,
    ))
}

fn erase_kernel(attrs: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("zero_point_erase", inputs, 1)?;
    let rule = keep_rule(attrs)?;
    macro_rules! run {
        ($x:expr) => {{
            let (values, mask, shape) = zero_point_erase($x, rule)?;
            vec![
                TensorValue::from(values),
                TensorValue::from(mask),
                TensorValue::from(shape),
            ]
        }};
    }
    Ok(match inputs[0] {
        TensorValue::F32(x) => run!(x),
        TensorValue::F64(x) => run!(x),
        TensorValue::F16(x) => run!(x),
        TensorValue::BF16(x) => run!(x),
        other => {
            return Err(invalid(format!(
                "zero_point_erase expects a float tensor, got {:?}",
                other.dtype()
            )))
        }
    })
}

fn restore_kernel(attrs: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("zero_point_restore", inputs, 3)?;
    let fill = attrs.float("fill")?.unwrap_or(0.0);
    let mask = inputs[1]
        .as_u32()
        .map_err(|err| invalid(format!("zero_point_restore mask: {}", err)))?;
    let shape = inputs[2]
        .as_i64()
        .map_err(|err| invalid(format!("zero_point_restore shape: {}", err)))?;
    macro_rules! run {
        ($x:expr) => {
            TensorValue::from(zero_point_restore($x, mask, shape, FloatElement::from_f64(fill))?)
        };
    }
    let out = match inputs[0] {
        TensorValue::F32(x) => run!(x),
        TensorValue::F64(x) => run!(x),
        TensorValue::F16(x) => run!(x),
        TensorValue::BF16(x) => run!(x),
        other => {
            return Err(invalid(format!(
                "zero_point_restore expects float values, got {:?}",
                other.dtype()
            )))
        }
    };
    Ok(vec![out])
}

pub(crate) fn entries() -> Vec<(OpKind, HostKernel)> {
    vec![
        (OpKind::ZeroPointErase, host_kernel(erase_kernel)),
        (OpKind::ZeroPointRestore, host_kernel(restore_kernel)),
    ]
}
