//! Two-stage top-k over the last axis of a `[batch, beam, vocab]` tensor.
//!
//! Each row is split into `voc_parts` partitions; every partition keeps a
//! local top-k in a fixed-capacity buffer and the partition results are merged
//! into the row's final top-k. Ordering is descending by value with ties broken
//! by the smaller index, and NaN ranks below every number, so the result does
//! not depend on the partitioning.
use anyhow::Result;
use rayon::prelude::*;

use crate::graph::{OpAttrs, OpKind};
use crate::tensor::{FloatElement, Tensor, TensorValue};

use super::{expect_inputs, host_kernel, invalid, HostKernel};

/// Largest `k` the kernels accept.
pub const MAX_K: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    value: f64,
    index: usize,
}

impl Candidate {
    fn ranks_before(&self, other: &Candidate) -> bool {
        match (self.value.is_nan(), other.value.is_nan()) {
            (false, true) => true,
            (true, false) => false,
            (true, true) => self.index < other.index,
            (false, false) => {
                self.value > other.value || (self.value == other.value && self.index < other.index)
            }
        }
    }
}

/// Ordered buffer of at most `k <= CAP` best candidates.
struct TopKBuffer<const CAP: usize> {
    items: [Candidate; CAP],
    len: usize,
    k: usize,
}

impl<const CAP: usize> TopKBuffer<CAP> {
    fn new(k: usize) -> Self {
        debug_assert!(k <= CAP);
        Self {
            items: [Candidate {
                value: f64::NAN,
                index: usize::MAX,
            }; CAP],
            len: 0,
            k,
        }
    }

    fn insert(&mut self, candidate: Candidate) {
        if self.k == 0 {
            return;
        }
        let mut pos = if self.len < self.k {
            self.len += 1;
            self.len - 1
        } else if candidate.ranks_before(&self.items[self.len - 1]) {
            self.len - 1
        } else {
            return;
        };
        while pos > 0 && candidate.ranks_before(&self.items[pos - 1]) {
            self.items[pos] = self.items[pos - 1];
            pos -= 1;
        }
        self.items[pos] = candidate;
    }

    fn as_slice(&self) -> &[Candidate] {
        &self.items[..self.len]
    }
}

fn row_topk<const CAP: usize>(row: &[f64], k: usize, parts: usize) -> Vec<Candidate> {
    let part_len = (row.len() + parts - 1) / parts;
    if part_len == 0 {
        return Vec::new();
    }
    let mut merged = TopKBuffer::<CAP>::new(k);
    for (part, chunk) in row.chunks(part_len).enumerate() {
        let mut local = TopKBuffer::<CAP>::new(k);
        for (offset, value) in chunk.iter().enumerate() {
            local.insert(Candidate {
                value: *value,
                index: part * part_len + offset,
            });
        }
        for candidate in local.as_slice() {
            merged.insert(*candidate);
        }
    }
    merged.as_slice().to_vec()
}

fn select_rows(rows: &[Vec<f64>], k: usize, parts: usize) -> Vec<Vec<Candidate>> {
    macro_rules! run {
        ($cap:literal) => {
            rows.par_iter()
                .map(|row| row_topk::<$cap>(row, k, parts))
                .collect()
        };
    }
    match k {
        0..=4 => run!(4),
        5..=8 => run!(8),
        9..=16 => run!(16),
        17..=32 => run!(32),
        _ => run!(64),
    }
}

fn validate(k: usize, voc_parts: usize, vocab: usize) -> crate::Result<usize> {
    if k == 0 || k > MAX_K {
        return Err(crate::Error::invalid(format!(
            "top-k requires 1 <= k <= {}, got {}",
            MAX_K, k
        )));
    }
    if voc_parts == 0 {
        return Err(crate::Error::invalid("voc_parts must be at least 1"));
    }
    if k > vocab {
        return Err(crate::Error::invalid(format!(
            "k {} exceeds vocabulary size {}",
            k, vocab
        )));
    }
    Ok(voc_parts.min(vocab))
}

type Rows = (Vec<usize>, usize, Vec<Vec<f64>>);

/// Leading dims, vocab size and the rows widened to `f64`.
fn split_rows<T: FloatElement>(input: &Tensor<T>) -> crate::Result<Rows> {
    let shape = input.shape();
    let Some((&vocab, lead)) = shape.split_last() else {
        return Err(crate::Error::invalid("top-k input must have rank >= 1"));
    };
    let rows = if vocab == 0 {
        Vec::new()
    } else {
        input
            .data
            .chunks(vocab)
            .map(|row| row.iter().map(|value| value.to_f64()).collect())
            .collect()
    };
    Ok((lead.to_vec(), vocab, rows))
}

/// Top-k of every row along the last axis.
///
/// Returns `(values, indices)`, both shaped `[..lead, k]`.
pub fn topk<T: FloatElement>(
    input: &Tensor<T>,
    k: usize,
    voc_parts: usize,
) -> crate::Result<(Tensor<T>, Tensor<i64>)> {
    let (lead, vocab, rows) = split_rows(input)?;
    let parts = validate(k, voc_parts, vocab)?;
    let selected = select_rows(&rows, k, parts);

    let mut values = Vec::with_capacity(selected.len() * k);
    let mut indices = Vec::with_capacity(selected.len() * k);
    for (row, candidates) in selected.iter().enumerate() {
        for candidate in candidates {
            values.push(input.data[row * vocab + candidate.index]);
            indices.push(candidate.index as i64);
        }
    }
    let mut out_shape = lead;
    out_shape.push(k);
    Ok((
        Tensor::with_shape(values, &out_shape)?,
        Tensor::with_shape(indices, &out_shape)?,
    ))
}

/// Per-batch top-k across all beams of a `[batch, beam, vocab]` tensor.
///
/// Runs the per-beam top-k first, then merges the `beam * k` survivors of each
/// batch. Returns `(values, tokens, beams)`, each shaped `[batch, k]`.
pub fn beam_search_topk<T: FloatElement>(
    input: &Tensor<T>,
    k: usize,
    voc_parts: usize,
) -> crate::Result<(Tensor<T>, Tensor<i64>, Tensor<i64>)> {
    let &[batch, beam, vocab] = input.shape() else {
        return Err(crate::Error::invalid(format!(
            "beam search top-k expects [batch, beam, vocab], got {:?}",
            input.shape()
        )));
    };
    let (beam_values, beam_indices) = topk(input, k, voc_parts)?;

    let per_batch = (0..batch)
        .into_par_iter()
        .map(|b| {
            let mut buffer = TopKBuffer::<MAX_K>::new(k);
            for bm in 0..beam {
                let base = (b * beam + bm) * k;
                for slot in base..base + k {
                    buffer.insert(Candidate {
                        value: beam_values.data[slot].to_f64(),
                        index: bm * vocab + beam_indices.data[slot] as usize,
                    });
                }
            }
            buffer.as_slice().to_vec()
        })
        .collect::<Vec<_>>();

    let mut values = Vec::with_capacity(batch * k);
    let mut tokens = Vec::with_capacity(batch * k);
    let mut beams = Vec::with_capacity(batch * k);
    for (b, candidates) in per_batch.iter().enumerate() {
        for candidate in candidates {
            let bm = candidate.index / vocab;
            let token = candidate.index % vocab;
            values.push(input.data[(b * beam + bm) * vocab + token]);
            tokens.push(token as i64);
            beams.push(bm as i64);
        }
    }
    let shape = [batch, k];
    Ok((
        Tensor::with_shape(values, &shape)?,
        Tensor::with_shape(tokens, &shape)?,
        Tensor::with_shape(beams, &shape)?,
    ))
}

fn params(attrs: &OpAttrs) -> Result<(usize, usize)> {
    let k = attrs
        .usize("k")?
        .ok_or_else(|| invalid("top-k requires a k attribute"))?;
    let voc_parts = attrs.usize("voc_parts")?.unwrap_or(1);
    Ok((k, voc_parts))
}

fn topk_kernel(attrs: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("topk", inputs, 1)?;
    let (k, voc_parts) = params(attrs)?;
    macro_rules! run {
        ($x:expr) => {{
            let (values, indices) = topk($x, k, voc_parts)?;
            vec![TensorValue::from(values), TensorValue::from(indices)]
        }};
    }
    Ok(match inputs[0] {
        TensorValue::F32(x) => run!(x),
        TensorValue::F64(x) => run!(x),
        TensorValue::F16(x) => run!(x),
        TensorValue::BF16(x) => run!(x),
        other => {
            return Err(invalid(format!(
                "topk expects a float tensor, got {:?}",
                other.dtype()
            )))
        }
    })
}

fn beam_search_topk_kernel(attrs: &OpAttrs, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
    expect_inputs("beam_search_topk", inputs, 1)?;
    let (k, voc_parts) = params(attrs)?;
    macro_rules! run {
        ($x:expr) => {{
            let (values, tokens, beams) = beam_search_topk($x, k, voc_parts)?;
            vec![
                TensorValue::from(values),
                TensorValue::from(tokens),
                TensorValue::from(beams),
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
                "beam_search_topk expects a float tensor, got {:?}",
                other.dtype()
            )))
        }
    })
}

pub(crate) fn entries() -> Vec<(OpKind, HostKernel)> {
    vec![
        (OpKind::TopK, host_kernel(topk_kernel)),
        (OpKind::BeamSearchTopK, host_kernel(beam_search_topk_kernel)),
    ]
}
