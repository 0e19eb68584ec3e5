//! Online softmax combiner.
//!
//! Attention over a sequence split into blocks can be computed block by block if every partial
//! output carries the log-sum-exp (`lse`) of its softmax denominator. Two partials `(o₁, l₁)` and
//! `(o₂, l₂)` over disjoint key sets combine into
//!
//! ```text
//! o = o₁ - σ(l₂ - l₁) · (o₁ - o₂)
//! l = l₁ - log σ(l₁ - l₂)
//! ```
//!
//! which is the softmax-weighted average `(e^l₁·o₁ + e^l₂·o₂) / (e^l₁ + e^l₂)` rewritten so no
//! exponential of an `lse` is ever formed. The running pair is kept in `f64`.

use crate::error::{Error, Result};
use crate::tensor::{Cpu, Tensor, TensorError};
use rayon::prelude::*;
use ringtrain_kernels::PARALLEL_THRESHOLD;

/// Running (or block) attention output with its per-row log-sum-exp.
///
/// `out` is `[batch, heads, q_len, head_dim]`, `lse` is `[batch, heads, q_len]`.
#[derive(Debug, Clone)]
pub struct Partial {
    pub out: Tensor<f64, 4, Cpu>,
    pub lse: Tensor<f64, 3, Cpu>,
}

impl Partial {
    pub fn new(out: Tensor<f64, 4, Cpu>, lse: Tensor<f64, 3, Cpu>) -> Result<Self> {
        let [b, h, s, _] = *out.shape();
        if lse.shape() != &[b, h, s] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![b, h, s],
                got: lse.shape().to_vec(),
            }
            .into());
        }
        Ok(Self { out, lse })
    }
}

/// `1 / (1 + e^-x)` without overflow for large `|x|`.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `log(sigmoid(x))` without overflow for large `|x|`.
#[inline]
pub fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// Folds `block` into the running state. The first block passes through unchanged.
///
/// # Errors
///
/// `ShapeMismatch` if the two partials cover different rows, `NonFinite` if the merged `lse`
/// (or output) is NaN or infinite.
pub fn merge(state: Option<Partial>, block: Partial) -> Result<Partial> {
    let Some(mut state) = state else {
        return Ok(block);
    };
    if state.out.shape() != block.out.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: state.out.shape().to_vec(),
            got: block.out.shape().to_vec(),
        }
        .into());
    }

    let d = state.out.shape()[3];
    let rows = state.lse.size();
    let merge_row = |((out_row, lse), (b_out, &b_lse)): ((&mut [f64], &mut f64), (&[f64], &f64))| {
        let w = sigmoid(b_lse - *lse);
        for (o, &bo) in out_row.iter_mut().zip(b_out) {
            *o -= w * (*o - bo);
        }
        *lse -= log_sigmoid(*lse - b_lse);
    };

    if rows * d >= PARALLEL_THRESHOLD {
        state
            .out
            .data_mut()
            .par_chunks_mut(d)
            .zip(state.lse.data_mut().par_iter_mut())
            .zip(block.out.data().par_chunks(d).zip(block.lse.data().par_iter()))
            .for_each(merge_row);
    } else {
        state
            .out
            .data_mut()
            .chunks_mut(d)
            .zip(state.lse.data_mut().iter_mut())
            .zip(block.out.data().chunks(d).zip(block.lse.data().iter()))
            .for_each(merge_row);
    }

    if !state.lse.all_finite() || !state.out.all_finite() {
        return Err(Error::NonFinite {
            op: "online softmax merge",
        });
    }
    Ok(state)
}
