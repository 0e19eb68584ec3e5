//! Single-block attention kernels.
//!
//! A "block" is one query slice attending to one key/value slice. Heads (and batch) are flattened
//! into a leading `heads` dimension; every head is independent, which is the unit of parallelism.
//!
//! The forward kernel returns the per-row log-sum-exp alongside the output so callers can merge
//! several blocks with an online softmax. The backward kernel recomputes the attention weights from
//! that statistic instead of storing them.

use crate::{check_len, KernelElem, KernelError, Result, PARALLEL_THRESHOLD};
use num_traits::Float;
use rayon::prelude::*;

/// Geometry of one attention block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockShape {
    /// Batch times heads.
    pub heads: usize,
    pub q_len: usize,
    pub kv_len: usize,
    pub head_dim: usize,
}

impl BlockShape {
    fn q_elems(&self) -> usize {
        self.heads * self.q_len * self.head_dim
    }

    fn kv_elems(&self) -> usize {
        self.heads * self.kv_len * self.head_dim
    }

    fn validate(&self) -> Result<()> {
        if self.kv_len == 0 || self.head_dim == 0 {
            return Err(KernelError::InvalidArgument(format!(
                "attention block needs non-empty keys and head_dim, got {self:?}"
            )));
        }
        Ok(())
    }
}

/// Output of [`attention_block_forward`]: `out` is `[heads, q_len, head_dim]`, `lse` is
/// `[heads, q_len]`.
#[derive(Debug, Clone)]
pub struct BlockOutput<T> {
    pub out: Vec<T>,
    pub lse: Vec<T>,
}

/// Gradients of one block with respect to its query, key and value slices.
#[derive(Debug, Clone)]
pub struct BlockGrads<T> {
    pub dq: Vec<T>,
    pub dk: Vec<T>,
    pub dv: Vec<T>,
}

#[inline]
fn masked(causal: bool, row: usize, col: usize) -> bool {
    causal && col > row
}

#[inline]
fn dot<T: KernelElem>(a: &[T], b: &[T]) -> T {
    let mut acc = T::zero();
    for (&x, &y) in a.iter().zip(b) {
        acc += x * y;
    }
    acc
}

/// Softmax attention of `q` against `k`/`v`, scores scaled by `scale`.
///
/// When `causal` is set, column `j` is hidden from row `i` whenever `j > i`. The softmax subtracts
/// the row maximum before exponentiating.
pub fn attention_block_forward<T>(
    q: &[T],
    k: &[T],
    v: &[T],
    shape: BlockShape,
    scale: T,
    causal: bool,
) -> Result<BlockOutput<T>>
where
    T: KernelElem + Float,
{
    shape.validate()?;
    check_len("q", q.len(), shape.q_elems())?;
    check_len("k", k.len(), shape.kv_elems())?;
    check_len("v", v.len(), shape.kv_elems())?;

    let BlockShape {
        q_len,
        kv_len,
        head_dim: d,
        ..
    } = shape;

    let mut out = vec![T::zero(); shape.q_elems()];
    let mut lse = vec![T::zero(); shape.heads * q_len];

    let head_fn = |(h, (out_head, lse_head)): (usize, (&mut [T], &mut [T]))| {
        let q_head = &q[h * q_len * d..(h + 1) * q_len * d];
        let k_head = &k[h * kv_len * d..(h + 1) * kv_len * d];
        let v_head = &v[h * kv_len * d..(h + 1) * kv_len * d];
        let mut scores = vec![T::zero(); kv_len];

        for i in 0..q_len {
            let q_row = &q_head[i * d..(i + 1) * d];
            let mut row_max = T::neg_infinity();
            for (j, s) in scores.iter_mut().enumerate() {
                *s = if masked(causal, i, j) {
                    T::neg_infinity()
                } else {
                    dot(q_row, &k_head[j * d..(j + 1) * d]) * scale
                };
                if *s > row_max {
                    row_max = *s;
                }
            }

            let mut sum = T::zero();
            for s in scores.iter_mut() {
                *s = (*s - row_max).exp();
                sum += *s;
            }

            let out_row = &mut out_head[i * d..(i + 1) * d];
            for (j, &p) in scores.iter().enumerate() {
                if p == T::zero() {
                    continue;
                }
                let w = p / sum;
                for (o, &x) in out_row.iter_mut().zip(&v_head[j * d..(j + 1) * d]) {
                    *o += w * x;
                }
            }
            lse_head[i] = row_max + sum.ln();
        }
    };

    if shape.q_elems() * kv_len >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(q_len * d)
            .zip(lse.par_chunks_mut(q_len))
            .enumerate()
            .for_each(head_fn);
    } else {
        out.chunks_mut(q_len * d)
            .zip(lse.chunks_mut(q_len))
            .enumerate()
            .for_each(head_fn);
    }

    Ok(BlockOutput { out, lse })
}

/// Gradients of one block given the upstream gradient `d_out`.
///
/// `out` and `lse` are the *final* attention output and log-sum-exp of the query rows (after all
/// blocks were merged), so the recomputed weights `exp(S·scale − lse)` are this block's share of the
/// global softmax. `lse` stays in `f64`: the weights are recomputed at that precision and only
/// then rounded to `T`.
#[allow(clippy::too_many_arguments)]
pub fn attention_block_backward<T>(
    q: &[T],
    k: &[T],
    v: &[T],
    out: &[T],
    d_out: &[T],
    lse: &[f64],
    shape: BlockShape,
    scale: T,
    causal: bool,
) -> Result<BlockGrads<T>>
where
    T: KernelElem + Float,
{
    shape.validate()?;
    check_len("q", q.len(), shape.q_elems())?;
    check_len("k", k.len(), shape.kv_elems())?;
    check_len("v", v.len(), shape.kv_elems())?;
    check_len("out", out.len(), shape.q_elems())?;
    check_len("d_out", d_out.len(), shape.q_elems())?;
    check_len("lse", lse.len(), shape.heads * shape.q_len)?;

    let BlockShape {
        q_len,
        kv_len,
        head_dim: d,
        ..
    } = shape;

    let mut dq = vec![T::zero(); shape.q_elems()];
    let mut dk = vec![T::zero(); shape.kv_elems()];
    let mut dv = vec![T::zero(); shape.kv_elems()];

    let head_fn = |(h, ((dq_head, dk_head), dv_head)): (
        usize,
        ((&mut [T], &mut [T]), &mut [T]),
    )| {
        let q_off = h * q_len * d;
        let kv_off = h * kv_len * d;
        let q_head = &q[q_off..q_off + q_len * d];
        let k_head = &k[kv_off..kv_off + kv_len * d];
        let v_head = &v[kv_off..kv_off + kv_len * d];
        let o_head = &out[q_off..q_off + q_len * d];
        let do_head = &d_out[q_off..q_off + q_len * d];
        let lse_head = &lse[h * q_len..(h + 1) * q_len];

        for i in 0..q_len {
            let q_row = &q_head[i * d..(i + 1) * d];
            let do_row = &do_head[i * d..(i + 1) * d];
            // D_i = rowsum(dO ⊙ O)
            let delta = dot(do_row, &o_head[i * d..(i + 1) * d]);

            for j in 0..kv_len {
                if masked(causal, i, j) {
                    continue;
                }
                let k_row = &k_head[j * d..(j + 1) * d];
                let v_row = &v_head[j * d..(j + 1) * d];

                let score = (dot(q_row, k_row) * scale).to_f64().unwrap_or(f64::NAN);
                let p = T::from_f64((score - lse_head[i]).exp()).unwrap_or_else(T::nan);
                let dp = dot(do_row, v_row);
                let ds = p * (dp - delta) * scale;

                for c in 0..d {
                    dv_head[j * d + c] += p * do_row[c];
                    dq_head[i * d + c] += ds * k_row[c];
                    dk_head[j * d + c] += ds * q_row[c];
                }
            }
        }
    };

    if shape.q_elems() * kv_len >= PARALLEL_THRESHOLD {
        dq.par_chunks_mut(q_len * d)
            .zip(dk.par_chunks_mut(kv_len * d))
            .zip(dv.par_chunks_mut(kv_len * d))
            .enumerate()
            .for_each(head_fn);
    } else {
        dq.chunks_mut(q_len * d)
            .zip(dk.chunks_mut(kv_len * d))
            .zip(dv.chunks_mut(kv_len * d))
            .enumerate()
            .for_each(head_fn);
    }

    Ok(BlockGrads { dq, dk, dv })
}
