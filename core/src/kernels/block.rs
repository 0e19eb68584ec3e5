//! Tensor-level wrappers around the slice attention kernels.
//!
//! Blocks are `[batch, heads, len, head_dim]`; batch and heads are flattened into the kernel's
//! head dimension. Forward results are widened to `f64` so they can be merged with
//! [`merge`](super::online_softmax::merge).

use super::online_softmax::Partial;
use crate::error::{Error, Result};
use crate::tensor::{Cpu, Tensor, TensorElem, TensorError};
use num_traits::Float;
use ringtrain_kernels::{BlockShape, attention_block_backward, attention_block_forward};

/// Gradients of one block, widened to `f64` for accumulation.
#[derive(Debug, Clone)]
pub struct BlockGrads {
    pub dq: Tensor<f64, 4, Cpu>,
    pub dk: Tensor<f64, 4, Cpu>,
    pub dv: Tensor<f64, 4, Cpu>,
}

fn block_shape<T: TensorElem>(
    q: &Tensor<T, 4, Cpu>,
    k: &Tensor<T, 4, Cpu>,
    v: &Tensor<T, 4, Cpu>,
) -> Result<BlockShape> {
    let [b, h, q_len, d] = *q.shape();
    let [kb, kh, kv_len, kd] = *k.shape();
    if (kb, kh, kd) != (b, h, d) || v.shape() != k.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, h, kv_len, d],
            got: if v.shape() != k.shape() {
                v.shape().to_vec()
            } else {
                k.shape().to_vec()
            },
        }
        .into());
    }
    Ok(BlockShape {
        heads: b * h,
        q_len,
        kv_len,
        head_dim: d,
    })
}

pub(crate) fn to_elem<T: TensorElem>(x: f64) -> Result<T> {
    T::from_f64(x).ok_or_else(|| TensorError::Unsupported(format!("{x} out of range")).into())
}

/// Attention of `q` over one key/value block, with its log-sum-exp.
///
/// `causal` applies the diagonal mask (column `j` hidden from row `i` when `j > i`), which is only
/// meaningful when query and key blocks start at the same sequence position.
pub fn block_forward<T>(
    q: &Tensor<T, 4, Cpu>,
    k: &Tensor<T, 4, Cpu>,
    v: &Tensor<T, 4, Cpu>,
    scale: f64,
    causal: bool,
) -> Result<Partial>
where
    T: TensorElem + Float,
{
    let shape = block_shape(q, k, v)?;
    let res = attention_block_forward(
        q.data(),
        k.data(),
        v.data(),
        shape,
        to_elem::<T>(scale)?,
        causal,
    )?;

    let [b, h, s, d] = *q.shape();
    let out = Tensor::new(res.out, [b, h, s, d])?.cast::<f64>()?;
    let lse = Tensor::new(res.lse, [b, h, s])?.cast::<f64>()?;
    Partial::new(out, lse)
}

/// Gradients of one block given the final output `out` and log-sum-exp `lse` of the query rows.
///
/// `lse` is taken at `f64`, as produced by the forward merge; the recomputed softmax weights are
/// rounded to `T` only after subtracting it.
#[allow(clippy::too_many_arguments)]
pub fn block_backward<T>(
    q: &Tensor<T, 4, Cpu>,
    k: &Tensor<T, 4, Cpu>,
    v: &Tensor<T, 4, Cpu>,
    out: &Tensor<T, 4, Cpu>,
    d_out: &Tensor<T, 4, Cpu>,
    lse: &Tensor<f64, 3, Cpu>,
    scale: f64,
    causal: bool,
) -> Result<BlockGrads>
where
    T: TensorElem + Float,
{
    let shape = block_shape(q, k, v)?;
    for t in [out, d_out] {
        if t.shape() != q.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: q.shape().to_vec(),
                got: t.shape().to_vec(),
            }
            .into());
        }
    }

    let res = attention_block_backward(
        q.data(),
        k.data(),
        v.data(),
        out.data(),
        d_out.data(),
        lse.data(),
        shape,
        to_elem::<T>(scale)?,
        causal,
    )?;

    let grads = BlockGrads {
        dq: Tensor::new(res.dq, *q.shape())?.cast()?,
        dk: Tensor::new(res.dk, *k.shape())?.cast()?,
        dv: Tensor::new(res.dv, *v.shape())?.cast()?,
    };
    if !(grads.dq.all_finite() && grads.dk.all_finite() && grads.dv.all_finite()) {
        return Err(Error::NonFinite {
            op: "attention block backward",
        });
    }
    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_forward_shapes() {
        let q = Tensor::<f32, 4>::from_fn([2, 3, 4, 5], |i| (i as f32 * 0.1).sin());
        let k = Tensor::<f32, 4>::from_fn([2, 3, 6, 5], |i| (i as f32 * 0.2).cos());
        let p = block_forward(&q, &k, &k, 0.5, false).unwrap();
        assert_eq!(p.out.shape(), &[2, 3, 4, 5]);
        assert_eq!(p.lse.shape(), &[2, 3, 4]);
    }

    #[test]
    fn test_split_blocks_merge_to_full_attention() {
        let q = Tensor::<f64, 4>::from_fn([1, 2, 3, 4], |i| (i as f64 * 0.3).sin());
        let k = Tensor::<f64, 4>::from_fn([1, 2, 6, 4], |i| (i as f64 * 0.7).cos());
        let v = Tensor::<f64, 4>::from_fn([1, 2, 6, 4], |i| (i as f64 * 0.11).sin());

        let full = block_forward(&q, &k, &v, 0.5, false).unwrap();
        let left = block_forward(&q, &k.narrow(2, 0, 2).unwrap(), &v.narrow(2, 0, 2).unwrap(), 0.5, false)
            .unwrap();
        let right = block_forward(&q, &k.narrow(2, 2, 4).unwrap(), &v.narrow(2, 2, 4).unwrap(), 0.5, false)
            .unwrap();
        let merged = super::super::merge(Some(left), right).unwrap();

        for (a, b) in merged.out.data().iter().zip(full.out.data()) {
            assert!((a - b).abs() < 1e-12);
        }
        for (a, b) in merged.lse.data().iter().zip(full.lse.data()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_mismatched_heads_rejected() {
        let q = Tensor::<f32, 4>::zeros([1, 2, 2, 2]);
        let k = Tensor::<f32, 4>::zeros([1, 1, 2, 2]);
        assert!(block_forward(&q, &k, &k, 1.0, false).is_err());
    }
}
