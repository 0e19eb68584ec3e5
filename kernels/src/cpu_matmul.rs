use crate::{check_len, KernelElem, KernelError, Result, PARALLEL_THRESHOLD};
use rayon::prelude::*;

/// Batched matrix multiplication over the last two dimensions.
///
/// `lhs` is `[..., M, K]`, `rhs` is `[..., K, N]` and the result is `[..., M, N]`. Leading
/// dimensions must agree. The right-hand side is transposed once up front so the inner loop reads
/// both operands sequentially.
pub fn cpu_matmul<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if RANK < 2 {
        return Err(KernelError::InvalidArgument(
            "matmul requires rank >= 2".into(),
        ));
    }
    let k = lhs_shape[RANK - 1];
    if k != rhs_shape[RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[RANK - 2]],
        });
    }

    // [..., K, N] -> [..., N, K]
    let rhs_t = super::cpu_transpose::cpu_transpose(rhs_data, rhs_shape)?;
    let mut rhs_t_shape = *rhs_shape;
    rhs_t_shape.swap(RANK - 1, RANK - 2);

    cpu_matmul_nt(lhs_data, &rhs_t, lhs_shape, &rhs_t_shape)
}

/// Batched `lhs · rhsᵀ` where `rhs` is already laid out as `[..., N, K]`.
///
/// This is the natural layout for `x · Wᵀ` with a `[out, in]` weight and for attention scores
/// `Q · Kᵀ`, so callers holding such operands skip the transpose.
pub fn cpu_matmul_nt<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if RANK < 2 {
        return Err(KernelError::InvalidArgument(
            "matmul requires rank >= 2".into(),
        ));
    }
    let m = lhs_shape[RANK - 2];
    let k = lhs_shape[RANK - 1];
    let n = rhs_shape[RANK - 2];

    if k != rhs_shape[RANK - 1] {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[RANK - 1]],
        });
    }
    if lhs_shape[..RANK - 2] != rhs_shape[..RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape.to_vec(),
            got: rhs_shape.to_vec(),
        });
    }
    check_len("lhs", lhs_data.len(), lhs_shape.iter().product())?;
    check_len("rhs", rhs_data.len(), rhs_shape.iter().product())?;

    let batch: usize = lhs_shape[..RANK - 2].iter().product();
    let mut out = vec![T::zero(); batch * m * n];
    if n == 0 {
        return Ok(out);
    }

    // One output row per task: row `r` belongs to batch `r / m`.
    let row_fn = |(r, out_row): (usize, &mut [T])| {
        let b = r / m;
        let a_row = &lhs_data[r * k..(r + 1) * k];
        let b_base = b * n * k;
        for (j, o) in out_row.iter_mut().enumerate() {
            let b_row = &rhs_data[b_base + j * k..b_base + (j + 1) * k];
            let mut acc = T::zero();
            for (&x, &y) in a_row.iter().zip(b_row) {
                acc += x * y;
            }
            *o = acc;
        }
    };

    if out.len() * k >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(n).enumerate().for_each(row_fn);
    } else {
        out.chunks_mut(n).enumerate().for_each(row_fn);
    }

    Ok(out)
}
