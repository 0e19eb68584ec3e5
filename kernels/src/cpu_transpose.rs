use crate::{KernelElem, KernelError, Result, PARALLEL_THRESHOLD};
use rayon::prelude::*;

/// Swaps the last two dimensions of row-major `data` with the given `shape`.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if RANK < 2 {
        return Err(KernelError::InvalidArgument(
            "transpose requires rank >= 2".into(),
        ));
    }
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }

    let m = shape[RANK - 2];
    let n = shape[RANK - 1];
    let mut out = vec![T::zero(); size];
    if m == 0 {
        return Ok(out);
    }

    // Output row `i` of the flattened [batch * N, M] view is input column `i % n`.
    let col_fn = |(i, out_row): (usize, &mut [T])| {
        let base = (i / n) * m * n;
        let col = i % n;
        for (r, o) in out_row.iter_mut().enumerate() {
            *o = data[base + r * n + col];
        }
    };

    if size >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(m).enumerate().for_each(col_fn);
    } else {
        out.chunks_mut(m).enumerate().for_each(col_fn);
    }

    Ok(out)
}
