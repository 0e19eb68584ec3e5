//! Rotary Positional Embedding (RoPE).
//!
//! RoPE rotates each pair `(x[2i], x[2i+1])` of a query or key vector at position `p` by the angle
//! `p · θ^(-2i/d)`:
//!
//! $$ \begin{pmatrix} x_1' \\ x_2' \end{pmatrix} = \begin{pmatrix} \cos \phi & -\sin \phi \\ \sin \phi & \cos \phi \end{pmatrix} \begin{pmatrix} x_1 \\ x_2 \end{pmatrix} $$
//!
//! Tables are indexed by **absolute** position, so a worker holding the slice starting at offset
//! `o` rotates its rows with positions `o..o + len`.

use crate::autograd::{Function, Variable, apply};
use crate::error::{Error, Result};
use crate::kernels::block::to_elem;
use crate::tensor::{Cpu, Tensor, TensorElem};
use num_traits::Float;
use rayon::prelude::*;
use ringtrain_kernels::PARALLEL_THRESHOLD;
use std::rc::Rc;

/// Precomputed rotation tables, shared by every attention layer of a model.
#[derive(Debug, Clone)]
pub struct Rotary<T: TensorElem> {
    cos: Tensor<T, 2, Cpu>,
    sin: Tensor<T, 2, Cpu>,
    head_dim: usize,
}

impl<T: TensorElem + Float> Rotary<T> {
    pub fn new(head_dim: usize, max_positions: usize, theta: f64) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "rotary embedding needs an even head_dim, got {head_dim}"
            )));
        }
        let half = head_dim / 2;
        let angle = |idx: usize| {
            let (pos, i) = (idx / half, idx % half);
            pos as f64 * theta.powf(-2.0 * i as f64 / head_dim as f64)
        };

        let cos = (0..max_positions * half)
            .map(|idx| to_elem(angle(idx).cos()))
            .collect::<Result<Vec<T>>>()?;
        let sin = (0..max_positions * half)
            .map(|idx| to_elem(angle(idx).sin()))
            .collect::<Result<Vec<T>>>()?;

        Ok(Self {
            cos: Tensor::new(cos, [max_positions, half])?,
            sin: Tensor::new(sin, [max_positions, half])?,
            head_dim,
        })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn max_positions(&self) -> usize {
        self.cos.shape()[0]
    }

    /// Rotates `[batch, heads, seq, head_dim]` rows; row `t` is at position `positions[t]`.
    pub fn apply(&self, x: &Tensor<T, 4, Cpu>, positions: &[usize]) -> Result<Tensor<T, 4, Cpu>> {
        self.rotate(x, positions, false)
    }

    /// The inverse rotation (rotation by the negated angle).
    pub fn apply_inverse(
        &self,
        x: &Tensor<T, 4, Cpu>,
        positions: &[usize],
    ) -> Result<Tensor<T, 4, Cpu>> {
        self.rotate(x, positions, true)
    }

    fn rotate(
        &self,
        x: &Tensor<T, 4, Cpu>,
        positions: &[usize],
        inverse: bool,
    ) -> Result<Tensor<T, 4, Cpu>> {
        let [_, _, s, d] = *x.shape();
        if d != self.head_dim {
            return Err(Error::Config(format!(
                "rotary tables built for head_dim {}, got {d}",
                self.head_dim
            )));
        }
        if positions.len() != s {
            return Err(Error::Config(format!(
                "{} positions for a sequence of {s}",
                positions.len()
            )));
        }
        if let Some(&p) = positions.iter().find(|&&p| p >= self.max_positions()) {
            return Err(Error::Config(format!(
                "position {p} beyond rotary table of {}",
                self.max_positions()
            )));
        }

        let half = d / 2;
        let (cos, sin) = (self.cos.data(), self.sin.data());
        let mut out = x.clone();
        let rotate_head = |head: &mut [T]| {
            for (t, &pos) in positions.iter().enumerate() {
                let row = &mut head[t * d..(t + 1) * d];
                for i in 0..half {
                    let c = cos[pos * half + i];
                    let sn = if inverse {
                        T::zero() - sin[pos * half + i]
                    } else {
                        sin[pos * half + i]
                    };
                    let (x0, x1) = (row[2 * i], row[2 * i + 1]);
                    row[2 * i] = x0 * c - x1 * sn;
                    row[2 * i + 1] = x0 * sn + x1 * c;
                }
            }
        };

        if x.size() >= PARALLEL_THRESHOLD {
            out.data_mut().par_chunks_mut(s * d).for_each(rotate_head);
        } else {
            out.data_mut().chunks_mut(s * d).for_each(rotate_head);
        }
        Ok(out)
    }
}

/// Differentiable rotary encoding. A rotation is orthogonal, so the backward is the inverse
/// rotation of the upstream gradient.
struct RopeFn<T: TensorElem> {
    rotary: Rc<Rotary<T>>,
    positions: Vec<usize>,
}

impl<T: TensorElem + Float> Function<T, 4, 4> for RopeFn<T> {
    type Saved = ();

    fn name(&self) -> &'static str {
        "rope"
    }

    fn forward(&self, inputs: &[&Tensor<T, 4, Cpu>]) -> Result<(Tensor<T, 4, Cpu>, ())> {
        let [x] = inputs else {
            return Err(Error::Autograd("rope takes one input".into()));
        };
        Ok((self.rotary.apply(x, &self.positions)?, ()))
    }

    fn backward(
        &self,
        _: (),
        grad_output: &Tensor<T, 4, Cpu>,
    ) -> Result<Vec<Option<Tensor<T, 4, Cpu>>>> {
        Ok(vec![Some(
            self.rotary.apply_inverse(grad_output, &self.positions)?,
        )])
    }
}

/// Applies `rotary` to a `[batch, heads, seq, head_dim]` variable.
pub fn apply_rotary<T: TensorElem + Float + 'static>(
    rotary: &Rc<Rotary<T>>,
    x: &Variable<T, 4>,
    positions: &[usize],
) -> Result<Variable<T, 4>> {
    apply(
        RopeFn {
            rotary: rotary.clone(),
            positions: positions.to_vec(),
        },
        &[x],
    )
}
