//! Differentiable building blocks used by the attention modules.
//!
//! Each operation is a [`Function`] recorded through [`apply`]; the `Variable` methods at the
//! bottom are the public surface.

use super::{Function, Variable, apply};
use crate::error::{Error, Result};
use crate::tensor::{Cpu, Tensor, TensorElem, TensorOps};

type Grads<T, const RANK: usize> = Result<Vec<Option<Tensor<T, RANK, Cpu>>>>;

fn arity<'a, T: TensorElem, const RANK: usize, const N: usize>(
    op: &'static str,
    inputs: &[&'a Tensor<T, RANK, Cpu>],
) -> Result<[&'a Tensor<T, RANK, Cpu>; N]> {
    inputs.try_into().map_err(|_| {
        Error::Autograd(format!("{op} takes {N} inputs, got {}", inputs.len()))
    })
}

// --- Reshape ---
struct ReshapeFn<const OUT: usize> {
    shape: [usize; OUT],
}

impl<T: TensorElem, const IN: usize, const OUT: usize> Function<T, IN, OUT> for ReshapeFn<OUT> {
    type Saved = [usize; IN];

    fn name(&self) -> &'static str {
        "reshape"
    }

    fn forward(&self, inputs: &[&Tensor<T, IN, Cpu>]) -> Result<(Tensor<T, OUT, Cpu>, [usize; IN])> {
        let [x] = arity::<T, IN, 1>("reshape", inputs)?;
        Ok((x.clone().reshape(self.shape)?, *x.shape()))
    }

    fn backward(&self, shape: [usize; IN], grad: &Tensor<T, OUT, Cpu>) -> Grads<T, IN> {
        Ok(vec![Some(grad.clone().reshape(shape)?)])
    }
}

// --- TransposeAxes ---
struct TransposeAxesFn {
    ax1: usize,
    ax2: usize,
}

impl<T: TensorElem, const RANK: usize> Function<T, RANK, RANK> for TransposeAxesFn {
    type Saved = ();

    fn name(&self) -> &'static str {
        "transpose_axes"
    }

    fn forward(&self, inputs: &[&Tensor<T, RANK, Cpu>]) -> Result<(Tensor<T, RANK, Cpu>, ())> {
        let [x] = arity::<T, RANK, 1>("transpose_axes", inputs)?;
        Ok((x.transpose_axes(self.ax1, self.ax2)?, ()))
    }

    fn backward(&self, _: (), grad: &Tensor<T, RANK, Cpu>) -> Grads<T, RANK> {
        Ok(vec![Some(grad.transpose_axes(self.ax1, self.ax2)?)])
    }
}

// --- MatMulNt ---
/// `y = x · wᵀ` for `x: [M, K]`, `w: [N, K]`.
struct MatMulNtFn;

impl<T: TensorElem> Function<T, 2, 2> for MatMulNtFn {
    type Saved = (Tensor<T, 2, Cpu>, Tensor<T, 2, Cpu>);

    fn name(&self) -> &'static str {
        "matmul_nt"
    }

    fn forward(&self, inputs: &[&Tensor<T, 2, Cpu>]) -> Result<(Tensor<T, 2, Cpu>, Self::Saved)> {
        let [x, w] = arity::<T, 2, 2>("matmul_nt", inputs)?;
        Ok((x.matmul_nt(w)?, (x.clone(), w.clone())))
    }

    fn backward(&self, (x, w): Self::Saved, grad: &Tensor<T, 2, Cpu>) -> Grads<T, 2> {
        // dx = g · w, dw = gᵀ · x
        let dx = grad.matmul(&w)?;
        let dw = grad.transpose()?.matmul(&x)?;
        Ok(vec![Some(dx), Some(dw)])
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Variable<T, RANK> {
    pub fn reshape<const OUT: usize>(&self, shape: [usize; OUT]) -> Result<Variable<T, OUT>> {
        apply(ReshapeFn { shape }, &[self])
    }

    pub fn transpose_axes(&self, ax1: usize, ax2: usize) -> Result<Self> {
        apply(TransposeAxesFn { ax1, ax2 }, &[self])
    }
}

impl<T: TensorElem + 'static> Variable<T, 2> {
    /// `self · wᵀ`, the layout used by linear layers (`w: [out_features, in_features]`).
    pub fn matmul_nt(&self, w: &Self) -> Result<Self> {
        apply(MatMulNtFn, &[self, w])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reshape_backward_restores_shape() {
        let x = Variable::new(Tensor::<f32, 2>::from_fn([2, 3], |i| i as f32));
        let y: Variable<f32, 3> = x.reshape([3, 2, 1]).unwrap();
        assert_eq!(y.shape(), &[3, 2, 1]);

        y.backward_with(Tensor::from_fn([3, 2, 1], |i| i as f32)).unwrap();
        let g = x.grad().unwrap();
        assert_eq!(g.shape(), &[2, 3]);
        assert_eq!(g.data(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_transpose_axes_backward() {
        let x = Variable::new(Tensor::<f32, 3>::from_fn([1, 2, 3], |i| i as f32));
        let y = x.transpose_axes(1, 2).unwrap();
        assert_eq!(y.shape(), &[1, 3, 2]);

        let upstream = Tensor::from_fn([1, 3, 2], |i| i as f32);
        y.backward_with(upstream.clone()).unwrap();
        let expected = upstream.transpose_axes(1, 2).unwrap();
        assert_eq!(x.grad().unwrap().data(), expected.data());
    }

    #[test]
    fn test_matmul_nt_backward() {
        // x: [1, 2], w: [3, 2]
        let x = Variable::new(Tensor::<f64, 2>::new(vec![1.0, 2.0], [1, 2]).unwrap());
        let w = Variable::new(
            Tensor::<f64, 2>::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], [3, 2]).unwrap(),
        );
        let y = x.matmul_nt(&w).unwrap();
        assert_eq!(y.data.data(), &[1.0, 2.0, 3.0]);

        y.backward().unwrap();
        // dx = 1·w summed over rows
        assert_eq!(x.grad().unwrap().data(), &[2.0, 2.0]);
        // dw[n] = x for every output
        assert_eq!(w.grad().unwrap().data(), &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_shape_error_is_propagated() {
        let x = Variable::new(Tensor::<f32, 2>::zeros([2, 3]));
        assert!(x.reshape([4, 2]).is_err());

        let w = Variable::new(Tensor::<f32, 2>::zeros([2, 2]));
        assert!(x.matmul_nt(&w).is_err());
    }
}
