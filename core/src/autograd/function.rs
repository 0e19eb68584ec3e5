//! Custom differentiable operations.
//!
//! A [`Function`] pairs a forward computation with its backward rule. The forward returns the
//! output together with whatever it needs to keep for the backward (`Saved`); [`apply`] runs the
//! forward and records a node that hands `Saved` back exactly once.

use super::{GradCell, GraphNode, Variable};
use crate::error::{Error, Result};
use crate::tensor::{Cpu, Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

/// A differentiable operation from `IN`-rank inputs to one `OUT`-rank output.
pub trait Function<T: TensorElem, const IN: usize, const OUT: usize> {
    /// State kept between forward and backward.
    type Saved;

    /// Short name used in debug output.
    fn name(&self) -> &'static str;

    fn forward(
        &self,
        inputs: &[&Tensor<T, IN, Cpu>],
    ) -> Result<(Tensor<T, OUT, Cpu>, Self::Saved)>;

    /// Returns one entry per input; `None` means the input receives no gradient.
    fn backward(
        &self,
        saved: Self::Saved,
        grad_output: &Tensor<T, OUT, Cpu>,
    ) -> Result<Vec<Option<Tensor<T, IN, Cpu>>>>;
}

struct FunctionNode<F, T, const IN: usize, const OUT: usize>
where
    F: Function<T, IN, OUT>,
    T: TensorElem,
{
    func: F,
    saved: RefCell<Option<F::Saved>>,
    input_grads: Vec<Rc<GradCell<T, IN>>>,
    out_grad: Rc<GradCell<T, OUT>>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<F, T, const IN: usize, const OUT: usize> Debug for FunctionNode<F, T, IN, OUT>
where
    F: Function<T, IN, OUT>,
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionNode")
            .field("func", &self.func.name())
            .field("inputs", &self.input_grads.len())
            .field("saved", &self.saved.borrow().is_some())
            .finish()
    }
}

impl<F, T, const IN: usize, const OUT: usize> GraphNode for FunctionNode<F, T, IN, OUT>
where
    F: Function<T, IN, OUT>,
    T: TensorElem,
{
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.get() else {
            return Ok(());
        };
        let saved = self.saved.borrow_mut().take().ok_or_else(|| {
            Error::Autograd(format!(
                "{}: backward called twice on the same graph",
                self.func.name()
            ))
        })?;

        let grads = self.func.backward(saved, &grad)?;
        if grads.len() != self.input_grads.len() {
            return Err(Error::Autograd(format!(
                "{}: backward returned {} gradients for {} inputs",
                self.func.name(),
                grads.len(),
                self.input_grads.len()
            )));
        }

        for (g, cell) in grads.into_iter().zip(&self.input_grads) {
            if let Some(g) = g {
                cell.accumulate(g)?;
            }
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// Runs `func` forward on `inputs` and records it in the graph.
pub fn apply<F, T, const IN: usize, const OUT: usize>(
    func: F,
    inputs: &[&Variable<T, IN>],
) -> Result<Variable<T, OUT>>
where
    F: Function<T, IN, OUT> + 'static,
    F::Saved: 'static,
    T: TensorElem + 'static,
{
    let tensors: Vec<&Tensor<T, IN, Cpu>> = inputs.iter().map(|v| &v.data).collect();
    let (output, saved) = func.forward(&tensors)?;

    let out_grad = GradCell::new();
    let node = Rc::new(FunctionNode {
        func,
        saved: RefCell::new(Some(saved)),
        input_grads: inputs.iter().map(|v| v.grad.clone()).collect(),
        out_grad: out_grad.clone(),
        parents: inputs.iter().filter_map(|v| v.node.clone()).collect(),
    });

    Ok(Variable::from_op(output, out_grad, node))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = a * x + b, element-wise.
    struct Affine;

    impl Function<f64, 1, 1> for Affine {
        type Saved = (Tensor<f64, 1>, Tensor<f64, 1>);

        fn name(&self) -> &'static str {
            "affine"
        }

        fn forward(&self, inputs: &[&Tensor<f64, 1>]) -> Result<(Tensor<f64, 1>, Self::Saved)> {
            let [a, x, b] = inputs else {
                return Err(Error::Autograd("affine takes three inputs".into()));
            };
            let y = (&(*a * *x)? + *b)?;
            Ok((y, ((*a).clone(), (*x).clone())))
        }

        fn backward(
            &self,
            (a, x): Self::Saved,
            grad: &Tensor<f64, 1>,
        ) -> Result<Vec<Option<Tensor<f64, 1>>>> {
            Ok(vec![
                Some((&x * grad)?),
                Some((&a * grad)?),
                Some(grad.clone()),
            ])
        }
    }

    fn leaf(v: &[f64]) -> Variable<f64, 1> {
        Variable::new(Tensor::new(v.to_vec(), [v.len()]).unwrap())
    }

    #[test]
    fn test_apply_records_and_backpropagates() {
        let a = leaf(&[2.0, 3.0]);
        let x = leaf(&[5.0, 7.0]);
        let b = leaf(&[1.0, 1.0]);

        let y = apply(Affine, &[&a, &x, &b]).unwrap();
        assert_eq!(y.data.data(), &[11.0, 22.0]);

        y.backward().unwrap();
        assert_eq!(a.grad().unwrap().data(), &[5.0, 7.0]);
        assert_eq!(x.grad().unwrap().data(), &[2.0, 3.0]);
        assert_eq!(b.grad().unwrap().data(), &[1.0, 1.0]);
    }

    #[test]
    fn test_chained_functions_accumulate_shared_input() {
        // z = a*(a*x + b) + b, with x used once and a, b used twice.
        let a = leaf(&[2.0]);
        let x = leaf(&[3.0]);
        let b = leaf(&[1.0]);

        let y = apply(Affine, &[&a, &x, &b]).unwrap();
        let z = apply(Affine, &[&a, &y, &b]).unwrap();
        z.backward().unwrap();

        // dz/dx = a^2 = 4, dz/db = a + 1 = 3, dz/da = y + a*x = 7 + 6 = 13
        assert_eq!(x.grad().unwrap().data(), &[4.0]);
        assert_eq!(b.grad().unwrap().data(), &[3.0]);
        assert_eq!(a.grad().unwrap().data(), &[13.0]);
    }

    #[test]
    fn test_second_backward_is_an_error() {
        let a = leaf(&[1.0]);
        let x = leaf(&[1.0]);
        let b = leaf(&[1.0]);
        let y = apply(Affine, &[&a, &x, &b]).unwrap();

        y.backward().unwrap();
        let err = y.backward().unwrap_err();
        assert!(matches!(err, Error::Autograd(_)));
    }
}
