//! Reverse-mode automatic differentiation.
//!
//! Operations on [`Variable`]s record a graph of [`GraphNode`]s as they run (define-by-run). Calling
//! [`Variable::backward`] walks that graph in reverse topological order; every node reads the
//! gradient of its output and accumulates gradients into the [`GradCell`]s of its inputs.
//!
//! Custom differentiable operations implement the explicit [`Function`] interface
//! (`forward(inputs) -> (output, saved)` / `backward(saved, grad) -> input grads`) and are
//! registered with [`function::apply`].
//!
//! ```rust
//! use ringtrain::autograd::Variable;
//! use ringtrain::tensor::Tensor;
//!
//! let x = Variable::new(Tensor::<f64, 2>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap());
//! let w = Variable::new(Tensor::<f64, 2>::new(vec![1.0, 0.0, 0.0, 1.0], [2, 2]).unwrap());
//! let y = x.matmul_nt(&w).unwrap();
//! y.backward().unwrap();
//! assert_eq!(x.grad().unwrap().data(), &[1.0, 1.0, 1.0, 1.0]);
//! ```

use crate::error::Result;
use crate::tensor::{Cpu, Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

pub mod engine;
pub mod function;
pub mod ops;

pub use function::{Function, apply};

/// A node in the computation graph.
pub trait GraphNode: Debug {
    /// Propagates the gradient of this node's output to its inputs.
    fn backward(&self) -> Result<()>;
    /// Nodes that produced this node's inputs.
    fn parents(&self) -> Vec<Rc<dyn GraphNode>>;
}

/// Callback run on every gradient contribution before it is accumulated.
///
/// Hooks see the gradient flattened to rank 1 so one hook type serves parameters of any rank.
pub type GradHook<T> = Rc<dyn Fn(Tensor<T, 1, Cpu>) -> Result<Tensor<T, 1, Cpu>>>;

/// Shared gradient slot of a variable, plus the hooks registered on it.
pub struct GradCell<T: TensorElem, const RANK: usize> {
    value: RefCell<Option<Tensor<T, RANK, Cpu>>>,
    hooks: RefCell<Vec<GradHook<T>>>,
}

impl<T: TensorElem, const RANK: usize> GradCell<T, RANK> {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            value: RefCell::new(None),
            hooks: RefCell::new(Vec::new()),
        })
    }

    /// Current accumulated gradient.
    pub fn get(&self) -> Option<Tensor<T, RANK, Cpu>> {
        self.value.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.value.borrow().is_some()
    }

    pub fn set(&self, grad: Option<Tensor<T, RANK, Cpu>>) {
        *self.value.borrow_mut() = grad;
    }

    pub fn take(&self) -> Option<Tensor<T, RANK, Cpu>> {
        self.value.borrow_mut().take()
    }

    pub fn register_hook(&self, hook: GradHook<T>) {
        self.hooks.borrow_mut().push(hook);
    }

    pub fn num_hooks(&self) -> usize {
        self.hooks.borrow().len()
    }

    /// Runs the hooks on `grad`, then adds the result to the stored gradient.
    pub fn accumulate(&self, grad: Tensor<T, RANK, Cpu>) -> Result<()> {
        let grad = self.run_hooks(grad)?;
        let mut slot = self.value.borrow_mut();
        *slot = Some(match slot.take() {
            Some(current) => (&current + &grad)?,
            None => grad,
        });
        Ok(())
    }

    fn run_hooks(&self, grad: Tensor<T, RANK, Cpu>) -> Result<Tensor<T, RANK, Cpu>> {
        let hooks = self.hooks.borrow().clone();
        if hooks.is_empty() {
            return Ok(grad);
        }
        let shape = *grad.shape();
        let mut flat = grad.reshape([shape.iter().product()])?;
        for hook in &hooks {
            flat = hook(flat)?;
        }
        Ok(flat.reshape(shape)?)
    }
}

impl<T: TensorElem, const RANK: usize> Debug for GradCell<T, RANK> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradCell")
            .field("value", &self.value.borrow())
            .field("hooks", &self.hooks.borrow().len())
            .finish()
    }
}

/// A tensor tracked by the autograd graph.
#[derive(Clone, Debug)]
pub struct Variable<T, const RANK: usize>
where
    T: TensorElem,
{
    pub data: Tensor<T, RANK, Cpu>,
    pub grad: Rc<GradCell<T, RANK>>,
    /// The node that produced this variable; `None` for leaves.
    pub node: Option<Rc<dyn GraphNode>>,
}

impl<T, const RANK: usize> Variable<T, RANK>
where
    T: TensorElem + 'static,
{
    /// Creates a leaf variable (weights, inputs).
    pub fn new(data: Tensor<T, RANK, Cpu>) -> Self {
        Self {
            data,
            grad: GradCell::new(),
            node: None,
        }
    }

    /// Creates the output variable of an operation.
    pub fn from_op(
        data: Tensor<T, RANK, Cpu>,
        grad: Rc<GradCell<T, RANK>>,
        node: Rc<dyn GraphNode>,
    ) -> Self {
        Self {
            data,
            grad,
            node: Some(node),
        }
    }

    pub fn shape(&self) -> &[usize; RANK] {
        self.data.shape()
    }

    pub fn grad(&self) -> Option<Tensor<T, RANK, Cpu>> {
        self.grad.get()
    }

    pub fn zero_grad(&self) {
        self.grad.set(None);
    }

    pub fn is_leaf(&self) -> bool {
        self.node.is_none()
    }

    /// Backward pass seeded with ones (the usual case for a scalar loss).
    pub fn backward(&self) -> Result<()> {
        if !self.grad.is_set() {
            self.grad.set(Some(Tensor::ones(*self.data.shape())));
        }
        engine::backward(self.node.clone())
    }

    /// Backward pass seeded with an explicit upstream gradient.
    pub fn backward_with(&self, grad: Tensor<T, RANK, Cpu>) -> Result<()> {
        if grad.shape() != self.data.shape() {
            return Err(crate::tensor::TensorError::ShapeMismatch {
                expected: self.data.shape().to_vec(),
                got: grad.shape().to_vec(),
            }
            .into());
        }
        self.grad.set(Some(grad));
        engine::backward(self.node.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_creation() {
        let data = Tensor::new(vec![1.0, 2.0], [2]).unwrap();
        let var = Variable::new(data.clone());

        assert_eq!(var.data.data(), data.data());
        assert!(var.grad().is_none());
        assert!(var.is_leaf());
    }

    #[test]
    fn test_leaf_backward_seeds_ones() {
        let var = Variable::new(Tensor::<f32, 1>::new(vec![1.0], [1]).unwrap());
        var.backward().unwrap();
        assert_eq!(var.grad().unwrap().data(), &[1.0]);
    }

    #[test]
    fn test_backward_with_rejects_wrong_shape() {
        let var = Variable::new(Tensor::<f32, 1>::zeros([2]));
        let err = var.backward_with(Tensor::zeros([3]));
        assert!(err.is_err());
    }

    #[test]
    fn test_grad_cell_accumulates() {
        let cell = GradCell::<f32, 1>::new();
        cell.accumulate(Tensor::new(vec![1.0, 2.0], [2]).unwrap()).unwrap();
        cell.accumulate(Tensor::new(vec![0.5, 0.5], [2]).unwrap()).unwrap();
        assert_eq!(cell.get().unwrap().data(), &[1.5, 2.5]);
    }

    #[test]
    fn test_hooks_run_in_order_on_flattened_grad() {
        let cell = GradCell::<f32, 2>::new();
        cell.register_hook(Rc::new(|g: Tensor<f32, 1>| -> Result<Tensor<f32, 1>> {
            assert_eq!(g.shape(), &[4]);
            Ok(g.scale(2.0))
        }));
        cell.register_hook(Rc::new(|g: Tensor<f32, 1>| -> Result<Tensor<f32, 1>> {
            Ok(g.map(|x| x + 1.0))
        }));
        assert_eq!(cell.num_hooks(), 2);

        cell.accumulate(Tensor::ones([2, 2])).unwrap();
        let g = cell.get().unwrap();
        assert_eq!(g.shape(), &[2, 2]);
        assert_eq!(g.data(), &[3.0; 4]);
    }

    #[test]
    fn test_hook_error_propagates() {
        let cell = GradCell::<f32, 1>::new();
        cell.register_hook(Rc::new(|_: Tensor<f32, 1>| -> Result<Tensor<f32, 1>> {
            Err(crate::Error::Autograd("boom".into()))
        }));
        assert!(cell.accumulate(Tensor::ones([1])).is_err());
        assert!(cell.get().is_none());
    }
}
