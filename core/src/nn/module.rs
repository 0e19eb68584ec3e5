use crate::autograd::{GradHook, Variable};
use crate::error::Result;
use crate::tensor::{Cpu, Tensor, TensorElem};

/// A trainable tensor, seen independently of its rank.
///
/// Gradient hooks, data and gradients are exchanged flattened so one interface covers weights of
/// every rank.
pub trait Parameter<T: TensorElem> {
    fn numel(&self) -> usize;

    /// Adds a hook run on every gradient contribution before it is accumulated.
    fn register_grad_hook(&self, hook: GradHook<T>);

    fn flat_data(&self) -> Result<Tensor<T, 1, Cpu>>;

    /// Overwrites the values, keeping the shape.
    fn load_flat(&mut self, data: Tensor<T, 1, Cpu>) -> Result<()>;

    fn flat_grad(&self) -> Result<Option<Tensor<T, 1, Cpu>>>;

    fn zero_grad(&self);
}

impl<T: TensorElem + 'static, const RANK: usize> Parameter<T> for Variable<T, RANK> {
    fn numel(&self) -> usize {
        self.data.size()
    }

    fn register_grad_hook(&self, hook: GradHook<T>) {
        self.grad.register_hook(hook);
    }

    fn flat_data(&self) -> Result<Tensor<T, 1, Cpu>> {
        Ok(self.data.clone().reshape([self.numel()])?)
    }

    fn load_flat(&mut self, data: Tensor<T, 1, Cpu>) -> Result<()> {
        self.data = data.reshape(*self.data.shape())?;
        Ok(())
    }

    fn flat_grad(&self) -> Result<Option<Tensor<T, 1, Cpu>>> {
        let numel = self.numel();
        Ok(self.grad().map(|g| g.reshape([numel])).transpose()?)
    }

    fn zero_grad(&self) {
        Variable::zero_grad(self);
    }
}

/// Anything that owns trainable parameters (layers, whole models).
///
/// Both methods must list the parameters in the same, deterministic order; data-parallel replicas
/// rely on it to pair up tensors across workers.
pub trait Parameters<T: TensorElem> {
    fn parameters(&self) -> Vec<&dyn Parameter<T>>;

    fn parameters_mut(&mut self) -> Vec<&mut dyn Parameter<T>>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }
}
