use crate::autograd::Variable;
use crate::error::{Error, Result};
use crate::nn::module::{Parameter, Parameters};
use crate::tensor::{Cpu, Tensor, TensorElem};

/// A bias-free linear layer: `y = x · Wᵀ`.
///
/// The weight is stored as `[out_features, in_features]`, the layout checkpoints use for attention
/// projections.
#[derive(Debug, Clone)]
pub struct Linear<T: TensorElem> {
    pub weight: Variable<T, 2>,
}

impl<T: TensorElem + 'static> Linear<T> {
    pub fn new(weight: Tensor<T, 2, Cpu>) -> Self {
        Self {
            weight: Variable::new(weight),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// A new layer holding a copy of this layer's weights, with its own gradient slot.
    pub fn detached_copy(&self) -> Self {
        Self::new(self.weight.data.clone())
    }

    /// Applies the layer to `[batch, seq, in_features]`.
    pub fn forward(&self, x: &Variable<T, 3>) -> Result<Variable<T, 3>> {
        let [b, s, i] = *x.shape();
        if i != self.in_features() {
            return Err(Error::Config(format!(
                "linear layer expects {} input features, got {i}",
                self.in_features()
            )));
        }
        let flat: Variable<T, 2> = x.reshape([b * s, i])?;
        let y = flat.matmul_nt(&self.weight)?;
        y.reshape([b, s, self.out_features()])
    }
}

impl<T: TensorElem + 'static> Parameters<T> for Linear<T> {
    fn parameters(&self) -> Vec<&dyn Parameter<T>> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut dyn Parameter<T>> {
        vec![&mut self.weight]
    }
}
