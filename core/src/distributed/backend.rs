use crate::error::Result;
use crate::tensor::{Cpu, Tensor, TensorElem};

/// Collective operations over a group of workers.
///
/// Every member of the group must make the same sequence of calls with tensors of the same shape.
pub trait CollectiveBackend: Send + Sync {
    /// Position of this worker in the group.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum of `tensor` over all workers; every worker receives the result.
    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK, Cpu>,
    ) -> Result<Tensor<T, RANK, Cpu>>;

    /// Every worker receives `root`'s copy of `tensor`.
    fn broadcast<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK, Cpu>,
        root: usize,
    ) -> Result<Tensor<T, RANK, Cpu>> {
        let contribution = if self.rank() == root {
            tensor.clone()
        } else {
            Tensor::zeros(*tensor.shape())
        };
        self.all_reduce_sum(&contribution)
    }
}
