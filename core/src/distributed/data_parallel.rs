//! Data-parallel gradient synchronization.
//!
//! [`DataParallel`] wraps a model replica and installs one gradient hook per parameter. While
//! synchronization is enabled, every gradient contribution is summed over the data-parallel group
//! and divided by the group size as it is produced, so after `backward` each replica holds the
//! group-average gradient. Inside a [`no_sync`](DataParallel::no_sync) scope the hooks pass
//! gradients through untouched, which is how gradient accumulation over micro-batches avoids
//! communicating on every step.

use super::backend::CollectiveBackend;
use crate::autograd::GradHook;
use crate::error::Result;
use crate::kernels::block::to_elem;
use crate::nn::module::Parameters;
use crate::tensor::{Cpu, Tensor, TensorElem};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info};

/// Model replica whose gradients are averaged across a data-parallel group.
pub struct DataParallel<M, B> {
    module: M,
    backend: Arc<B>,
    sync: Rc<Cell<bool>>,
}

impl<M, B> std::fmt::Debug for DataParallel<M, B>
where
    M: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataParallel")
            .field("module", &self.module)
            .field("sync", &self.sync.get())
            .finish()
    }
}

fn average_hook<T, B>(backend: Arc<B>, sync: Rc<Cell<bool>>) -> GradHook<T>
where
    T: TensorElem + 'static,
    B: CollectiveBackend + 'static,
{
    Rc::new(move |grad: Tensor<T, 1, Cpu>| -> Result<Tensor<T, 1, Cpu>> {
        if !sync.get() {
            return Ok(grad);
        }
        let world: T = to_elem(backend.world_size() as f64)?;
        let summed = backend.all_reduce_sum(&grad)?;
        Ok(summed.map(|x| x / world))
    })
}

impl<M, B> DataParallel<M, B>
where
    B: CollectiveBackend + 'static,
{
    /// Wraps `module` and hooks every one of its parameters.
    pub fn new<T>(module: M, backend: Arc<B>) -> Self
    where
        M: Parameters<T>,
        T: TensorElem + 'static,
    {
        let sync = Rc::new(Cell::new(true));
        let mut hooked = 0usize;
        for p in module.parameters() {
            p.register_grad_hook(average_hook(backend.clone(), sync.clone()));
            hooked += 1;
        }
        info!(
            rank = backend.rank(),
            world_size = backend.world_size(),
            parameters = hooked,
            "data parallel gradient hooks installed"
        );

        Self {
            module,
            backend,
            sync,
        }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    /// Mutable access to the replica, e.g. for an optimizer step.
    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    /// Whether gradients produced now are averaged across the group.
    pub fn require_backward_grad_sync(&self) -> bool {
        self.sync.get()
    }

    /// Runs the wrapped model; the wrapper adds nothing to the forward pass.
    pub fn forward<I, O, F>(&self, input: I, forward: F) -> Result<O>
    where
        F: FnOnce(&M, I) -> Result<O>,
    {
        forward(&self.module, input)
    }

    /// Disables synchronization until the returned guard is dropped.
    ///
    /// The guard restores whatever state was active when it was created, so scopes nest.
    pub fn no_sync_guard(&self) -> NoSyncGuard {
        let previous = self.sync.replace(false);
        debug!(previous, "gradient sync suspended");
        NoSyncGuard {
            sync: self.sync.clone(),
            previous,
        }
    }

    /// Runs `f` with synchronization disabled. Synchronization is restored when `f` returns, fails
    /// or panics.
    pub fn no_sync<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Self) -> Result<R>,
    {
        let _guard = self.no_sync_guard();
        f(self)
    }

    /// Overwrites every parameter with the copy held by rank `root`.
    pub fn broadcast_parameters<T>(&mut self, root: usize) -> Result<()>
    where
        M: Parameters<T>,
        T: TensorElem + 'static,
    {
        for p in self.module.parameters_mut() {
            let local = p.flat_data()?;
            let shared = self.backend.broadcast(&local, root)?;
            p.load_flat(shared)?;
        }
        debug!(root, "parameters broadcast");
        Ok(())
    }
}

/// Re-enables gradient synchronization (to its previous state) when dropped.
#[must_use = "synchronization is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct NoSyncGuard {
    sync: Rc<Cell<bool>>,
    previous: bool,
}

impl Drop for NoSyncGuard {
    fn drop(&mut self) {
        self.sync.set(self.previous);
    }
}
