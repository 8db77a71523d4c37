//! Interfaces of the collaborators the training loop drives

use bytes::Bytes;

use params::ParameterSet;
use runtime_core::Result;
use sampler::WorkItem;

/// Turns scheduled work items into fully materialized batches
///
/// Any prefetching happens behind this trait; the loop only ever sees a
/// finished batch.
pub trait DataLoader: Send {
    type Batch: Send;

    fn load(&mut self, item: &WorkItem) -> Result<Self::Batch>;
}

/// The function being trained, evaluated on this rank's parameter slices
pub trait Model<B>: Send {
    /// Scalar loss of `batch` under `params`
    fn forward(&mut self, params: &ParameterSet, batch: &B) -> Result<f32>;

    /// Accumulate the gradient of the last loss into `grads`
    fn backward(&mut self, params: &ParameterSet, batch: &B, grads: &mut ParameterSet)
        -> Result<()>;
}

/// Updates live parameters from gradients
///
/// Its state is opaque to the loop and passed through checkpoints as bytes.
pub trait Optimizer: Send {
    /// Bind per-parameter state to `params`, validating any restored state
    fn attach(&mut self, params: &ParameterSet) -> Result<()>;

    fn zero_grad(&mut self, grads: &mut ParameterSet) {
        for (_, shard) in grads.iter_mut() {
            shard.tensor.data_mut().fill(0.0);
        }
    }

    fn step(&mut self, params: &mut ParameterSet, grads: &ParameterSet) -> Result<()>;

    fn state(&self) -> Result<Bytes>;

    fn load_state(&mut self, state: &[u8]) -> Result<()>;
}
