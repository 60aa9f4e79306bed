//! The compute graph the driver steps through.

mod linear;

pub use linear::{EmbeddingSpec, LinearEmbedding};

use crate::{context::TrainingContext, device::SharedBufferSet, error::Result, tensor::Tensor};

/// A trainable model reading its minibatch from the shared buffers.
///
/// Every call reading `buffers` must be finished with them by the time it
/// returns, the driver hands the buffers back to the loader right after.
pub trait ComputeGraph {
    /// Runs one training step on the triplet in `buffers`.
    ///
    /// # Returns
    /// The minibatch cost.
    fn compute_step(&mut self, ctx: &mut TrainingContext, buffers: &SharedBufferSet) -> Result<f32>;

    /// The fraction of misordered triplets in `buffers` under the current weights.
    fn train_error(&mut self, buffers: &SharedBufferSet) -> Result<f32>;

    /// The error and cost of `buffers` without updating the weights.
    fn validation_metrics(&mut self, buffers: &SharedBufferSet) -> Result<(f32, f32)>;

    fn learning_rate(&self) -> f32;
    fn set_learning_rate(&mut self, lr: f32);

    fn weights(&self) -> Vec<Tensor>;
    fn load_weights(&mut self, tensors: &[Tensor]) -> Result<()>;

    fn momentums(&self) -> Vec<Tensor>;
    fn load_momentums(&mut self, tensors: &[Tensor]) -> Result<()>;
}
