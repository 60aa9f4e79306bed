use serde::{Deserialize, Serialize};

/// One epoch's validation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationEntry {
    pub error: f32,
    pub loss: f32,
    pub training_error: f32,
}

/// The driver's progress through the run.
#[derive(Debug, Clone, Default)]
pub struct EpochState {
    /// The current epoch, counted from 1.
    pub epoch: usize,

    /// Position within `order` of the minibatch being computed.
    pub minibatch_index: usize,

    /// Presentation order of the training minibatches for this epoch.
    pub order: Vec<usize>,

    pub val_record: Vec<ValidationEntry>,
}

impl EpochState {
    pub fn new(n_minibatches: usize) -> Self {
        Self {
            epoch: 0,
            minibatch_index: 0,
            order: (0..n_minibatches).collect(),
            val_record: Vec::new(),
        }
    }

    /// Global iteration number of the current minibatch.
    #[inline]
    pub fn num_iter(&self) -> usize {
        (self.epoch.saturating_sub(1)) * self.order.len() + self.minibatch_index
    }
}
