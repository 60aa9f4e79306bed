use comms::specs::Role;
use ndarray::{Array1, Array2, Axis};
use rand::Rng;

use super::ComputeGraph;
use crate::{
    config::TrainConfig,
    context::{DropoutMode, TrainingContext},
    device::SharedBufferSet,
    error::{PipelineErr, Result},
    tensor::Tensor,
};

const WEIGHTS: &str = "embedding";

/// Hyperparameters of `LinearEmbedding`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbeddingSpec {
    pub input_dim: usize,
    pub embedding_dim: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub margin: f32,
    pub dropout_rate: f32,
}

impl EmbeddingSpec {
    pub fn from_config(cfg: &TrainConfig) -> Self {
        Self {
            input_dim: cfg.buffer_shape().sample_len(),
            embedding_dim: cfg.embedding_dim,
            learning_rate: cfg.learning_rate,
            momentum: cfg.momentum,
            weight_decay: cfg.weight_decay,
            margin: cfg.margin,
            dropout_rate: cfg.dropout_rate,
        }
    }
}

/// A linear projection trained with a triplet hinge loss.
///
/// For a triplet `(q, p, n)` the cost is `max(0, margin + |qW - pW|² - |qW - nW|²)`,
/// averaged over the minibatch. Updates are gradient descent with momentum and
/// weight decay, and dropout masks input features while it's on.
#[derive(Debug, Clone)]
pub struct LinearEmbedding {
    spec: EmbeddingSpec,
    weights: Array2<f32>,
    velocity: Array2<f32>,
}

struct Triplet {
    query: Array2<f32>,
    positive: Array2<f32>,
    negative: Array2<f32>,
}

/// Per-triplet squared distances to the positive and the negative.
struct Distances {
    positive: Array1<f32>,
    negative: Array1<f32>,
}

impl LinearEmbedding {
    /// Creates a model with weights drawn uniformly in `±1/sqrt(input_dim)`.
    pub fn new<R: Rng + ?Sized>(spec: EmbeddingSpec, rng: &mut R) -> Self {
        let scale = 1.0 / (spec.input_dim as f32).sqrt();
        let weights = Array2::from_shape_fn((spec.input_dim, spec.embedding_dim), |_| {
            rng.random_range(-scale..scale)
        });

        Self {
            spec,
            velocity: Array2::zeros(weights.raw_dim()),
            weights,
        }
    }

    fn read_triplet(&self, buffers: &SharedBufferSet) -> Result<Triplet> {
        let shape = buffers.shape();
        if shape.sample_len() != self.spec.input_dim {
            return Err(PipelineErr::Compute(format!(
                "buffers hold {} values per sample, the model expects {}",
                shape.sample_len(),
                self.spec.input_dim
            )));
        }

        let read = |role: Role| -> Result<Array2<f32>> {
            let values = buffers.get(role).read_f32()?;
            Array2::from_shape_vec((shape.batch, shape.sample_len()), values)
                .map_err(|e| PipelineErr::Compute(e.to_string()))
        };

        Ok(Triplet {
            query: read(Role::Query)?,
            positive: read(Role::Positive)?,
            negative: read(Role::Negative)?,
        })
    }

    fn distances(&self, t: &Triplet) -> Distances {
        let q = t.query.dot(&self.weights);
        let p = t.positive.dot(&self.weights);
        let n = t.negative.dot(&self.weights);

        let dp = &q - &p;
        let dn = &q - &n;

        Distances {
            positive: (&dp * &dp).sum_axis(Axis(1)),
            negative: (&dn * &dn).sum_axis(Axis(1)),
        }
    }

    fn hinge(&self, d: &Distances) -> Array1<f32> {
        let margin = self.spec.margin;
        (&d.positive - &d.negative).mapv(|x| (margin + x).max(0.0))
    }

    fn error(d: &Distances) -> f32 {
        let wrong = d
            .positive
            .iter()
            .zip(&d.negative)
            .filter(|(p, n)| p >= n)
            .count();

        wrong as f32 / d.positive.len().max(1) as f32
    }

    fn dropout_mask<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<f32> {
        let keep = 1.0 - self.spec.dropout_rate;
        Array1::from_shape_fn(self.spec.input_dim, |_| {
            if rng.random::<f32>() < keep { 1.0 / keep } else { 0.0 }
        })
    }

    fn load_matrix(&self, tensors: &[Tensor]) -> Result<Array2<f32>> {
        let expected = [self.spec.input_dim, self.spec.embedding_dim];

        let tensor = tensors
            .iter()
            .find(|t| t.name == WEIGHTS)
            .ok_or_else(|| PipelineErr::Compute(format!("no {WEIGHTS} tensor to load")))?;

        if tensor.shape != expected {
            return Err(PipelineErr::Compute(format!(
                "{WEIGHTS} tensor has shape {:?}, expected {expected:?}",
                tensor.shape
            )));
        }

        Array2::from_shape_vec((expected[0], expected[1]), tensor.data.clone())
            .map_err(|e| PipelineErr::Compute(e.to_string()))
    }

    fn to_tensor(m: &Array2<f32>) -> Tensor {
        Tensor::new(WEIGHTS, m.shape().to_vec(), m.iter().copied().collect())
    }
}

impl ComputeGraph for LinearEmbedding {
    fn compute_step(&mut self, ctx: &mut TrainingContext, buffers: &SharedBufferSet) -> Result<f32> {
        let mut t = self.read_triplet(buffers)?;

        if ctx.dropout() == DropoutMode::On && self.spec.dropout_rate > 0.0 {
            let mask = self.dropout_mask(ctx.rng());
            t.query *= &mask;
            t.positive *= &mask;
            t.negative *= &mask;
        }

        let d = self.distances(&t);
        let losses = self.hinge(&d);
        let cost = losses.mean().unwrap_or_default();

        if !cost.is_finite() {
            return Err(PipelineErr::Compute(format!("cost diverged to {cost}")));
        }

        // Only triplets violating the margin contribute to the gradient.
        let active = losses.mapv(|l| if l > 0.0 { 1.0 } else { 0.0 });
        let active = active.view().insert_axis(Axis(1));
        let dp = (&t.query - &t.positive) * &active;
        let dn = (&t.query - &t.negative) * &active;

        let batch = t.query.nrows().max(1) as f32;
        let mut grad = dp.t().dot(&dp.dot(&self.weights)) - dn.t().dot(&dn.dot(&self.weights));
        grad *= 2.0 / batch;
        grad.scaled_add(self.spec.weight_decay, &self.weights);

        let mu = self.spec.momentum;
        let lr = self.spec.learning_rate;

        self.velocity.zip_mut_with(&grad, |v, g| *v = mu * *v + g);
        self.weights.scaled_add(-lr, &self.velocity);

        Ok(cost)
    }

    fn train_error(&mut self, buffers: &SharedBufferSet) -> Result<f32> {
        let t = self.read_triplet(buffers)?;
        Ok(Self::error(&self.distances(&t)))
    }

    fn validation_metrics(&mut self, buffers: &SharedBufferSet) -> Result<(f32, f32)> {
        let t = self.read_triplet(buffers)?;
        let d = self.distances(&t);
        let cost = self.hinge(&d).mean().unwrap_or_default();
        Ok((Self::error(&d), cost))
    }

    #[inline]
    fn learning_rate(&self) -> f32 {
        self.spec.learning_rate
    }

    #[inline]
    fn set_learning_rate(&mut self, lr: f32) {
        self.spec.learning_rate = lr;
    }

    fn weights(&self) -> Vec<Tensor> {
        vec![Self::to_tensor(&self.weights)]
    }

    fn load_weights(&mut self, tensors: &[Tensor]) -> Result<()> {
        self.weights = self.load_matrix(tensors)?;
        Ok(())
    }

    fn momentums(&self) -> Vec<Tensor> {
        vec![Self::to_tensor(&self.velocity)]
    }

    fn load_momentums(&mut self, tensors: &[Tensor]) -> Result<()> {
        self.velocity = self.load_matrix(tensors)?;
        Ok(())
    }
}
