//! The training loop.
//!
//! Per epoch: shuffle, resume (first epoch only), prime the feed, then for every
//! minibatch wait for it, launch compute, request the next one and release the
//! buffers. The last minibatch of a pass requests nothing and releases nothing,
//! the next pass's prime does. Validation, the learning-rate policy and
//! snapshots follow each epoch.

use std::time::Instant;

use comms::specs::AugmentParams;
use log::{debug, info, warn};
use rand::seq::SliceRandom;

use crate::{
    checkpoint::CheckpointStore,
    compute::ComputeGraph,
    config::TrainConfig,
    context::{DropoutMode, TrainingContext},
    data::{self, TripletFiles},
    device::SharedBufferSet,
    error::{PipelineErr, Result},
    feed::{MinibatchFeed, RequestPair},
    metrics::TrainMetrics,
    schedule::LrSchedule,
    state::{EpochState, ValidationEntry},
};

const TIMING_WINDOW: usize = 20;

/// Which file lists a validation pass reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Training,
    Validation,
}

/// Drives the model through the epochs, pulling minibatches from a feed.
pub struct Driver<G, S, F> {
    cfg: TrainConfig,
    ctx: TrainingContext,
    graph: G,
    store: S,
    feed: F,
    buffers: SharedBufferSet,
    train: TripletFiles,
    val: TripletFiles,
    schedule: LrSchedule,
    state: EpochState,
    metrics: TrainMetrics,
}

impl<G, S, F> Driver<G, S, F>
where
    G: ComputeGraph,
    S: CheckpointStore,
    F: MinibatchFeed,
{
    /// Creates a driver over already built collaborators.
    ///
    /// # Errors
    /// Returns `PipelineErr::Config` if the training set doesn't hold a single
    /// full minibatch or the buffers don't fit the configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: TrainConfig,
        ctx: TrainingContext,
        graph: G,
        store: S,
        feed: F,
        buffers: SharedBufferSet,
        train: TripletFiles,
        val: TripletFiles,
    ) -> Result<Self> {
        let n_minibatches = train.n_minibatches(cfg.batch_size);
        if n_minibatches == 0 {
            return Err(PipelineErr::Config(format!(
                "the training set holds fewer than {} samples",
                cfg.batch_size
            )));
        }

        if buffers.shape() != cfg.buffer_shape() {
            return Err(PipelineErr::Config(format!(
                "buffers of shape {:?} don't fit the configured {:?}",
                buffers.shape(),
                cfg.buffer_shape()
            )));
        }

        Ok(Self {
            schedule: LrSchedule::from_config(&cfg),
            state: EpochState::new(n_minibatches),
            metrics: TrainMetrics::default(),
            cfg,
            ctx,
            graph,
            store,
            feed,
            buffers,
            train,
            val,
        })
    }

    #[inline]
    pub fn state(&self) -> &EpochState {
        &self.state
    }

    #[inline]
    pub fn metrics(&self) -> &TrainMetrics {
        &self.metrics
    }

    #[inline]
    pub fn graph(&self) -> &G {
        &self.graph
    }

    #[inline]
    pub fn feed(&self) -> &F {
        &self.feed
    }

    /// Runs every configured epoch and terminates the feed.
    pub async fn run(&mut self) -> Result<()> {
        let n_epochs = self.cfg.n_epochs.get();
        let mut epoch = 0;

        while epoch < n_epochs {
            epoch += 1;
            self.shuffle();

            if self.cfg.resume_train && epoch == 1 {
                epoch = self.resume()?;
            }

            self.state.epoch = epoch;
            self.train_epoch().await?;
            self.end_epoch(epoch).await?;
        }

        self.feed.terminate().await?;

        info!(
            steps = self.metrics.steps,
            samples = self.metrics.samples;
            "optimization complete, waited {:?} on the loader and computed for {:?}",
            self.metrics.wait_time,
            self.metrics.compute_time
        );

        Ok(())
    }

    fn shuffle(&mut self) {
        if self.cfg.shuffle {
            self.state.order.shuffle(self.ctx.rng());
        }
    }

    /// Restores the training state saved at `load_epoch`.
    ///
    /// # Returns
    /// The epoch to continue from.
    fn resume(&mut self) -> Result<usize> {
        let load_epoch = self
            .cfg
            .load_epoch
            .ok_or_else(|| PipelineErr::Config("resuming needs load_epoch".into()))?;

        let weights = self.store.load_weights(load_epoch)?;
        self.graph.load_weights(&weights)?;

        let lr = self.store.load_learning_rate(load_epoch)?;
        self.graph.set_learning_rate(lr);

        self.state.val_record = self.store.load_validation_record()?;

        let momentums = self.store.load_momentums(load_epoch)?;
        self.graph.load_momentums(&momentums)?;

        self.schedule.resume(load_epoch);

        info!("resumed from epoch {load_epoch} with learning rate {lr}");
        Ok(load_epoch + 1)
    }

    fn train_pair(&mut self, minibatch: usize) -> RequestPair {
        let query = data::rand3d(self.ctx.rng());
        let positive = data::rand3d(self.ctx.rng());
        let (a, b) = self.train.minibatch(minibatch, self.cfg.batch_size);

        RequestPair::new(a, b, query, positive)
    }

    fn center_pair(&self, split: Split, minibatch: usize) -> RequestPair {
        let files = match split {
            Split::Training => &self.train,
            Split::Validation => &self.val,
        };

        let (a, b) = files.minibatch(minibatch, self.cfg.batch_size);
        RequestPair::new(a, b, AugmentParams::CENTER, AugmentParams::CENTER)
    }

    /// Trains over every minibatch of the current order once.
    pub async fn train_epoch(&mut self) -> Result<()> {
        let n = self.state.order.len();

        self.state.minibatch_index = 0;
        let first = self.train_pair(self.state.order[0]);
        self.feed.prime(first).await?;

        let mut window = Instant::now();

        for count in 0..n {
            self.state.minibatch_index = count;
            if count == 0 {
                window = Instant::now();
            }

            let waited = Instant::now();
            self.feed.ready(&mut self.buffers).await?;
            self.metrics.add_wait(waited.elapsed());

            let started = Instant::now();
            let cost = self.graph.compute_step(&mut self.ctx, &self.buffers)?;
            self.metrics.add_compute(started.elapsed());
            self.metrics.bump_step();
            self.metrics.add_samples(self.cfg.batch_size);

            let more = count + 1 < n;
            if more {
                let next = self.train_pair(self.state.order[count + 1]);
                self.feed.request(next).await?;
            }

            // Reporting may read the live buffers, so it goes before the release.
            self.report(cost)?;

            if more {
                self.feed.calc_finished().await?;
            }

            if count + 1 == TIMING_WINDOW {
                info!("time per {TIMING_WINDOW} iter: {:.3}s", window.elapsed().as_secs_f32());
            }
        }

        Ok(())
    }

    fn report(&mut self, cost: f32) -> Result<()> {
        let num_iter = self.state.num_iter();
        if num_iter % self.cfg.print_freq.get() != 0 {
            return Ok(());
        }

        if self.cfg.print_train_error {
            let error = self.graph.train_error(&self.buffers)?;
            info!(
                "training @ iter {num_iter}, cost: {cost:.6}, error: {:.2}%",
                error * 100.0
            );
        } else {
            info!("training @ iter {num_iter}, cost: {cost:.6}");
        }

        Ok(())
    }

    /// Measures the model on the first `validation_limit` minibatches of `split`.
    ///
    /// Uses the same feed protocol as training with center crops.
    ///
    /// # Returns
    /// The mean error and the mean cost.
    pub async fn validate(&mut self, split: Split) -> Result<(f32, f32)> {
        let files = match split {
            Split::Training => &self.train,
            Split::Validation => &self.val,
        };

        let n = files
            .n_minibatches(self.cfg.batch_size)
            .min(self.cfg.validation_limit);

        if n == 0 {
            warn!("no {split:?} minibatch to validate on");
            return Ok((0.0, 0.0));
        }

        let first = self.center_pair(split, 0);
        self.feed.prime(first).await?;

        let (mut error_sum, mut loss_sum) = (0.0, 0.0);
        for i in 0..n {
            self.feed.ready(&mut self.buffers).await?;

            let (error, loss) = self.graph.validation_metrics(&self.buffers)?;
            error_sum += error;
            loss_sum += loss;
            self.metrics.bump_validation_batch();

            if i + 1 < n {
                let next = self.center_pair(split, i + 1);
                self.feed.request(next).await?;
                self.feed.calc_finished().await?;
            }
        }

        debug!("validated {n} {split:?} minibatches");
        Ok((error_sum / n as f32, loss_sum / n as f32))
    }

    async fn end_epoch(&mut self, epoch: usize) -> Result<()> {
        self.ctx.set_dropout(DropoutMode::Off);
        let (error, loss) = self.validate(Split::Validation).await?;
        let (training_error, _) = self.validate(Split::Training).await?;
        self.ctx.set_dropout(DropoutMode::On);

        info!(
            "epoch {epoch}: validation loss: {loss:.6}, error: {:.2}%, training set error: {:.2}%",
            error * 100.0,
            training_error * 100.0
        );

        self.state.val_record.push(ValidationEntry {
            error,
            loss,
            training_error,
        });
        self.store.save_validation_record(&self.state.val_record)?;

        let lr = self
            .schedule
            .adjust(epoch, &self.state.val_record, self.graph.learning_rate());
        self.graph.set_learning_rate(lr);

        if let Some(freq) = self.cfg.snapshot_freq {
            if epoch % freq.get() == 0 {
                self.snapshot(epoch)?;
            }
        }

        Ok(())
    }

    fn snapshot(&mut self, epoch: usize) -> Result<()> {
        self.store.save_weights(epoch, &self.graph.weights())?;
        self.store
            .save_learning_rate(epoch, self.graph.learning_rate())?;
        self.store.save_momentums(epoch, &self.graph.momentums())?;

        info!("saved the epoch {epoch} snapshot");
        Ok(())
    }
}
