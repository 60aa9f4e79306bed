use std::time::Duration;

/// Counters of a training run.
///
/// `wait_time` is time spent blocked on the loader, a pipeline that keeps up
/// keeps it close to zero.
#[derive(Debug, Default, Clone)]
pub struct TrainMetrics {
    pub wait_time: Duration,
    pub compute_time: Duration,

    pub steps: u64,
    pub samples: u64,
    pub validation_batches: u64,
}

impl TrainMetrics {
    #[inline]
    pub fn bump_step(&mut self) {
        self.steps += 1;
    }

    #[inline]
    pub fn add_samples(&mut self, n: usize) {
        self.samples += n as u64;
    }

    #[inline]
    pub fn add_wait(&mut self, d: Duration) {
        self.wait_time += d;
    }

    #[inline]
    pub fn add_compute(&mut self, d: Duration) {
        self.compute_time += d;
    }

    #[inline]
    pub fn bump_validation_batch(&mut self) {
        self.validation_batches += 1;
    }
}
