use log::info;

use crate::{
    config::{LrPolicyKind, TrainConfig},
    state::ValidationEntry,
};

/// Epochs that pass before the auto policy starts looking at the record.
const AUTO_WARMUP_EPOCHS: usize = 5;

/// How the learning rate evolves between epochs.
#[derive(Debug, Clone, PartialEq)]
pub enum LrPolicy {
    Constant,
    /// Divide by ten at each listed epoch, cycling through the list.
    Step { steps: Vec<usize> },
    /// Divide by ten once the validation error improved less than `threshold`
    /// over the last three epochs.
    Auto { threshold: f32 },
}

/// Adjusts the learning rate at the end of every epoch.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    policy: LrPolicy,
    step_idx: usize,
}

impl LrSchedule {
    pub fn new(policy: LrPolicy) -> Self {
        Self {
            policy,
            step_idx: 0,
        }
    }

    pub fn from_config(cfg: &TrainConfig) -> Self {
        let policy = match cfg.lr_policy {
            LrPolicyKind::Constant => LrPolicy::Constant,
            LrPolicyKind::Step => LrPolicy::Step {
                steps: cfg.lr_step.clone(),
            },
            LrPolicyKind::Auto => LrPolicy::Auto {
                threshold: cfg.lr_adapt_threshold.unwrap_or_default(),
            },
        };

        Self::new(policy)
    }

    #[inline]
    pub fn step_idx(&self) -> usize {
        self.step_idx
    }

    /// Restores the position in the step list after resuming at `load_epoch`.
    pub fn resume(&mut self, load_epoch: usize) {
        if let LrPolicy::Step { steps } = &self.policy {
            let passed = steps.iter().filter(|&&s| s <= load_epoch).count();
            self.step_idx = passed % steps.len().max(1);
        }
    }

    /// Returns the learning rate to use after `epoch`.
    ///
    /// # Arguments
    /// * `epoch` - The epoch that just ended, counted from 1.
    /// * `record` - The validation record including this epoch's entry.
    /// * `lr` - The current learning rate.
    pub fn adjust(&mut self, epoch: usize, record: &[ValidationEntry], lr: f32) -> f32 {
        match &self.policy {
            LrPolicy::Constant => lr,
            LrPolicy::Step { steps } => {
                if steps.get(self.step_idx) != Some(&epoch) {
                    return lr;
                }

                self.step_idx = (self.step_idx + 1) % steps.len();
                let lr = lr / 10.0;
                info!("learning rate changed to {lr}");
                lr
            }
            LrPolicy::Auto { threshold } => {
                if epoch <= AUTO_WARMUP_EPOCHS || record.len() < 3 {
                    return lr;
                }

                let n = record.len();
                let improvement = record[n - 3].error - record[n - 1].error;
                if improvement >= *threshold {
                    return lr;
                }

                let lr = lr / 10.0;
                info!("learning rate changed to {lr}");
                lr
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(error: f32) -> ValidationEntry {
        ValidationEntry {
            error,
            loss: 0.0,
            training_error: 0.0,
        }
    }

    #[test]
    fn step_policy_divides_at_listed_epochs() {
        let mut s = LrSchedule::new(LrPolicy::Step { steps: vec![2, 4] });

        assert_eq!(s.adjust(1, &[], 1.0), 1.0);
        assert_eq!(s.adjust(2, &[], 1.0), 0.1);
        assert_eq!(s.adjust(3, &[], 0.1), 0.1);
        assert!((s.adjust(4, &[], 0.1) - 0.01).abs() < 1e-9);
        assert_eq!(s.step_idx(), 0);
    }

    #[test]
    fn resume_restores_the_step_index() {
        let mut s = LrSchedule::new(LrPolicy::Step { steps: vec![2, 4] });
        s.resume(3);
        assert_eq!(s.step_idx(), 1);
        assert_eq!(s.adjust(4, &[], 1.0), 0.1);
    }

    #[test]
    fn auto_policy_waits_then_reacts_to_a_plateau() {
        let mut s = LrSchedule::new(LrPolicy::Auto { threshold: 0.01 });
        let plateau = [entry(0.5), entry(0.499), entry(0.498)];

        assert_eq!(s.adjust(5, &plateau, 1.0), 1.0);
        assert_eq!(s.adjust(6, &plateau, 1.0), 0.1);

        let improving = [entry(0.5), entry(0.4), entry(0.3)];
        assert_eq!(s.adjust(7, &improving, 1.0), 1.0);
    }

    #[test]
    fn constant_policy_never_changes() {
        let mut s = LrSchedule::new(LrPolicy::Constant);
        assert_eq!(s.adjust(100, &[entry(1.0); 3], 0.5), 0.5);
    }
}
