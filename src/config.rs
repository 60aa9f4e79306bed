use std::{fs, num::NonZeroUsize, path::{Path, PathBuf}};

use comms::specs::{BufferShape, DType};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineErr, Result};

/// Learning-rate policy selector, see `schedule::LrSchedule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrPolicyKind {
    /// Divide by ten at the epochs listed in `lr_step`.
    Step,
    /// Divide by ten when the validation error stops improving.
    Auto,
    #[default]
    Constant,
}

/// The validated training configuration.
///
/// Unknown keys are rejected and every required key must be present, so a bad
/// configuration fails at startup instead of at first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    pub gpu_device_id: u32,
    pub n_epochs: NonZeroUsize,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub resume_train: bool,
    #[serde(default)]
    pub load_epoch: Option<usize>,
    #[serde(default = "default_print_freq")]
    pub print_freq: NonZeroUsize,
    #[serde(default)]
    pub print_train_error: bool,
    #[serde(default = "default_true")]
    pub batch_crop_mirror: bool,
    #[serde(default = "default_true")]
    pub para_load: bool,
    #[serde(default)]
    pub sock_data: Option<String>,

    pub batch_size: usize,
    pub channels: usize,
    pub raw_size: usize,
    pub crop_size: usize,
    #[serde(default)]
    pub dtype: DType,

    pub train_a_dir: PathBuf,
    pub train_b_dir: PathBuf,
    pub val_a_dir: PathBuf,
    pub val_b_dir: PathBuf,
    #[serde(default)]
    pub mean_file: Option<PathBuf>,
    pub weights_dir: PathBuf,
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,

    #[serde(default = "default_validation_limit")]
    pub validation_limit: usize,
    #[serde(default)]
    pub snapshot_freq: Option<NonZeroUsize>,

    pub learning_rate: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "default_margin")]
    pub margin: f32,
    #[serde(default)]
    pub dropout_rate: f32,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    #[serde(default)]
    pub lr_policy: LrPolicyKind,
    #[serde(default)]
    pub lr_step: Vec<usize>,
    #[serde(default)]
    pub lr_adapt_threshold: Option<f32>,

    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_print_freq() -> NonZeroUsize {
    NonZeroUsize::new(20).unwrap_or(NonZeroUsize::MIN)
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

fn default_validation_limit() -> usize {
    500
}

fn default_momentum() -> f32 {
    0.9
}

fn default_margin() -> f32 {
    1.0
}

fn default_embedding_dim() -> usize {
    128
}

impl TrainConfig {
    /// Reads and validates the configuration at `path`.
    ///
    /// # Errors
    /// Returns `PipelineErr::Config` if the file can't be read, parsed or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| PipelineErr::Config(format!("cannot read {}: {e}", path.display())))?;

        Self::from_json_str(&content)
    }

    /// Parses and validates a configuration from its JSON text.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let cfg: TrainConfig = serde_json::from_str(content)
            .map_err(|e| PipelineErr::Config(format!("invalid JSON: {e}")))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the cross-key invariants serde can't express.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PipelineErr::Config(msg));

        if self.batch_size < 2 {
            return invalid(format!(
                "batch_size ({}) must be at least 2 to pair in-batch negatives",
                self.batch_size
            ));
        }

        if self.channels == 0 || self.crop_size == 0 {
            return invalid("channels and crop_size must be greater than 0".into());
        }

        if self.crop_size > self.raw_size {
            return invalid(format!(
                "crop_size ({}) cannot exceed raw_size ({})",
                self.crop_size, self.raw_size
            ));
        }

        if self.para_load && self.sock_data.is_none() {
            return invalid("sock_data is required when para_load is enabled".into());
        }

        if self.resume_train {
            let Some(load_epoch) = self.load_epoch else {
                return invalid("load_epoch is required when resume_train is enabled".into());
            };

            if load_epoch >= self.n_epochs.get() {
                return invalid(format!(
                    "load_epoch ({load_epoch}) must be lower than n_epochs ({})",
                    self.n_epochs
                ));
            }
        }

        if !(self.learning_rate > 0.0) {
            return invalid("learning_rate must be positive".into());
        }

        if !(0.0..1.0).contains(&self.dropout_rate) {
            return invalid("dropout_rate must be in [0, 1)".into());
        }

        if self.embedding_dim == 0 {
            return invalid("embedding_dim must be greater than 0".into());
        }

        match self.lr_policy {
            LrPolicyKind::Step if self.lr_step.is_empty() => {
                invalid("lr_step must not be empty with the step policy".into())
            }
            LrPolicyKind::Auto if self.lr_adapt_threshold.is_none() => {
                invalid("lr_adapt_threshold is required with the auto policy".into())
            }
            _ => Ok(()),
        }
    }

    /// Shape of every shared minibatch buffer.
    pub fn buffer_shape(&self) -> BufferShape {
        BufferShape::new(self.batch_size, self.channels, self.crop_size, self.crop_size)
    }
}
