//! Epoch checkpoints: weights, momentums, learning rate and the validation record.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    error::{PipelineErr, Result},
    state::ValidationEntry,
    tensor::{self, Tensor},
};

/// Durable storage of the training state, keyed by epoch.
pub trait CheckpointStore {
    fn save_weights(&mut self, epoch: usize, weights: &[Tensor]) -> Result<()>;
    fn load_weights(&mut self, epoch: usize) -> Result<Vec<Tensor>>;
    fn save_momentums(&mut self, epoch: usize, momentums: &[Tensor]) -> Result<()>;
    fn load_momentums(&mut self, epoch: usize) -> Result<Vec<Tensor>>;
    fn save_learning_rate(&mut self, epoch: usize, lr: f32) -> Result<()>;
    fn load_learning_rate(&mut self, epoch: usize) -> Result<f32>;
    fn save_validation_record(&mut self, record: &[ValidationEntry]) -> Result<()>;
    fn load_validation_record(&mut self) -> Result<Vec<ValidationEntry>>;
}

/// Stores checkpoints as files in a directory.
///
/// Tensors go to `weights_{epoch}.safetensors` and `momentums_{epoch}.safetensors`,
/// the learning rate to `lr_{epoch}.json` and the record to `val_record.json`.
#[derive(Debug, Clone)]
pub struct DirCheckpointStore {
    dir: PathBuf,
}

impl DirCheckpointStore {
    /// Opens the store at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| checkpoint_err(&dir, e))?;
        Ok(Self { dir })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn save_tensors(&self, name: &str, tensors: &[Tensor]) -> Result<()> {
        let path = self.path(name);
        tensor::write_all(&path, tensors).map_err(|e| to_checkpoint(&path, e))?;
        debug!("saved {}", path.display());
        Ok(())
    }

    fn load_tensors(&self, name: &str) -> Result<Vec<Tensor>> {
        let path = self.path(name);
        tensor::read_all(&path).map_err(|e| to_checkpoint(&path, e))
    }

    fn save_json<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        let json = serde_json::to_vec_pretty(value).map_err(|e| checkpoint_err(&path, e))?;
        fs::write(&path, json).map_err(|e| checkpoint_err(&path, e))?;
        debug!("saved {}", path.display());
        Ok(())
    }

    fn load_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.path(name);
        let bytes = fs::read(&path).map_err(|e| checkpoint_err(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| checkpoint_err(&path, e))
    }
}

impl CheckpointStore for DirCheckpointStore {
    fn save_weights(&mut self, epoch: usize, weights: &[Tensor]) -> Result<()> {
        self.save_tensors(&format!("weights_{epoch}.safetensors"), weights)
    }

    fn load_weights(&mut self, epoch: usize) -> Result<Vec<Tensor>> {
        self.load_tensors(&format!("weights_{epoch}.safetensors"))
    }

    fn save_momentums(&mut self, epoch: usize, momentums: &[Tensor]) -> Result<()> {
        self.save_tensors(&format!("momentums_{epoch}.safetensors"), momentums)
    }

    fn load_momentums(&mut self, epoch: usize) -> Result<Vec<Tensor>> {
        self.load_tensors(&format!("momentums_{epoch}.safetensors"))
    }

    fn save_learning_rate(&mut self, epoch: usize, lr: f32) -> Result<()> {
        self.save_json(&format!("lr_{epoch}.json"), &lr)
    }

    fn load_learning_rate(&mut self, epoch: usize) -> Result<f32> {
        self.load_json(&format!("lr_{epoch}.json"))
    }

    fn save_validation_record(&mut self, record: &[ValidationEntry]) -> Result<()> {
        self.save_json("val_record.json", &record)
    }

    fn load_validation_record(&mut self) -> Result<Vec<ValidationEntry>> {
        self.load_json("val_record.json")
    }
}

fn checkpoint_err(path: &Path, detail: impl std::fmt::Display) -> PipelineErr {
    PipelineErr::Checkpoint {
        path: path.display().to_string(),
        detail: detail.to_string(),
    }
}

fn to_checkpoint(path: &Path, e: PipelineErr) -> PipelineErr {
    match e {
        PipelineErr::Decode { detail, .. } => checkpoint_err(path, detail),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_of_checkpoint_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirCheckpointStore::open(dir.path().join("weights")).unwrap();

        let weights = vec![Tensor::new("embedding", vec![2, 1], vec![0.25, -1.0])];
        let record = vec![ValidationEntry {
            error: 0.5,
            loss: 1.25,
            training_error: 0.25,
        }];

        store.save_weights(3, &weights).unwrap();
        store.save_momentums(3, &weights).unwrap();
        store.save_learning_rate(3, 0.001).unwrap();
        store.save_validation_record(&record).unwrap();

        assert_eq!(store.load_weights(3).unwrap(), weights);
        assert_eq!(store.load_momentums(3).unwrap(), weights);
        assert_eq!(store.load_learning_rate(3).unwrap(), 0.001);
        assert_eq!(store.load_validation_record().unwrap(), record);
    }

    #[test]
    fn missing_epoch_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirCheckpointStore::open(dir.path()).unwrap();

        let err = store.load_weights(7).unwrap_err();
        assert!(matches!(err, PipelineErr::Checkpoint { .. }));
    }
}
