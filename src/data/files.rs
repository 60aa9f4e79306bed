use std::{fs, path::Path};

use crate::error::{PipelineErr, Result};

const SAMPLE_EXT: &str = "safetensors";

/// Lists the sample files of `dir`, sorted by name.
///
/// # Errors
/// Returns `PipelineErr::Decode` if the directory can't be read or a sample path
/// isn't valid UTF-8.
pub fn list_samples(dir: &Path) -> Result<Vec<String>> {
    let display = dir.display().to_string();
    let entries = fs::read_dir(dir).map_err(|e| PipelineErr::decode(&display, e))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PipelineErr::decode(&display, e))?.path();

        if path.extension().is_none_or(|ext| ext != SAMPLE_EXT) {
            continue;
        }

        let Some(path) = path.to_str() else {
            return Err(PipelineErr::decode(
                path.display().to_string(),
                "sample paths must be valid UTF-8",
            ));
        };

        files.push(path.to_string());
    }

    files.sort();
    Ok(files)
}

/// The two co-indexed file lists of a dataset split.
///
/// Entry `i` of `a` and entry `i` of `b` form a query/positive pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TripletFiles {
    a: Vec<String>,
    b: Vec<String>,
}

impl TripletFiles {
    /// Pairs up two file lists.
    ///
    /// # Errors
    /// Returns `PipelineErr::Config` if the lists differ in length.
    pub fn new(a: Vec<String>, b: Vec<String>) -> Result<Self> {
        if a.len() != b.len() {
            return Err(PipelineErr::Config(format!(
                "the query and positive lists hold {} and {} files",
                a.len(),
                b.len()
            )));
        }

        Ok(Self { a, b })
    }

    /// Lists and pairs up the samples of two directories.
    pub fn list(a_dir: &Path, b_dir: &Path) -> Result<Self> {
        Self::new(list_samples(a_dir)?, list_samples(b_dir)?)
    }

    /// Amount of full minibatches of `batch_size` samples, a trailing remainder is dropped.
    pub fn n_minibatches(&self, batch_size: usize) -> usize {
        self.a.len() / batch_size
    }

    /// The query and positive files of minibatch `idx`.
    ///
    /// # Panics
    /// If `idx` is not lower than `n_minibatches(batch_size)`.
    pub fn minibatch(&self, idx: usize, batch_size: usize) -> (&[String], &[String]) {
        let range = idx * batch_size..(idx + 1) * batch_size;
        (&self.a[range.clone()], &self.b[range])
    }
}
