use std::path::Path;

use crate::{
    error::{PipelineErr, Result},
    tensor,
};

const MEAN_TENSOR: &str = "mean";

/// The image mean subtracted from every raw sample.
///
/// Either one value per channel or a full `channels x raw x raw` image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMean {
    values: Vec<f32>,
    channels: usize,
    raw_size: usize,
}

impl ImageMean {
    /// A mean that leaves samples untouched.
    pub fn zeros(channels: usize, raw_size: usize) -> Self {
        Self {
            values: vec![0.0; channels],
            channels,
            raw_size,
        }
    }

    /// Reads the `mean` tensor of the file at `path`.
    ///
    /// # Errors
    /// Returns `PipelineErr::Decode` if the file can't be read or its shape is
    /// neither `[channels]` nor `[channels, raw, raw]`.
    pub fn load(path: &Path, channels: usize, raw_size: usize) -> Result<Self> {
        let tensor = tensor::read_named(path, MEAN_TENSOR)?;
        Self::from_values(tensor.data, channels, raw_size)
            .map_err(|detail| PipelineErr::decode(path.display().to_string(), detail))
    }

    /// Rebuilds a mean from the flat values sent over the control channel.
    pub fn from_flat(values: &[f32], channels: usize, raw_size: usize) -> Result<Self> {
        Self::from_values(values.to_vec(), channels, raw_size)
            .map_err(|detail| PipelineErr::decode("image mean payload", detail))
    }

    fn from_values(values: Vec<f32>, channels: usize, raw_size: usize) -> std::result::Result<Self, String> {
        let full = channels * raw_size * raw_size;

        if values.len() != channels && values.len() != full {
            return Err(format!(
                "expected {channels} or {full} mean values, got {}",
                values.len()
            ));
        }

        Ok(Self {
            values,
            channels,
            raw_size,
        })
    }

    /// The flat values, as sent to the loader.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Subtracts the mean from one raw sample in place.
    pub fn subtract(&self, sample: &mut [f32]) {
        let plane = self.raw_size * self.raw_size;
        debug_assert_eq!(sample.len(), self.channels * plane);

        if self.values.len() == self.channels {
            for (chan, m) in sample.chunks_exact_mut(plane).zip(&self.values) {
                chan.iter_mut().for_each(|v| *v -= m);
            }
        } else {
            sample.iter_mut().zip(&self.values).for_each(|(v, m)| *v -= m);
        }
    }
}
