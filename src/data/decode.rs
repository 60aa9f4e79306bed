use std::{path::Path, sync::Arc};

use comms::specs::{AugmentParams, BufferShape};
use rand::Rng;

use super::{ImageMean, augment};
use crate::{
    error::{PipelineErr, Result},
    tensor,
};

const SAMPLE_TENSOR: &str = "data";

/// Turns the sample files of a minibatch into a buffer-shaped `f32` block.
///
/// Each raw sample has the mean subtracted first and is then cropped and
/// optionally mirrored. With `batch_crop_mirror` the request's parameters apply
/// to the whole minibatch, otherwise every sample draws its own.
#[derive(Debug, Clone)]
pub struct Decoder {
    mean: Arc<ImageMean>,
    raw_size: usize,
    shape: BufferShape,
    batch_crop_mirror: bool,
}

impl Decoder {
    /// Creates a decoder for buffers of `shape`.
    ///
    /// # Errors
    /// Returns `PipelineErr::Config` if the buffer isn't square or is larger than
    /// the raw samples.
    pub fn new(
        mean: ImageMean,
        raw_size: usize,
        shape: BufferShape,
        batch_crop_mirror: bool,
    ) -> Result<Self> {
        if shape.height != shape.width || shape.height > raw_size {
            return Err(PipelineErr::Config(format!(
                "cannot crop {}x{} out of {raw_size}x{raw_size} samples",
                shape.height, shape.width
            )));
        }

        Ok(Self {
            mean: Arc::new(mean),
            raw_size,
            shape,
            batch_crop_mirror,
        })
    }

    #[inline]
    pub fn shape(&self) -> BufferShape {
        self.shape
    }

    /// Decodes the samples of `files` into `out`, resizing it to the buffer's length.
    ///
    /// # Arguments
    /// * `files` - The sample files, in minibatch order.
    /// * `params` - The minibatch's crop offsets and mirror flag.
    /// * `rng` - Source of the per-sample draws when crops aren't batch wide.
    /// * `out` - The destination block.
    ///
    /// # Errors
    /// Returns `PipelineErr::Decode` if a file is missing or malformed, or the files
    /// don't add up to exactly one minibatch.
    pub fn decode_into<R: Rng + ?Sized>(
        &self,
        files: &[String],
        params: AugmentParams,
        rng: &mut R,
        out: &mut Vec<f32>,
    ) -> Result<()> {
        let BufferShape {
            batch, channels, ..
        } = self.shape;
        let crop = self.shape.height;
        let raw_len = channels * self.raw_size * self.raw_size;
        let sample_len = self.shape.sample_len();

        out.resize(self.shape.numel(), 0.0);

        let mut taken = 0;
        for file in files {
            let mut samples = self.read_samples(file)?;

            for raw in samples.data.chunks_exact_mut(raw_len) {
                if taken == batch {
                    return Err(PipelineErr::decode(
                        file.as_str(),
                        format!("minibatch holds more than {batch} samples"),
                    ));
                }

                self.mean.subtract(raw);

                let params = if self.batch_crop_mirror {
                    params
                } else {
                    augment::rand3d(rng)
                };

                let dst = &mut out[taken * sample_len..(taken + 1) * sample_len];
                augment::crop_and_mirror(raw, dst, channels, self.raw_size, crop, params);
                taken += 1;
            }
        }

        if taken != batch {
            let first = files.first().map(String::as_str).unwrap_or("<empty minibatch>");
            return Err(PipelineErr::decode(
                first,
                format!("minibatch holds {taken} samples, expected {batch}"),
            ));
        }

        Ok(())
    }

    fn read_samples(&self, file: &str) -> Result<tensor::Tensor> {
        let samples = tensor::read_named(Path::new(file), SAMPLE_TENSOR)?;

        let (c, h, w) = match samples.shape.as_slice() {
            [c, h, w] | [1, c, h, w] => (*c, *h, *w),
            other => {
                return Err(PipelineErr::decode(
                    file,
                    format!("expected a [c, h, w] sample, got shape {other:?}"),
                ));
            }
        };

        if (c, h, w) != (self.shape.channels, self.raw_size, self.raw_size) {
            return Err(PipelineErr::decode(
                file,
                format!(
                    "expected a {}x{}x{} sample, got {c}x{h}x{w}",
                    self.shape.channels, self.raw_size, self.raw_size
                ),
            ));
        }

        Ok(samples)
    }
}

/// Fills `negative` with the samples of `positive` rotated by one position.
///
/// Sample `i` of the negative block is sample `i + 1` of the positive block, so every
/// query is paired against another pair's positive.
pub fn rotate_negatives(positive: &[f32], sample_len: usize, negative: &mut Vec<f32>) {
    negative.clear();
    negative.extend_from_slice(&positive[sample_len.min(positive.len())..]);
    negative.extend_from_slice(&positive[..sample_len.min(positive.len())]);
}

#[cfg(test)]
mod tests {
    use std::fs;

    use rand::{SeedableRng, rngs::StdRng};
    use safetensors::{Dtype, tensor::TensorView};

    use super::*;

    fn write_sample(dir: &Path, name: &str, shape: Vec<usize>, values: &[f32]) -> String {
        let path = dir.join(name);
        let view = TensorView::new(Dtype::F32, shape, bytemuck::cast_slice(values)).unwrap();
        fs::write(&path, safetensors::serialize([("data", view)], &None).unwrap()).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn samples_are_mean_subtracted_then_cropped() {
        let dir = tempfile::tempdir().unwrap();
        let ramp: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let f0 = write_sample(dir.path(), "0.safetensors", vec![1, 4, 4], &ramp);
        let f1 = write_sample(dir.path(), "1.safetensors", vec![1, 1, 4, 4], &ramp);

        let mean = ImageMean::from_flat(&[1.0], 1, 4).unwrap();
        let decoder = Decoder::new(mean, 4, BufferShape::new(2, 1, 2, 2), true).unwrap();

        let mut out = Vec::new();
        let mut rng = StdRng::seed_from_u64(0);
        decoder
            .decode_into(&[f0, f1], AugmentParams::CENTER, &mut rng, &mut out)
            .unwrap();

        assert_eq!(out, [4.0, 5.0, 8.0, 9.0, 4.0, 5.0, 8.0, 9.0]);
    }

    #[test]
    fn missing_file_aborts_the_minibatch() {
        let decoder = Decoder::new(ImageMean::zeros(1, 2), 2, BufferShape::new(1, 1, 2, 2), true)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let err = decoder
            .decode_into(
                &["/nonexistent/0.safetensors".to_string()],
                AugmentParams::CENTER,
                &mut rng,
                &mut Vec::new(),
            )
            .unwrap_err();

        assert!(matches!(err, PipelineErr::Decode { .. }));
    }

    #[test]
    fn short_minibatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let f0 = write_sample(dir.path(), "0.safetensors", vec![1, 2, 2], &[0.0; 4]);
        let decoder = Decoder::new(ImageMean::zeros(1, 2), 2, BufferShape::new(2, 1, 2, 2), true)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let err = decoder
            .decode_into(&[f0], AugmentParams::CENTER, &mut rng, &mut Vec::new())
            .unwrap_err();

        assert!(matches!(err, PipelineErr::Decode { .. }));
    }

    #[test]
    fn negatives_are_the_next_positive() {
        let positive = [0.0, 0.0, 1.0, 1.0, 2.0, 2.0];
        let mut negative = Vec::new();
        rotate_negatives(&positive, 2, &mut negative);
        assert_eq!(negative, [1.0, 1.0, 2.0, 2.0, 0.0, 0.0]);
    }
}
