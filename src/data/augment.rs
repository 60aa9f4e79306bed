use comms::specs::AugmentParams;
use rand::Rng;

/// Draws the crop offsets and the mirror flag of one minibatch.
///
/// Both offsets are uniform in `[0, 1)` and the mirror draw is rounded, so a
/// minibatch is flipped half of the time.
pub fn rand3d<R: Rng + ?Sized>(rng: &mut R) -> AugmentParams {
    let crop_x = rng.random::<f32>();
    let crop_y = rng.random::<f32>();
    let mirror = rng.random::<f32>().round();

    AugmentParams::new(crop_x, crop_y, mirror)
}

/// The crop start along one axis.
///
/// The margin is half of the spare room, and `p` scales twice the margin, so
/// `0.5` is the center crop.
fn crop_offset(p: f32, raw: usize, crop: usize) -> usize {
    let span = (raw - crop) / 2 * 2;
    ((p * span as f32).round() as usize).min(span)
}

/// Crops a `channels x raw x raw` sample into `channels x crop x crop`.
///
/// # Arguments
/// * `src` - The mean subtracted raw sample.
/// * `dst` - Where the cropped sample is written.
/// * `channels` - Amount of channels of both samples.
/// * `raw` - Side of the raw sample.
/// * `crop` - Side of the cropped sample.
/// * `params` - Crop offsets and mirror flag.
pub fn crop_and_mirror(
    src: &[f32],
    dst: &mut [f32],
    channels: usize,
    raw: usize,
    crop: usize,
    params: AugmentParams,
) {
    debug_assert_eq!(src.len(), channels * raw * raw);
    debug_assert_eq!(dst.len(), channels * crop * crop);

    let x0 = crop_offset(params.crop_x, raw, crop);
    let y0 = crop_offset(params.crop_y, raw, crop);
    let mirror = params.mirrored();

    for c in 0..channels {
        let plane = &src[c * raw * raw..(c + 1) * raw * raw];
        let out = &mut dst[c * crop * crop..(c + 1) * crop * crop];

        for (y, row_out) in out.chunks_exact_mut(crop).enumerate() {
            let start = (y0 + y) * raw + x0;
            let row = &plane[start..start + crop];

            if mirror {
                for (o, v) in row_out.iter_mut().zip(row.iter().rev()) {
                    *o = *v;
                }
            } else {
                row_out.copy_from_slice(row);
            }
        }
    }
}
