//! Dataset files and the CPU side of minibatch preparation.
//!
//! Every sample file is a safetensors file holding a single `data` tensor of
//! shape `[c, raw, raw]` (or `[1, c, raw, raw]`). A minibatch is `batch_size`
//! consecutive files of a list, so minibatch `i` is `files[i * bs..(i + 1) * bs]`.

mod augment;
mod decode;
mod files;
mod mean;

pub use augment::{crop_and_mirror, rand3d};
pub use decode::{Decoder, rotate_negatives};
pub use files::{TripletFiles, list_samples};
pub use mean::ImageMean;
