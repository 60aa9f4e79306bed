//! Reading and writing `f32` tensors in safetensors files.
//!
//! Samples, the image mean and checkpoints all use the format. Stored values may be
//! `u8`, `f16` or `f32`, they are always widened to `f32` in memory.

use std::{collections::HashMap, fs, path::Path};

use half::f16;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::error::{PipelineErr, Result};

/// An owned, named `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }
}

/// Reads the tensor called `name` from the file at `path`.
///
/// # Errors
/// Returns `PipelineErr::Decode` if the file is missing, isn't a safetensors file,
/// doesn't hold `name` or stores an unsupported element type.
pub fn read_named(path: &Path, name: &str) -> Result<Tensor> {
    let display = path.display().to_string();
    let bytes = fs::read(path).map_err(|e| PipelineErr::decode(&display, e))?;
    let tensors = SafeTensors::deserialize(&bytes).map_err(|e| PipelineErr::decode(&display, e))?;
    let view = tensors
        .tensor(name)
        .map_err(|e| PipelineErr::decode(&display, e))?;

    let data = widen(&view).map_err(|detail| PipelineErr::decode(&display, detail))?;
    Ok(Tensor::new(name, view.shape().to_vec(), data))
}

/// Reads every tensor of the file at `path`, sorted by name.
pub fn read_all(path: &Path) -> Result<Vec<Tensor>> {
    let display = path.display().to_string();
    let bytes = fs::read(path).map_err(|e| PipelineErr::decode(&display, e))?;
    let tensors = SafeTensors::deserialize(&bytes).map_err(|e| PipelineErr::decode(&display, e))?;

    let mut out = Vec::new();
    for (name, view) in tensors.tensors() {
        let data = widen(&view).map_err(|detail| PipelineErr::decode(&display, detail))?;
        out.push(Tensor::new(name, view.shape().to_vec(), data));
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Writes `tensors` as little-endian `f32` to `path`, replacing any previous file.
pub fn write_all(path: &Path, tensors: &[Tensor]) -> Result<()> {
    let display = path.display().to_string();

    let views = tensors
        .iter()
        .map(|t| {
            let view = TensorView::new(Dtype::F32, t.shape.clone(), bytemuck::cast_slice(&t.data))
                .map_err(|e| PipelineErr::decode(&display, e))?;
            Ok((t.name.as_str(), view))
        })
        .collect::<Result<Vec<_>>>()?;

    let bytes = safetensors::serialize(views, &None::<HashMap<String, String>>)
        .map_err(|e| PipelineErr::decode(&display, e))?;
    fs::write(path, bytes).map_err(|e| PipelineErr::decode(&display, e))
}

fn widen(view: &TensorView<'_>) -> std::result::Result<Vec<f32>, String> {
    let data = view.data();

    let values = match view.dtype() {
        Dtype::U8 => data.iter().map(|&b| b as f32).collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        other => return Err(format!("unsupported element type {other:?}")),
    };

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensors_survive_a_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");

        let tensors = vec![
            Tensor::new("b", vec![2], vec![0.5, -0.5]),
            Tensor::new("a", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]),
        ];
        write_all(&path, &tensors).unwrap();

        let read = read_all(&path).unwrap();
        assert_eq!(read[0], tensors[1]);
        assert_eq!(read[1], tensors[0]);
        assert_eq!(read_named(&path, "b").unwrap(), tensors[0]);
    }

    #[test]
    fn missing_file_is_a_decode_error() {
        let err = read_named(Path::new("/nonexistent/x.safetensors"), "data").unwrap_err();
        assert!(matches!(err, PipelineErr::Decode { .. }));
    }

    #[test]
    fn byte_samples_are_widened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.safetensors");

        let raw = [0u8, 128, 255];
        let view = TensorView::new(Dtype::U8, vec![3], &raw).unwrap();
        let bytes = safetensors::serialize([("data", view)], &None).unwrap();
        fs::write(&path, bytes).unwrap();

        assert_eq!(read_named(&path, "data").unwrap().data, vec![0.0, 128.0, 255.0]);
    }
}
