use serde::{Deserialize, Serialize};

use super::Role;

/// Random crop offsets and the mirror flag applied to one minibatch.
///
/// `crop_x` and `crop_y` are in `[0, 1)` and scale the available crop margin,
/// the buffer is mirrored horizontally when `mirror >= 0.5`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AugmentParams {
    pub crop_x: f32,
    pub crop_y: f32,
    pub mirror: f32,
}

impl AugmentParams {
    /// Center crop without mirroring.
    pub const CENTER: AugmentParams = AugmentParams {
        crop_x: 0.5,
        crop_y: 0.5,
        mirror: 0.0,
    };

    pub fn new(crop_x: f32, crop_y: f32, mirror: f32) -> Self {
        Self {
            crop_x,
            crop_y,
            mirror,
        }
    }

    #[inline]
    pub fn mirrored(&self) -> bool {
        self.mirror >= 0.5
    }
}

/// Instruction for the loader to fill the buffer of `role`.
///
/// The samples of every file in `files` are concatenated in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinibatchRequest {
    pub files: Vec<String>,
    pub params: AugmentParams,
    pub role: Role,
}

/// The three links established between the trainer and the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    Control,
    LoadRequest,
    LoadReady,
}

impl Link {
    pub fn as_str(self) -> &'static str {
        match self {
            Link::Control => "control",
            Link::LoadRequest => "load_request",
            Link::LoadReady => "load_ready",
        }
    }
}
