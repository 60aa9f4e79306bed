use rand::{SeedableRng, rngs::StdRng};

use crate::device::DeviceContext;

/// Whether dropout layers are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropoutMode {
    On,
    Off,
}

/// Per-process training state passed explicitly to every component.
///
/// Holds what would otherwise be framework-wide globals: the device, the dropout
/// switch and the random state used for shuffling and augmentation draws.
pub struct TrainingContext {
    device: DeviceContext,
    dropout: DropoutMode,
    rng: StdRng,
}

impl TrainingContext {
    /// Creates a context on `device`, seeded from `seed` or from the OS when `None`.
    pub fn new(device: DeviceContext, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            device,
            dropout: DropoutMode::On,
            rng,
        }
    }

    #[inline]
    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    #[inline]
    pub fn dropout(&self) -> DropoutMode {
        self.dropout
    }

    #[inline]
    pub fn set_dropout(&mut self, mode: DropoutMode) {
        self.dropout = mode;
    }

    #[inline]
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
