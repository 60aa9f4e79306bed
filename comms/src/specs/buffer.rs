use serde::{Deserialize, Serialize};

/// The three co-indexed roles of a triplet minibatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Query,
    Positive,
    Negative,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Query, Role::Positive, Role::Negative];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Query => "query",
            Role::Positive => "positive",
            Role::Negative => "negative",
        }
    }
}

/// Element type of a shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    #[default]
    F32,
    F16,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }
}

/// Shape of a minibatch buffer, laid out as `batch x channels x height x width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferShape {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl BufferShape {
    pub fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    /// Amount of elements in a single sample.
    pub fn sample_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Amount of elements in the whole buffer.
    pub fn numel(&self) -> usize {
        self.batch * self.sample_len()
    }

    /// Amount of bytes the buffer needs for `dtype` elements.
    pub fn byte_len(&self, dtype: DType) -> usize {
        self.numel() * dtype.size()
    }
}

/// A process-portable reference to a device allocation.
///
/// Callers must treat it as opaque, only the device context that produced it
/// and the ones importing it look inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcHandle {
    pub device_id: u32,
    pub allocation: u64,
    pub path: String,
    pub len: u64,
}

/// Everything the importing process needs to map one shared buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedBuffer {
    pub role: Role,
    pub shape: BufferShape,
    pub dtype: DType,
    pub handle: IpcHandle,
}
