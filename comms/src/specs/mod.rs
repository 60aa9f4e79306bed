mod buffer;
mod load;

pub use buffer::{BufferShape, DType, ExportedBuffer, IpcHandle, Role};
pub use load::{AugmentParams, Link, MinibatchRequest};
