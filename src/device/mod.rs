//! Shared minibatch buffers.
//!
//! A device allocation is a region of shared memory under the device's directory
//! (`/dev/shm` by default). The trainer owns the allocation and exports a handle,
//! the loader imports the handle and maps the very same physical pages, so the
//! handoff of a minibatch never copies data across the process boundary.
//!
//! Memory ordering: nothing but the token handshake orders the loader's writes
//! against the trainer's reads. The writer calls `publish` before signalling and
//! the reader calls `acquire` after being signalled. This relies on host-side
//! launch order being device order, which holds for a single in-order device
//! queue. A multi-stream or multi-device port must add an explicit event/fence
//! at these two points.
//!
//! Allocations are released when their `DeviceBuffer` drops. An owner that is
//! killed or aborts leaves its `.mem` files behind in the device directory, so
//! the trainer calls `DeviceContext::reclaim_stale` before allocating.

mod buffer;
mod context;
mod set;

pub use buffer::{DeviceBuffer, MappedBuffer, Region};
pub use context::DeviceContext;
pub use set::{MappedBufferSet, SharedBufferSet};
