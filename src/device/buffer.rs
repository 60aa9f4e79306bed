use std::{
    fs::{self, OpenOptions},
    ops::{Deref, DerefMut},
    sync::atomic::{self, Ordering},
};

use comms::specs::{BufferShape, DType, ExportedBuffer, IpcHandle, Role};
use half::f16;
use log::{debug, warn};
use memmap2::MmapMut;

use super::DeviceContext;
use crate::error::{PipelineErr, Result};

pub(super) const HEADER_LEN: usize = 64;
const MAGIC: &[u8; 8] = b"TRPLBUF1";

/// The bookkeeping written at the start of every allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Header {
    pub device_id: u32,
    pub allocation: u64,
    pub len: u64,
}

impl Header {
    pub(super) fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            return None;
        }

        let device_id = u32::from_le_bytes(bytes[8..12].try_into().ok()?);
        let allocation = u64::from_le_bytes(bytes[16..24].try_into().ok()?);
        let len = u64::from_le_bytes(bytes[24..32].try_into().ok()?);

        Some(Self {
            device_id,
            allocation,
            len,
        })
    }

    fn write(&self, bytes: &mut [u8]) {
        bytes[..HEADER_LEN].fill(0);
        bytes[..8].copy_from_slice(MAGIC);
        bytes[8..12].copy_from_slice(&self.device_id.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.allocation.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.len.to_le_bytes());
    }
}

/// A mapped minibatch buffer of fixed shape and element type.
///
/// Values cross the boundary as `f32` and are stored as the buffer's `dtype`.
pub struct Region {
    mmap: MmapMut,
    role: Role,
    shape: BufferShape,
    dtype: DType,
}

impl Region {
    pub(super) fn new(mmap: MmapMut, role: Role, shape: BufferShape, dtype: DType) -> Self {
        Self {
            mmap,
            role,
            shape,
            dtype,
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn shape(&self) -> BufferShape {
        self.shape
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The raw bytes of the buffer, header excluded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[HEADER_LEN..]
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[HEADER_LEN..]
    }

    fn check_len(&self, got: usize) -> Result<()> {
        let expected = self.shape.numel();
        if got != expected {
            return Err(PipelineErr::Compute(format!(
                "{} buffer holds {expected} values, got {got}",
                self.role.as_str()
            )));
        }

        Ok(())
    }

    /// Overwrites the whole buffer with `values`.
    ///
    /// # Errors
    /// Returns an error if `values` doesn't match the buffer's element count.
    pub fn write_f32(&mut self, values: &[f32]) -> Result<()> {
        self.check_len(values.len())?;

        match self.dtype {
            DType::F32 => {
                let dst: &mut [f32] = bytemuck::try_cast_slice_mut(self.as_bytes_mut())
                    .map_err(|e| PipelineErr::handle(format!("misaligned mapping: {e:?}")))?;
                dst.copy_from_slice(values);
            }
            DType::F16 => {
                let dst: &mut [f16] = bytemuck::try_cast_slice_mut(self.as_bytes_mut())
                    .map_err(|e| PipelineErr::handle(format!("misaligned mapping: {e:?}")))?;
                for (d, v) in dst.iter_mut().zip(values) {
                    *d = f16::from_f32(*v);
                }
            }
        }

        Ok(())
    }

    /// Copies the whole buffer into `out` as `f32`.
    pub fn read_into(&self, out: &mut [f32]) -> Result<()> {
        self.check_len(out.len())?;

        match self.dtype {
            DType::F32 => {
                let src: &[f32] = bytemuck::try_cast_slice(self.as_bytes())
                    .map_err(|e| PipelineErr::handle(format!("misaligned mapping: {e:?}")))?;
                out.copy_from_slice(src);
            }
            DType::F16 => {
                let src: &[f16] = bytemuck::try_cast_slice(self.as_bytes())
                    .map_err(|e| PipelineErr::handle(format!("misaligned mapping: {e:?}")))?;
                for (o, s) in out.iter_mut().zip(src) {
                    *o = s.to_f32();
                }
            }
        }

        Ok(())
    }

    /// Reads the whole buffer as `f32`.
    pub fn read_f32(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0; self.shape.numel()];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Orders every write made so far before the signal that hands the buffer over.
    #[inline]
    pub fn publish(&self) {
        atomic::fence(Ordering::Release);
    }

    /// Orders every read that follows after the signal that handed the buffer over.
    #[inline]
    pub fn acquire(&self) {
        atomic::fence(Ordering::Acquire);
    }
}

/// A buffer allocated by this process, the only kind that can be exported.
pub struct DeviceBuffer {
    region: Region,
    handle: IpcHandle,
}

impl DeviceBuffer {
    /// Allocates a zeroed buffer for `role` on the device of `ctx`.
    ///
    /// # Errors
    /// Returns an io error if the backing shared memory can't be created or mapped.
    pub fn alloc(ctx: &DeviceContext, role: Role, shape: BufferShape, dtype: DType) -> Result<Self> {
        let allocation: u64 = rand::random();
        let len = shape.byte_len(dtype) as u64;
        let path = ctx
            .dir()
            .join(format!("{allocation:016x}-{}.mem", role.as_str()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(HEADER_LEN as u64 + len)?;

        // SAFETY: The file was just created by this process and is never resized again.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let header = Header {
            device_id: ctx.device_id(),
            allocation,
            len,
        };
        header.write(&mut mmap);

        let path = path
            .into_os_string()
            .into_string()
            .map_err(|p| PipelineErr::Config(format!("shm_dir is not valid UTF-8: {p:?}")))?;

        debug!(device_id = ctx.device_id(); "allocated {} buffer {allocation:016x} of {len} bytes", role.as_str());

        Ok(Self {
            region: Region::new(mmap, role, shape, dtype),
            handle: IpcHandle {
                device_id: ctx.device_id(),
                allocation,
                path,
                len,
            },
        })
    }

    /// Produces the handle another process imports to map this buffer.
    pub fn export_handle(&self) -> IpcHandle {
        self.handle.clone()
    }

    /// The handshake entry describing this buffer.
    pub fn export(&self) -> ExportedBuffer {
        ExportedBuffer {
            role: self.role(),
            shape: self.shape(),
            dtype: self.dtype(),
            handle: self.export_handle(),
        }
    }
}

impl Deref for DeviceBuffer {
    type Target = Region;

    fn deref(&self) -> &Self::Target {
        &self.region
    }
}

impl DerefMut for DeviceBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.region
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.handle.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to release allocation {}: {e}", self.handle.path);
            }
        }
    }
}

/// A buffer imported from another process' handle.
pub struct MappedBuffer {
    region: Region,
}

impl MappedBuffer {
    pub(super) fn new(region: Region) -> Self {
        Self { region }
    }
}

impl Deref for MappedBuffer {
    type Target = Region;

    fn deref(&self) -> &Self::Target {
        &self.region
    }
}

impl DerefMut for MappedBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.region
    }
}
