use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use comms::specs::{ExportedBuffer, IpcHandle};
use log::{debug, info, warn};
use memmap2::MmapMut;

use super::buffer::{Header, MappedBuffer, Region, HEADER_LEN};
use crate::error::{PipelineErr, Result};

/// One process' view of a device.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    device_id: u32,
    dir: PathBuf,
}

impl DeviceContext {
    /// Opens the context of device `device_id`, allocations live under `root`.
    ///
    /// # Errors
    /// Returns an io error if the device directory can't be created.
    pub fn open(device_id: u32, root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join(format!("tripletrain-dev{device_id}"));
        fs::create_dir_all(&dir)?;
        debug!(device_id = device_id; "opened device context at {}", dir.display());

        Ok(Self { device_id, dir })
    }

    #[inline]
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    #[inline]
    pub(super) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Invalidates every allocation of this device.
    ///
    /// Mappings already held keep their pages but no handle can be imported anymore.
    pub fn reset(&self) -> Result<()> {
        warn!(device_id = self.device_id; "resetting device, every exported handle is invalidated");
        self.remove_allocations()?;
        Ok(())
    }

    /// Removes allocations left behind by an owner that died before releasing them.
    ///
    /// Only the owning side calls this, before allocating, since it frees every
    /// allocation of the device.
    ///
    /// # Returns
    /// The amount of allocations removed.
    pub fn reclaim_stale(&self) -> Result<usize> {
        let removed = self.remove_allocations()?;
        if removed > 0 {
            info!(device_id = self.device_id, removed = removed; "reclaimed stale allocations");
        }

        Ok(removed)
    }

    fn remove_allocations(&self) -> Result<usize> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "mem") {
                fs::remove_file(path)?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Maps the allocation referenced by `export` into this process.
    ///
    /// # Errors
    /// Returns `PipelineErr::HandleInvalid` if the handle was produced for another
    /// device, the allocation no longer exists or doesn't match the handle.
    pub fn import_handle(&self, export: &ExportedBuffer) -> Result<MappedBuffer> {
        let ExportedBuffer {
            role,
            shape,
            dtype,
            handle,
        } = export;

        self.check_handle(handle)?;

        let expected = shape.byte_len(*dtype) as u64;
        if handle.len != expected {
            return Err(PipelineErr::handle(format!(
                "{} handle spans {} bytes but its shape needs {expected}",
                role.as_str(),
                handle.len
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&handle.path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => PipelineErr::handle(format!(
                    "allocation {:016x} no longer exists, was the device reset?",
                    handle.allocation
                )),
                _ => PipelineErr::Io(e),
            })?;

        if file.metadata()?.len() != HEADER_LEN as u64 + handle.len {
            return Err(PipelineErr::handle("allocation size doesn't match the handle"));
        }

        // SAFETY: The file is only resized by its owner at allocation time, before the
        //         handle is exported. Concurrent access is ordered by the token protocol.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let header = Header::read(&mmap)
            .ok_or_else(|| PipelineErr::handle("allocation header is corrupt"))?;

        if header.device_id != handle.device_id
            || header.allocation != handle.allocation
            || header.len != handle.len
        {
            return Err(PipelineErr::handle(format!(
                "allocation header {header:?} doesn't match handle {handle:?}"
            )));
        }

        debug!(device_id = self.device_id; "imported {} buffer {:016x}", role.as_str(), handle.allocation);

        Ok(MappedBuffer::new(Region::new(mmap, *role, *shape, *dtype)))
    }

    fn check_handle(&self, handle: &IpcHandle) -> Result<()> {
        if handle.device_id != self.device_id {
            return Err(PipelineErr::handle(format!(
                "handle was produced on device {} but this context is device {}",
                handle.device_id, self.device_id
            )));
        }

        if Path::new(&handle.path).parent() != Some(self.dir.as_path()) {
            return Err(PipelineErr::handle(format!(
                "handle path {} is outside of this device context",
                handle.path
            )));
        }

        Ok(())
    }
}
