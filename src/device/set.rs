use comms::specs::{BufferShape, DType, ExportedBuffer, Role};

use super::{DeviceBuffer, DeviceContext, MappedBuffer};
use crate::error::{PipelineErr, Result};

/// The trainer-owned query, positive and negative buffers.
///
/// Allocated once when the model is built and reused by every iteration.
pub struct SharedBufferSet {
    query: DeviceBuffer,
    positive: DeviceBuffer,
    negative: DeviceBuffer,
}

impl SharedBufferSet {
    pub fn allocate(ctx: &DeviceContext, shape: BufferShape, dtype: DType) -> Result<Self> {
        Ok(Self {
            query: DeviceBuffer::alloc(ctx, Role::Query, shape, dtype)?,
            positive: DeviceBuffer::alloc(ctx, Role::Positive, shape, dtype)?,
            negative: DeviceBuffer::alloc(ctx, Role::Negative, shape, dtype)?,
        })
    }

    pub fn get(&self, role: Role) -> &DeviceBuffer {
        match role {
            Role::Query => &self.query,
            Role::Positive => &self.positive,
            Role::Negative => &self.negative,
        }
    }

    pub fn get_mut(&mut self, role: Role) -> &mut DeviceBuffer {
        match role {
            Role::Query => &mut self.query,
            Role::Positive => &mut self.positive,
            Role::Negative => &mut self.negative,
        }
    }

    #[inline]
    pub fn shape(&self) -> BufferShape {
        self.query.shape()
    }

    /// Publishes writes made by this process, the synchronous loading path.
    pub fn publish(&self) {
        self.query.publish();
    }

    /// The handshake sent to the loader, one entry per role.
    pub fn exports(&self) -> Vec<ExportedBuffer> {
        Role::ALL.iter().map(|&role| self.get(role).export()).collect()
    }

    /// Makes the loader's latest writes visible before compute reads them.
    pub fn acquire(&self) {
        self.query.acquire();
    }
}

/// The loader-side mappings of the trainer's buffers.
pub struct MappedBufferSet {
    query: MappedBuffer,
    positive: MappedBuffer,
    negative: MappedBuffer,
}

impl MappedBufferSet {
    /// Imports the three exported buffers.
    ///
    /// # Errors
    /// Returns `PipelineErr::HandleInvalid` if a role is missing or repeated, the
    /// shapes disagree, or any handle fails to import.
    pub fn import(ctx: &DeviceContext, exports: &[ExportedBuffer]) -> Result<Self> {
        let mut slots: [Option<MappedBuffer>; 3] = [None, None, None];

        for export in exports {
            let slot = &mut slots[role_index(export.role)];
            if slot.is_some() {
                return Err(PipelineErr::handle(format!(
                    "{} buffer exported twice",
                    export.role.as_str()
                )));
            }

            *slot = Some(ctx.import_handle(export)?);
        }

        let [Some(query), Some(positive), Some(negative)] = slots else {
            return Err(PipelineErr::handle(
                "the handshake must export the query, positive and negative buffers",
            ));
        };

        if query.shape() != positive.shape() || query.shape() != negative.shape() {
            return Err(PipelineErr::handle("the exported buffers disagree on their shape"));
        }

        Ok(Self {
            query,
            positive,
            negative,
        })
    }

    pub fn get_mut(&mut self, role: Role) -> &mut MappedBuffer {
        match role {
            Role::Query => &mut self.query,
            Role::Positive => &mut self.positive,
            Role::Negative => &mut self.negative,
        }
    }

    #[inline]
    pub fn shape(&self) -> BufferShape {
        self.query.shape()
    }

    /// Publishes every write made to the three buffers.
    pub fn publish(&self) {
        self.query.publish();
    }
}

fn role_index(role: Role) -> usize {
    match role {
        Role::Query => 0,
        Role::Positive => 1,
        Role::Negative => 2,
    }
}
