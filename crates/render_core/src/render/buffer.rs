//! Device buffers with CPU-side free-space tracking
//!
//! A [`GpuBuffer`] is one device buffer plus the [`IntervalSet`] describing which of
//! its bytes are free. Meshes are packed into it with the same two-step protocol every
//! time: find space with `alloc_find`, claim it with `unset`, then upload.

use crate::foundation::collections::BufferKey;
use crate::memory::IntervalSet;
use super::device::{BufferId, BufferKind, DeviceResult, GraphicsDevice};
use super::RenderResult;

/// A byte range claimed inside a pooled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    /// Pool-local buffer handle
    pub buffer: BufferKey,
    /// First byte
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

/// One device buffer and its free space
#[derive(Debug)]
pub struct GpuBuffer {
    id: BufferId,
    kind: BufferKind,
    space: IntervalSet,
    live: usize,
}

impl GpuBuffer {
    /// Allocate a device buffer of exactly `size` bytes, entirely free
    pub fn create(device: &mut dyn GraphicsDevice, kind: BufferKind, size: u64) -> DeviceResult<Self> {
        let id = device.create_buffer(kind, size)?;
        log::trace!("Created {:?} buffer {:?} ({} bytes)", kind, id, size);
        Ok(Self {
            id,
            kind,
            space: IntervalSet::new(size),
            live: 0,
        })
    }

    /// Copy `bytes` into free space, returning the offset used
    ///
    /// Returns `Ok(None)` when no free interval is large enough.
    pub fn store(&mut self, device: &mut dyn GraphicsDevice, bytes: &[u8]) -> RenderResult<Option<u64>> {
        let size = bytes.len() as u64;
        let Some(offset) = self.space.alloc_find(size) else {
            return Ok(None);
        };

        self.space.unset(offset, size)?;
        if let Err(error) = device.upload(self.id, offset, bytes) {
            self.space.set(offset, size)?;
            return Err(error.into());
        }

        self.live += 1;
        Ok(Some(offset))
    }

    /// Return a previously stored range to the free pool
    pub fn release(&mut self, offset: u64, size: u64) -> RenderResult<()> {
        self.space.set(offset, size)?;
        debug_assert!(self.live > 0, "release on a buffer with no live ranges");
        self.live = self.live.saturating_sub(1);
        Ok(())
    }

    /// Destroy the device buffer
    pub fn destroy(self, device: &mut dyn GraphicsDevice) -> DeviceResult<()> {
        log::trace!("Destroying {:?} buffer {:?}", self.kind, self.id);
        device.destroy_buffer(self.id)
    }

    /// Device handle
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// What the buffer stores
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Size in bytes
    pub fn capacity(&self) -> u64 {
        self.space.capacity()
    }

    /// Bytes not claimed by any range
    pub fn free_bytes(&self) -> u64 {
        self.space.free_bytes()
    }

    /// Size of the largest free range
    pub fn largest_free(&self) -> u64 {
        self.space.largest_free()
    }

    /// Number of ranges currently stored
    pub fn live(&self) -> usize {
        self.live
    }

    /// True when nothing is stored
    pub fn is_unused(&self) -> bool {
        self.live == 0
    }
}
