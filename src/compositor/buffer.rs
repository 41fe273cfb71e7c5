//! Buffer tracking and the client release contract
//!
//! Buffers are the only resource shared between a client (producer) and the
//! compositor (consumer). The compositor takes a hold on a buffer when a
//! commit makes it current, and may take further holds while an output frame
//! reads it. When the last hold drops, a release notification is queued for
//! the producer; the client must not reuse the memory before receiving it.

use std::collections::HashMap;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

/// Unique identifier for buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

impl BufferId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        BufferId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Pixel formats understood by the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit ARGB (A in high byte)
    Argb8888,
    /// 32-bit XRGB (X in high byte, alpha ignored)
    Xrgb8888,
    /// Other format with raw fourcc/wl_shm value
    Other(u32),
}

impl PixelFormat {
    /// Create from a wl_shm format value
    pub fn from_wayland(format: u32) -> Self {
        match format {
            0 => PixelFormat::Argb8888,
            1 => PixelFormat::Xrgb8888,
            other => PixelFormat::Other(other),
        }
    }

    /// Convert to a wl_shm format value
    pub fn to_wayland(&self) -> u32 {
        match self {
            PixelFormat::Argb8888 => 0,
            PixelFormat::Xrgb8888 => 1,
            PixelFormat::Other(v) => *v,
        }
    }

    /// Bytes per pixel
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => 4,
            PixelFormat::Other(_) => 4,
        }
    }
}

/// One plane of a dmabuf import
#[derive(Debug)]
pub struct DmabufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
    pub modifier: u64,
}

/// Where a buffer's pixels live
#[derive(Debug)]
pub enum BufferStorage {
    /// Slice of a client shared-memory pool
    Shm {
        pool: crate::protocol::shm::ShmPoolId,
        offset: u32,
    },
    /// Imported GPU buffer, one fd per plane
    Dmabuf { planes: Vec<DmabufPlane> },
    /// Compositor-allocated memory (cursor images, server-drawn content)
    Local { memory: memmap2::MmapMut },
}

/// A pixel-memory descriptor
#[derive(Debug)]
pub struct Buffer {
    pub id: BufferId,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub storage: BufferStorage,
}

impl Buffer {
    pub fn new(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        storage: BufferStorage,
    ) -> Self {
        Self {
            id: BufferId::new(),
            width,
            height,
            stride,
            format,
            storage,
        }
    }

    /// Size of the pixel data in bytes
    pub fn data_size(&self) -> usize {
        (self.stride * self.height) as usize
    }
}

/// Errors from buffer bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("unknown buffer id")]
    UnknownBuffer,
    #[error("buffer allocation failed")]
    AllocationFailed,
}

struct BufferEntry {
    buffer: Buffer,
    /// Outstanding compositor holds: commits and in-flight frames
    holds: u32,
    /// Client destroyed its handle; reclaim once the holds drop
    destroyed: bool,
}

/// Tracks every buffer known to the compositor and its holds
pub struct BufferManager {
    buffers: HashMap<BufferId, BufferEntry>,
    /// Buffers whose last hold dropped and that the producer may now reuse
    pending_release: Vec<BufferId>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            pending_release: Vec::new(),
        }
    }

    /// Register a buffer the client (or allocator) produced
    pub fn insert(&mut self, buffer: Buffer) -> BufferId {
        let id = buffer.id;
        self.buffers.insert(
            id,
            BufferEntry {
                buffer,
                holds: 0,
                destroyed: false,
            },
        );
        id
    }

    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(&id).map(|e| &e.buffer)
    }

    /// Take a hold on a buffer the compositor is about to read from
    pub fn acquire(&mut self, id: BufferId) -> Result<(), BufferError> {
        let entry = self.buffers.get_mut(&id).ok_or(BufferError::UnknownBuffer)?;
        entry.holds += 1;
        Ok(())
    }

    /// Drop a hold; queues a release notification when the last one drops
    pub fn release(&mut self, id: BufferId) {
        let Some(entry) = self.buffers.get_mut(&id) else {
            return;
        };
        entry.holds = entry.holds.saturating_sub(1);
        if entry.holds == 0 {
            if entry.destroyed {
                self.buffers.remove(&id);
                debug!("Reclaimed destroyed buffer {:?}", id);
            } else {
                self.pending_release.push(id);
            }
        }
    }

    /// Client destroyed its buffer handle
    pub fn destroy(&mut self, id: BufferId) {
        if let Some(entry) = self.buffers.get_mut(&id) {
            if entry.holds == 0 {
                self.buffers.remove(&id);
            } else {
                entry.destroyed = true;
            }
        }
    }

    /// Number of outstanding holds, for lifecycle assertions
    pub fn holds(&self, id: BufferId) -> u32 {
        self.buffers.get(&id).map(|e| e.holds).unwrap_or(0)
    }

    /// Drain the queue of buffers the producer may now reuse
    pub fn take_releases(&mut self) -> Vec<BufferId> {
        std::mem::take(&mut self.pending_release)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability surface of the GPU/DRM allocator collaborator
///
/// Losing the allocator is fatal to the process; a failed allocation is not,
/// and is surfaced to the requesting client instead.
pub trait Allocator {
    /// Allocate a compositor-local buffer
    fn allocate(&mut self, width: u32, height: u32, format: PixelFormat)
        -> Result<Buffer, BufferError>;

    /// Import a client dmabuf
    fn import_dmabuf(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<DmabufPlane>,
    ) -> Result<Buffer, BufferError>;
}

/// CPU-memory allocator backed by anonymous memfds
///
/// Stands in where no GPU allocator is attached; dmabuf imports are accepted
/// as descriptors and never mapped.
pub struct MemfdAllocator;

impl MemfdAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MemfdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for MemfdAllocator {
    fn allocate(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Buffer, BufferError> {
        let stride = width * format.bytes_per_pixel();
        let size = (stride * height) as u64;

        let fd = rustix::fs::memfd_create("nacre-buffer", rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|_| BufferError::AllocationFailed)?;
        rustix::fs::ftruncate(&fd, size).map_err(|_| BufferError::AllocationFailed)?;

        let file = std::fs::File::from(fd);
        let memory =
            unsafe { memmap2::MmapMut::map_mut(&file) }.map_err(|_| BufferError::AllocationFailed)?;

        debug!("Allocated {}x{} local buffer ({} bytes)", width, height, size);

        Ok(Buffer::new(
            width,
            height,
            stride,
            format,
            BufferStorage::Local { memory },
        ))
    }

    fn import_dmabuf(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<DmabufPlane>,
    ) -> Result<Buffer, BufferError> {
        if planes.is_empty() {
            return Err(BufferError::AllocationFailed);
        }
        let stride = planes[0].stride;
        Ok(Buffer::new(
            width,
            height,
            stride,
            format,
            BufferStorage::Dmabuf { planes },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::shm::ShmPoolId;

    fn shm_buffer(width: u32, height: u32) -> Buffer {
        Buffer::new(
            width,
            height,
            width * 4,
            PixelFormat::Argb8888,
            BufferStorage::Shm {
                pool: ShmPoolId(1),
                offset: 0,
            },
        )
    }

    #[test]
    fn test_pixel_format() {
        assert_eq!(PixelFormat::from_wayland(0), PixelFormat::Argb8888);
        assert_eq!(PixelFormat::Argb8888.to_wayland(), 0);
        assert_eq!(PixelFormat::Xrgb8888.bytes_per_pixel(), 4);
    }

    #[test]
    fn test_release_queued_after_last_hold() {
        let mut manager = BufferManager::new();
        let id = manager.insert(shm_buffer(100, 100));

        manager.acquire(id).unwrap();
        manager.acquire(id).unwrap();
        assert_eq!(manager.holds(id), 2);

        manager.release(id);
        assert!(manager.take_releases().is_empty());

        manager.release(id);
        assert_eq!(manager.take_releases(), vec![id]);
    }

    #[test]
    fn test_destroy_with_outstanding_hold() {
        let mut manager = BufferManager::new();
        let id = manager.insert(shm_buffer(64, 64));

        manager.acquire(id).unwrap();
        manager.destroy(id);
        // Still alive for the compositor's read
        assert!(manager.get(id).is_some());

        manager.release(id);
        // No release notification for a destroyed buffer, just reclamation
        assert!(manager.take_releases().is_empty());
        assert!(manager.get(id).is_none());
    }

    #[test]
    fn test_acquire_unknown_buffer() {
        let mut manager = BufferManager::new();
        assert_eq!(
            manager.acquire(BufferId(9999)),
            Err(BufferError::UnknownBuffer)
        );
    }

    #[test]
    fn test_memfd_allocator() {
        let mut allocator = MemfdAllocator::new();
        let buffer = allocator.allocate(32, 32, PixelFormat::Argb8888).unwrap();
        assert_eq!(buffer.stride, 128);
        assert_eq!(buffer.data_size(), 4096);
        match buffer.storage {
            BufferStorage::Local { ref memory } => assert_eq!(memory.len(), 4096),
            _ => panic!("expected local storage"),
        }
    }
}
