//! wl_shm protocol state
//!
//! Shared-memory pools are client-owned files the compositor maps read-only.
//! Buffers carved out of a pool are validated (bounds, stride) before they
//! enter the buffer table; a failed validation is surfaced to the requesting
//! client and nothing is registered.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use memmap2::Mmap;

use crate::compositor::buffer::{Buffer, BufferId, BufferManager, BufferStorage, PixelFormat};

/// Unique identifier for shm pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmPoolId(pub u64);

impl ShmPoolId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ShmPoolId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// SHM protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ShmError {
    #[error("invalid pool")]
    InvalidPool,
    #[error("buffer does not fit in pool")]
    BufferTooLarge,
    #[error("stride smaller than a pixel row")]
    InvalidStride,
    #[error("mapping the pool failed")]
    MapFailed,
}

/// A client shared-memory pool
#[derive(Debug)]
pub struct ShmPool {
    pub id: ShmPoolId,
    file: File,
    size: usize,
    /// Lazily created read-only view
    mapping: Option<Mmap>,
}

impl ShmPool {
    fn new(fd: OwnedFd, size: usize) -> Self {
        Self {
            id: ShmPoolId::new(),
            file: File::from(fd),
            size,
            mapping: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Grow the pool; shrinking is not part of the protocol
    pub fn resize(&mut self, new_size: usize) {
        if new_size > self.size {
            self.size = new_size;
            // Remap on next access
            self.mapping = None;
        }
    }

    /// Map the pool and return the byte view
    pub fn data(&mut self) -> Result<&[u8], ShmError> {
        if self.mapping.is_none() {
            let mapping = unsafe {
                memmap2::MmapOptions::new()
                    .len(self.size)
                    .map(&self.file)
            }
            .map_err(|_| ShmError::MapFailed)?;
            self.mapping = Some(mapping);
        }
        Ok(self.mapping.as_ref().unwrap())
    }
}

/// Tracks every shm pool a client created
pub struct ShmState {
    pools: HashMap<ShmPoolId, ShmPool>,
}

impl ShmState {
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
        }
    }

    /// Formats advertised to clients on bind
    pub fn formats(&self) -> Vec<PixelFormat> {
        vec![PixelFormat::Argb8888, PixelFormat::Xrgb8888]
    }

    /// Register a pool over a client-provided fd
    pub fn create_pool(&mut self, fd: OwnedFd, size: usize) -> ShmPoolId {
        let pool = ShmPool::new(fd, size);
        let id = pool.id;
        self.pools.insert(id, pool);
        debug!("Created shm pool {:?}, {} bytes", id, size);
        id
    }

    pub fn resize_pool(&mut self, id: ShmPoolId, new_size: usize) -> Result<(), ShmError> {
        let pool = self.pools.get_mut(&id).ok_or(ShmError::InvalidPool)?;
        pool.resize(new_size);
        debug!("Resized shm pool {:?} to {}", id, new_size);
        Ok(())
    }

    pub fn destroy_pool(&mut self, id: ShmPoolId) {
        self.pools.remove(&id);
        debug!("Destroyed shm pool {:?}", id);
    }

    pub fn get_pool(&self, id: ShmPoolId) -> Option<&ShmPool> {
        self.pools.get(&id)
    }

    pub fn get_pool_mut(&mut self, id: ShmPoolId) -> Option<&mut ShmPool> {
        self.pools.get_mut(&id)
    }

    /// Validate a buffer against its pool and register it
    pub fn create_buffer(
        &mut self,
        buffers: &mut BufferManager,
        pool_id: ShmPoolId,
        offset: u32,
        width: u32,
        height: u32,
        stride: u32,
        format: u32,
    ) -> Result<BufferId, ShmError> {
        let pool = self.pools.get(&pool_id).ok_or(ShmError::InvalidPool)?;
        let format = PixelFormat::from_wayland(format);

        let end = offset as usize + (stride as usize * height as usize);
        if end > pool.size {
            return Err(ShmError::BufferTooLarge);
        }
        if stride < width * format.bytes_per_pixel() {
            return Err(ShmError::InvalidStride);
        }

        let buffer = Buffer::new(
            width,
            height,
            stride,
            format,
            BufferStorage::Shm {
                pool: pool_id,
                offset,
            },
        );
        let id = buffers.insert(buffer);
        debug!(
            "Created shm buffer {:?} {}x{} from pool {:?}",
            id, width, height, pool_id
        );
        Ok(id)
    }
}

impl Default for ShmState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::OwnedFd;

    fn pool_fd(size: usize) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; size]).unwrap();
        OwnedFd::from(file)
    }

    #[test]
    fn test_formats_advertised() {
        let shm = ShmState::new();
        assert!(shm.formats().contains(&PixelFormat::Argb8888));
        assert!(shm.formats().contains(&PixelFormat::Xrgb8888));
    }

    #[test]
    fn test_create_and_map_pool() {
        let mut shm = ShmState::new();
        let id = shm.create_pool(pool_fd(4096), 4096);

        let pool = shm.get_pool_mut(id).unwrap();
        let data = pool.data().unwrap();
        assert_eq!(data.len(), 4096);
    }

    #[test]
    fn test_create_buffer_validates_bounds() {
        let mut shm = ShmState::new();
        let mut buffers = BufferManager::new();
        let pool = shm.create_pool(pool_fd(40_000), 40_000);

        // 100x100 ARGB fits exactly
        let id = shm
            .create_buffer(&mut buffers, pool, 0, 100, 100, 400, 0)
            .unwrap();
        assert!(buffers.get(id).is_some());

        // One row past the end does not
        assert_eq!(
            shm.create_buffer(&mut buffers, pool, 400, 100, 100, 400, 0),
            Err(ShmError::BufferTooLarge)
        );
    }

    #[test]
    fn test_create_buffer_validates_stride() {
        let mut shm = ShmState::new();
        let mut buffers = BufferManager::new();
        let pool = shm.create_pool(pool_fd(40_000), 40_000);

        assert_eq!(
            shm.create_buffer(&mut buffers, pool, 0, 100, 50, 100, 0),
            Err(ShmError::InvalidStride)
        );
    }

    #[test]
    fn test_unknown_pool_rejected() {
        let mut shm = ShmState::new();
        let mut buffers = BufferManager::new();
        assert_eq!(
            shm.create_buffer(&mut buffers, ShmPoolId(999), 0, 10, 10, 40, 0),
            Err(ShmError::InvalidPool)
        );
    }
}
