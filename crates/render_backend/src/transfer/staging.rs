//! Shared staging buffer for staged texture uploads.
//!
//! One long-lived host-visible buffer backs every staged copy of a frame.
//! Requests claim cumulative, pairwise-disjoint byte ranges; worker tasks
//! write into their range through a [`SendPtr`] while the buffer stays
//! mapped. Growing the buffer retires the old allocation, which must stay
//! alive until pending copies sourced from it have drained.

use crate::api::types::BufferUsageFlags;
use crate::driver::{BufferDesc, BufferId, GpuDriver};
use crate::error::{BackendError, BackendResult};

/// Copy destinations must start at a 4-byte boundary for buffer-to-image
/// transfers.
pub const STAGING_ALIGNMENT: u64 = 4;

/// Raw pointer into mapped staging or image memory, sendable to workers.
///
/// Soundness rests on range discipline: every task receives a byte range
/// disjoint from all other tasks in the same batch, and the mapping
/// outlives the batch wait.
#[derive(Clone, Copy)]
pub struct SendPtr(*mut u8);

unsafe impl Send for SendPtr {}

impl SendPtr {
    /// Wraps a mapped base pointer.
    pub fn new(ptr: *mut u8) -> Self {
        SendPtr(ptr)
    }

    /// A mutable slice of `len` bytes starting `offset` bytes in.
    ///
    /// # Safety
    /// The range `[offset, offset + len)` must lie inside the mapping and
    /// must not be aliased by any other live slice.
    pub unsafe fn slice_at(&self, offset: u64, len: usize) -> &'static mut [u8] {
        std::slice::from_raw_parts_mut(self.0.add(offset as usize), len)
    }
}

/// Read-only view of caller-owned source bytes, sendable to workers.
///
/// The referent must outlive the batch wait that consumes it.
#[derive(Clone, Copy)]
pub struct SendSlice {
    ptr: *const u8,
    len: usize,
}

unsafe impl Send for SendSlice {}

impl SendSlice {
    /// Captures a byte slice.
    pub fn new(bytes: &[u8]) -> Self {
        SendSlice {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    /// Reborrows the captured bytes.
    ///
    /// # Safety
    /// The original slice must still be live and unmodified.
    pub unsafe fn as_slice(&self) -> &'static [u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// The long-lived staging allocation plus a bump offset for the frame.
pub struct StagingBuffer {
    buffer: Option<BufferId>,
    capacity: u64,
    block_size: u64,
    offset: u64,
}

impl StagingBuffer {
    /// An empty staging buffer that allocates in `block_size` multiples.
    pub fn new(block_size: u64) -> Self {
        StagingBuffer {
            buffer: None,
            capacity: 0,
            block_size: block_size.max(STAGING_ALIGNMENT),
            offset: 0,
        }
    }

    /// The current backing buffer, if one has been allocated.
    pub fn id(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Current capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes claimed so far this frame.
    pub fn used(&self) -> u64 {
        self.offset
    }

    /// Resets the bump offset for a new batch of claims.
    pub fn begin_frame(&mut self) {
        self.offset = 0;
    }

    /// Claims an aligned range of `size` bytes, returning its offset.
    pub fn claim(&mut self, size: u64) -> u64 {
        let start = align_up(self.offset, STAGING_ALIGNMENT);
        self.offset = start + size;
        start
    }

    /// Ensures capacity for every claimed range, growing in block multiples.
    ///
    /// Returns the retired buffer when the allocation was replaced; the
    /// caller owns destroying it once no pending copy references it.
    pub fn ensure_capacity(&mut self, driver: &dyn GpuDriver) -> BackendResult<Option<BufferId>> {
        if self.offset == 0 {
            return Ok(None);
        }
        if self.offset <= self.capacity && self.buffer.is_some() {
            return Ok(None);
        }

        let new_capacity = self
            .offset
            .div_ceil(self.block_size)
            .max(1)
            .saturating_mul(self.block_size);
        let buffer = driver.create_buffer(&BufferDesc {
            size: new_capacity,
            usage: BufferUsageFlags::TRANSFER_SRC,
            cpu_accessible: true,
        })?;

        let retired = self.buffer.replace(buffer);
        self.capacity = new_capacity;
        log::debug!(
            "staging buffer grown to {} bytes (retired previous: {})",
            new_capacity,
            retired.is_some()
        );
        Ok(retired)
    }

    /// Maps the buffer for worker writes.
    pub fn map(&self, driver: &dyn GpuDriver) -> BackendResult<SendPtr> {
        let buffer = self
            .buffer
            .ok_or_else(|| BackendError::invalid("staging buffer mapped before allocation"))?;
        Ok(SendPtr::new(driver.map_buffer(buffer)?))
    }

    /// Flushes the claimed range and releases the mapping.
    pub fn unmap(&self, driver: &dyn GpuDriver) -> BackendResult<()> {
        if let Some(buffer) = self.buffer {
            driver.flush_mapped_buffer(buffer, 0, self.offset)?;
            driver.unmap_buffer(buffer);
        }
        Ok(())
    }

    /// Destroys the backing allocation.
    pub fn destroy(&mut self, driver: &dyn GpuDriver) {
        if let Some(buffer) = self.buffer.take() {
            driver.destroy_buffer(buffer);
        }
        self.capacity = 0;
        self.offset = 0;
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::recording::RecordingDriver;

    #[test]
    fn test_claims_are_aligned_and_disjoint() {
        let mut staging = StagingBuffer::new(4096);
        staging.begin_frame();

        let a = staging.claim(10);
        let b = staging.claim(7);
        let c = staging.claim(32);

        assert_eq!(a % STAGING_ALIGNMENT, 0);
        assert_eq!(b % STAGING_ALIGNMENT, 0);
        assert_eq!(c % STAGING_ALIGNMENT, 0);
        assert!(a + 10 <= b);
        assert!(b + 7 <= c);
        assert_eq!(staging.used(), c + 32);
    }

    #[test]
    fn test_capacity_grows_in_block_multiples() {
        let driver = RecordingDriver::new();
        let mut staging = StagingBuffer::new(4096);
        staging.begin_frame();
        staging.claim(100);

        let retired = staging.ensure_capacity(&driver).unwrap();
        assert!(retired.is_none());
        assert_eq!(staging.capacity(), 4096);

        // A claim past the block retires the old allocation.
        staging.begin_frame();
        staging.claim(5000);
        let retired = staging.ensure_capacity(&driver).unwrap();
        assert!(retired.is_some());
        assert_eq!(staging.capacity(), 8192);
    }

    #[test]
    fn test_sufficient_capacity_is_reused() {
        let driver = RecordingDriver::new();
        let mut staging = StagingBuffer::new(4096);
        staging.begin_frame();
        staging.claim(3000);
        staging.ensure_capacity(&driver).unwrap();
        let first = staging.id();

        staging.begin_frame();
        staging.claim(2000);
        let retired = staging.ensure_capacity(&driver).unwrap();
        assert!(retired.is_none());
        assert_eq!(staging.id(), first);
    }
}
