//! Buffer resource wrapper.

use crate::api::info::BufferCreateInfo;
use crate::driver::{BufferDesc, BufferId, GpuDriver};
use crate::error::{BackendError, BackendResult};
use crate::resources::LifecycleState;

/// A buffer owned by the controller. Allocates lazily like textures.
#[derive(Debug)]
pub struct BufferResource {
    info: BufferCreateInfo,
    buffer: Option<BufferId>,
    mapped: bool,
    state: LifecycleState,
}

impl BufferResource {
    /// Wraps a create-info.
    pub fn new(info: BufferCreateInfo) -> Self {
        BufferResource {
            info,
            buffer: None,
            mapped: false,
            state: LifecycleState::PendingCreate,
        }
    }

    /// The creation descriptor.
    pub fn info(&self) -> &BufferCreateInfo {
        &self.info
    }

    /// The driver buffer, once instantiated.
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }

    /// Whether a new create-info may take over this buffer's native object.
    pub fn is_compatible_with(&self, info: &BufferCreateInfo) -> bool {
        self.info.size == info.size
            && self.info.usage == info.usage
            && self.info.cpu_accessible == info.cpu_accessible
    }

    /// Takes the driver buffer out of this wrapper for reuse elsewhere.
    pub fn take_driver_objects(&mut self) -> Option<BufferId> {
        self.buffer.take()
    }

    /// Installs a driver buffer taken from a recycled predecessor.
    pub fn adopt_driver_objects(&mut self, buffer: Option<BufferId>) {
        self.buffer = buffer;
        if self.buffer.is_some() {
            self.state = LifecycleState::Live;
        }
    }

    /// Creates the driver buffer if not yet present.
    pub fn ensure_initialized(&mut self, driver: &dyn GpuDriver) -> BackendResult<()> {
        if self.buffer.is_some() {
            return Ok(());
        }
        let buffer = driver.create_buffer(&BufferDesc {
            size: self.info.size as u64,
            usage: self.info.usage,
            cpu_accessible: self.info.cpu_accessible,
        })?;
        self.buffer = Some(buffer);
        self.state = LifecycleState::Live;
        Ok(())
    }

    /// Maps a range of a host-visible buffer. The range is validated
    /// against the buffer size; the returned pointer covers `size` bytes
    /// starting at `offset`.
    pub fn map_range(
        &mut self,
        driver: &dyn GpuDriver,
        offset: usize,
        size: usize,
    ) -> BackendResult<*mut u8> {
        if !self.info.cpu_accessible {
            return Err(BackendError::invalid("buffer is not host visible"));
        }
        if offset.checked_add(size).map_or(true, |end| end > self.info.size) {
            return Err(BackendError::invalid("mapped range exceeds buffer size"));
        }
        self.ensure_initialized(driver)?;
        let buffer = self.buffer.ok_or(BackendError::StaleHandle { kind: "buffer" })?;
        let base = driver.map_buffer(buffer)?;
        self.mapped = true;
        // Safety: the driver mapping covers the whole buffer and the range
        // was bounds-checked above.
        Ok(unsafe { base.add(offset) })
    }

    /// Releases an outstanding mapping.
    pub fn unmap(&mut self, driver: &dyn GpuDriver) {
        if self.mapped {
            if let Some(buffer) = self.buffer {
                driver.unmap_buffer(buffer);
            }
            self.mapped = false;
        }
    }

    /// Destroys the driver buffer if this wrapper still owns one.
    pub fn destroy(&mut self, driver: &dyn GpuDriver) {
        if let Some(buffer) = self.buffer.take() {
            if self.mapped {
                driver.unmap_buffer(buffer);
                self.mapped = false;
            }
            driver.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::BufferUsageFlags;
    use crate::driver::recording::RecordingDriver;

    fn vertex_info(size: usize) -> BufferCreateInfo {
        BufferCreateInfo {
            size,
            usage: BufferUsageFlags::VERTEX_BUFFER | BufferUsageFlags::TRANSFER_DST,
            cpu_accessible: false,
        }
    }

    #[test]
    fn test_compatibility_requires_matching_descriptor() {
        let buffer = BufferResource::new(vertex_info(1024));
        assert!(buffer.is_compatible_with(&vertex_info(1024)));
        assert!(!buffer.is_compatible_with(&vertex_info(2048)));
        assert!(!buffer.is_compatible_with(&BufferCreateInfo {
            usage: BufferUsageFlags::UNIFORM_BUFFER,
            ..vertex_info(1024)
        }));
    }

    #[test]
    fn test_map_range_validates_bounds_and_visibility() {
        let driver = RecordingDriver::new();

        let mut device_local = BufferResource::new(vertex_info(64));
        assert!(device_local.map_range(&driver, 0, 16).is_err());

        let mut host_visible = BufferResource::new(BufferCreateInfo {
            cpu_accessible: true,
            ..vertex_info(64)
        });
        assert!(host_visible.map_range(&driver, 32, 64).is_err());
        let ptr = host_visible.map_range(&driver, 16, 32).unwrap();
        assert!(!ptr.is_null());
        host_visible.unmap(&driver);
        host_visible.destroy(&driver);
    }
}
