//! Sync object resource wrapper.

use crate::driver::{FenceId, GpuDriver};
use crate::error::{BackendError, BackendResult};
use crate::resources::LifecycleState;

/// A host-waitable fence owned by the controller, signaled when the
/// submission it rides with completes.
#[derive(Debug)]
pub struct SyncObjectResource {
    fence: Option<FenceId>,
    state: LifecycleState,
}

impl SyncObjectResource {
    /// Creates an unsignaled fence.
    pub fn create(driver: &dyn GpuDriver) -> BackendResult<Self> {
        let fence = driver.create_fence(false)?;
        Ok(SyncObjectResource {
            fence: Some(fence),
            state: LifecycleState::Live,
        })
    }

    /// The driver fence.
    pub fn fence(&self) -> Option<FenceId> {
        self.fence
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }

    /// Blocks until the fence signals. Fence waits carry no timeout; a
    /// hung fence is a fatal condition for the caller.
    pub fn wait(&self, driver: &dyn GpuDriver) -> BackendResult<()> {
        let fence = self.fence.ok_or(BackendError::StaleHandle { kind: "sync object" })?;
        driver.wait_for_fence(fence, u64::MAX)?;
        Ok(())
    }

    /// Destroys the driver fence if this wrapper still owns it.
    pub fn destroy(&mut self, driver: &dyn GpuDriver) {
        if let Some(fence) = self.fence.take() {
            driver.destroy_fence(fence);
        }
    }
}
