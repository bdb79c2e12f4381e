//! Sampler resource wrapper.

use crate::api::info::SamplerCreateInfo;
use crate::driver::{GpuDriver, SamplerId};
use crate::error::BackendResult;
use crate::resources::LifecycleState;

/// A sampler owned by the controller. Samplers are cheap and created
/// eagerly.
#[derive(Debug)]
pub struct SamplerResource {
    info: SamplerCreateInfo,
    sampler: Option<SamplerId>,
    state: LifecycleState,
}

impl SamplerResource {
    /// Creates the driver sampler immediately.
    pub fn create(info: SamplerCreateInfo, driver: &dyn GpuDriver) -> BackendResult<Self> {
        let sampler = driver.create_sampler(&info)?;
        Ok(SamplerResource {
            info,
            sampler: Some(sampler),
            state: LifecycleState::Live,
        })
    }

    /// The creation descriptor.
    pub fn info(&self) -> &SamplerCreateInfo {
        &self.info
    }

    /// The driver sampler.
    pub fn sampler(&self) -> Option<SamplerId> {
        self.sampler
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }

    /// Whether a new create-info may take over this sampler's native
    /// object.
    pub fn is_compatible_with(&self, info: &SamplerCreateInfo) -> bool {
        self.info == *info
    }

    /// Takes the driver sampler out of this wrapper for reuse elsewhere.
    pub fn take_driver_objects(&mut self) -> Option<SamplerId> {
        self.sampler.take()
    }

    /// Builds a wrapper around a recycled driver sampler.
    pub fn from_recycled(info: SamplerCreateInfo, sampler: SamplerId) -> Self {
        SamplerResource {
            info,
            sampler: Some(sampler),
            state: LifecycleState::Live,
        }
    }

    /// Destroys the driver sampler if this wrapper still owns it.
    pub fn destroy(&mut self, driver: &dyn GpuDriver) {
        if let Some(sampler) = self.sampler.take() {
            driver.destroy_sampler(sampler);
        }
    }
}
