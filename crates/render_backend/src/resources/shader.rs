//! Shader resource wrapper.

use crate::api::info::ShaderCreateInfo;
use crate::driver::{GpuDriver, ShaderId};
use crate::error::{BackendError, BackendResult};
use crate::resources::LifecycleState;

/// A compiled shader module owned by the controller.
#[derive(Debug)]
pub struct ShaderResource {
    info: ShaderCreateInfo,
    module: Option<ShaderId>,
    state: LifecycleState,
}

impl ShaderResource {
    /// Compiles the module immediately.
    pub fn create(info: ShaderCreateInfo, driver: &dyn GpuDriver) -> BackendResult<Self> {
        if info.stage.is_none() {
            return Err(BackendError::invalid("shader create-info missing a stage"));
        }
        let module = driver.create_shader_module(&info.source)?;
        Ok(ShaderResource {
            info,
            module: Some(module),
            state: LifecycleState::Live,
        })
    }

    /// The creation descriptor, including reflection metadata.
    pub fn info(&self) -> &ShaderCreateInfo {
        &self.info
    }

    /// The driver module.
    pub fn module(&self) -> Option<ShaderId> {
        self.module
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }

    /// Whether a new create-info may take over this module. Identical
    /// bytecode in the same stage compiles to an identical module.
    pub fn is_compatible_with(&self, info: &ShaderCreateInfo) -> bool {
        self.info.stage == info.stage
            && self.info.entry_point == info.entry_point
            && self.info.source == info.source
    }

    /// Takes the driver module out of this wrapper for reuse elsewhere.
    pub fn take_driver_objects(&mut self) -> Option<ShaderId> {
        self.module.take()
    }

    /// Builds a wrapper around a recycled driver module.
    pub fn from_recycled(info: ShaderCreateInfo, module: ShaderId) -> Self {
        ShaderResource {
            info,
            module: Some(module),
            state: LifecycleState::Live,
        }
    }

    /// Destroys the driver module if this wrapper still owns it.
    pub fn destroy(&mut self, driver: &dyn GpuDriver) {
        if let Some(module) = self.module.take() {
            driver.destroy_shader_module(module);
        }
    }
}
