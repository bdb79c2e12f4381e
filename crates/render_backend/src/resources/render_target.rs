//! Render target resource wrapper.

use std::sync::Arc;

use crate::api::handles::FramebufferHandle;
use crate::api::info::RenderTargetCreateInfo;
use crate::api::types::Extent2D;
use crate::driver::{GpuDriver, SurfaceDesc, SurfaceId};
use crate::error::BackendResult;
use crate::native_image::surface::RenderSurface;
use crate::resources::LifecycleState;

/// Where a render target draws: a window surface or an off-screen
/// framebuffer. A target configured with neither is tolerated at creation
/// and trips a fatal assertion when a pipeline first selects it.
#[derive(Debug)]
pub struct RenderTargetResource {
    info: RenderTargetCreateInfo,
    surface_id: Option<SurfaceId>,
    state: LifecycleState,
}

impl RenderTargetResource {
    /// Wraps a create-info, registering surface targets with the driver.
    pub fn create(info: RenderTargetCreateInfo, driver: &dyn GpuDriver) -> BackendResult<Self> {
        let surface_id = match &info.surface {
            Some(surface) => Some(driver.register_surface(&SurfaceDesc {
                extent: surface.extent(),
                format: surface.color_format(),
                buffer_count: 2,
            })?),
            None => None,
        };
        Ok(RenderTargetResource {
            info,
            surface_id,
            state: LifecycleState::Live,
        })
    }

    /// The creation descriptor.
    pub fn info(&self) -> &RenderTargetCreateInfo {
        &self.info
    }

    /// Whether this target draws to a window surface.
    pub fn is_surface(&self) -> bool {
        self.info.surface.is_some()
    }

    /// The window surface, for surface targets.
    pub fn surface(&self) -> Option<&Arc<dyn RenderSurface>> {
        self.info.surface.as_ref()
    }

    /// The driver-side surface registration, for surface targets.
    pub fn surface_id(&self) -> Option<SurfaceId> {
        self.surface_id
    }

    /// The off-screen framebuffer, for framebuffer targets.
    pub fn framebuffer(&self) -> Option<FramebufferHandle> {
        self.info.framebuffer
    }

    /// Target extent.
    pub fn extent(&self) -> Extent2D {
        self.info.extent
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }

    /// Unregisters a surface target from the driver.
    pub fn destroy(&mut self, driver: &dyn GpuDriver) {
        if let Some(surface_id) = self.surface_id.take() {
            driver.unregister_surface(surface_id);
        }
    }
}
