//! Framebuffer resource wrapper.

use crate::api::handles::RenderPassHandle;
use crate::api::info::FramebufferCreateInfo;
use crate::api::types::Extent2D;
use crate::driver::{FramebufferDesc, FramebufferId, GpuDriver, ImageViewId, RenderPassId};
use crate::error::BackendResult;
use crate::resources::LifecycleState;

/// An off-screen framebuffer owned by the controller. The controller
/// resolves attachment textures to views before initialization.
#[derive(Debug)]
pub struct FramebufferResource {
    info: FramebufferCreateInfo,
    framebuffer: Option<FramebufferId>,
    state: LifecycleState,
}

impl FramebufferResource {
    /// Wraps a create-info; the driver object is built by
    /// [`FramebufferResource::initialize`] once attachments resolve.
    pub fn new(info: FramebufferCreateInfo) -> Self {
        FramebufferResource {
            info,
            framebuffer: None,
            state: LifecycleState::PendingCreate,
        }
    }

    /// The creation descriptor.
    pub fn info(&self) -> &FramebufferCreateInfo {
        &self.info
    }

    /// The render pass this framebuffer was declared against.
    pub fn render_pass_handle(&self) -> Option<RenderPassHandle> {
        self.info.render_pass
    }

    /// The driver framebuffer, once instantiated.
    pub fn framebuffer(&self) -> Option<FramebufferId> {
        self.framebuffer
    }

    /// Framebuffer extent.
    pub fn extent(&self) -> Extent2D {
        self.info.size
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }

    /// Builds the driver framebuffer from resolved attachment views.
    pub fn initialize(
        &mut self,
        driver: &dyn GpuDriver,
        render_pass: RenderPassId,
        attachments: Vec<ImageViewId>,
    ) -> BackendResult<()> {
        if self.framebuffer.is_some() {
            return Ok(());
        }
        let framebuffer = driver.create_framebuffer(&FramebufferDesc {
            render_pass,
            attachments,
            extent: self.info.size,
        })?;
        self.framebuffer = Some(framebuffer);
        self.state = LifecycleState::Live;
        Ok(())
    }

    /// Destroys the driver framebuffer if this wrapper still owns it.
    pub fn destroy(&mut self, driver: &dyn GpuDriver) {
        if let Some(framebuffer) = self.framebuffer.take() {
            driver.destroy_framebuffer(framebuffer);
        }
    }
}
