//! Render pass resource wrapper and compatibility test.

use crate::api::info::RenderPassCreateInfo;
use crate::api::types::Format;
use crate::driver::{GpuDriver, RenderPassId};
use crate::error::BackendResult;
use crate::resources::LifecycleState;

/// A render pass owned by the controller.
#[derive(Debug)]
pub struct RenderPassResource {
    info: RenderPassCreateInfo,
    render_pass: Option<RenderPassId>,
    state: LifecycleState,
}

impl RenderPassResource {
    /// Creates the driver render pass immediately.
    pub fn create(info: RenderPassCreateInfo, driver: &dyn GpuDriver) -> BackendResult<Self> {
        let render_pass = driver.create_render_pass(&info)?;
        Ok(RenderPassResource {
            info,
            render_pass: Some(render_pass),
            state: LifecycleState::Live,
        })
    }

    /// The creation descriptor.
    pub fn info(&self) -> &RenderPassCreateInfo {
        &self.info
    }

    /// The driver render pass.
    pub fn render_pass(&self) -> Option<RenderPassId> {
        self.render_pass
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }

    /// Attachment formats in binding order; the identity two passes must
    /// share to be compatible.
    pub fn attachment_formats(&self) -> impl Iterator<Item = Format> + '_ {
        self.info.attachments.iter().map(|a| a.format)
    }

    /// Whether pipelines compiled against `other` remain valid for this
    /// pass: same attachment count, formats and ordering. Load and store
    /// ops do not affect compatibility.
    pub fn is_compatible_with(&self, other: &RenderPassResource) -> bool {
        self.info.attachments.len() == other.info.attachments.len()
            && self.attachment_formats().eq(other.attachment_formats())
    }

    /// Destroys the driver render pass if this wrapper still owns it.
    pub fn destroy(&mut self, driver: &dyn GpuDriver) {
        if let Some(render_pass) = self.render_pass.take() {
            driver.destroy_render_pass(render_pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::info::AttachmentDescription;
    use crate::api::types::{AttachmentLoadOp, AttachmentStoreOp};
    use crate::driver::recording::RecordingDriver;

    fn pass_with(formats: &[Format], load_op: AttachmentLoadOp) -> RenderPassCreateInfo {
        RenderPassCreateInfo {
            attachments: formats
                .iter()
                .map(|&format| AttachmentDescription {
                    format,
                    load_op,
                    store_op: AttachmentStoreOp::Store,
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn test_compatibility_is_format_sequence_equality() {
        let driver = RecordingDriver::new();
        let rgba_d24 = [Format::R8G8B8A8Unorm, Format::D24UnormS8Uint];

        let a = RenderPassResource::create(pass_with(&rgba_d24, AttachmentLoadOp::Clear), &driver)
            .unwrap();
        let b = RenderPassResource::create(pass_with(&rgba_d24, AttachmentLoadOp::Load), &driver)
            .unwrap();
        let c = RenderPassResource::create(
            pass_with(&[Format::B8G8R8A8Unorm, Format::D24UnormS8Uint], AttachmentLoadOp::Clear),
            &driver,
        )
        .unwrap();
        let d = RenderPassResource::create(
            pass_with(&[Format::R8G8B8A8Unorm], AttachmentLoadOp::Clear),
            &driver,
        )
        .unwrap();

        // Load/store ops differ: still compatible.
        assert!(a.is_compatible_with(&b));
        // Format differs: incompatible.
        assert!(!a.is_compatible_with(&c));
        // Attachment count differs: incompatible.
        assert!(!a.is_compatible_with(&d));
    }
}
