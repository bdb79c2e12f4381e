//! Controller-owned resource wrappers.
//!
//! Each kind is a concrete struct owning at most one set of native driver
//! ids. Lifecycle is tracked by a shared state tag; the controller's create
//! and discard queues carry kind-tagged entries so drains dispatch with a
//! plain match.

pub mod buffer;
pub mod framebuffer;
pub mod program;
pub mod render_pass;
pub mod render_target;
pub mod sampler;
pub mod shader;
pub mod sync_object;
pub mod texture;

pub use buffer::BufferResource;
pub use framebuffer::FramebufferResource;
pub use program::{ProgramReflection, ProgramResource};
pub use render_pass::RenderPassResource;
pub use render_target::RenderTargetResource;
pub use sampler::SamplerResource;
pub use shader::ShaderResource;
pub use sync_object::SyncObjectResource;
pub use texture::TextureResource;

use crate::api::handles::{
    BufferHandle, FramebufferHandle, PipelineHandle, ProgramHandle, RenderPassHandle,
    RenderTargetHandle, SamplerHandle, ShaderHandle, SyncObjectHandle, TextureHandle,
};

/// Lifecycle of a controller-owned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Queued for creation; no native handle yet.
    #[default]
    PendingCreate,
    /// Native handle valid and usable in commands.
    Live,
    /// Queued for destruction; may still be referenced by in-flight
    /// command buffers.
    PendingDiscard,
}

/// Kind-tagged entry in the controller's create queue. Entries drain in
/// push order, so a framebuffer queued after its attachment textures finds
/// them initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateEntry {
    /// A texture awaiting driver allocation.
    Texture(TextureHandle),
    /// A buffer awaiting driver allocation.
    Buffer(BufferHandle),
    /// A framebuffer awaiting attachment resolution.
    Framebuffer(FramebufferHandle),
}

/// Kind-tagged entry in the controller's discard queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardEntry {
    /// A texture queued for destruction.
    Texture(TextureHandle),
    /// A buffer queued for destruction.
    Buffer(BufferHandle),
    /// A sampler queued for destruction.
    Sampler(SamplerHandle),
    /// A shader queued for destruction.
    Shader(ShaderHandle),
    /// A program queued for destruction.
    Program(ProgramHandle),
    /// A render pass queued for destruction.
    RenderPass(RenderPassHandle),
    /// A render target queued for destruction.
    RenderTarget(RenderTargetHandle),
    /// A framebuffer queued for destruction.
    Framebuffer(FramebufferHandle),
    /// A pipeline queued for destruction.
    Pipeline(PipelineHandle),
    /// A sync object queued for destruction.
    SyncObject(SyncObjectHandle),
}

/// Full mip chain length for a base extent.
pub(crate) fn full_mip_chain(width: u32, height: u32) -> u32 {
    let longest = width.max(height).max(1);
    32 - longest.leading_zeros()
}
