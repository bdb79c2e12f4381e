//! Client-facing resource handles.
//!
//! The controller is the sole owner of every resource object; the rendering
//! core only ever holds these copyable keys. A handle says nothing about
//! liveness: resolving one against the controller after discard yields
//! `None`, which the replay path treats as a programming error in the core.

use slotmap::new_key_type;

new_key_type! {
    /// Key for a texture owned by the controller.
    pub struct TextureHandle;
    /// Key for a buffer owned by the controller.
    pub struct BufferHandle;
    /// Key for a sampler owned by the controller.
    pub struct SamplerHandle;
    /// Key for a shader stage owned by the controller.
    pub struct ShaderHandle;
    /// Key for a linked program owned by the controller.
    pub struct ProgramHandle;
    /// Key for a render pass description owned by the controller.
    pub struct RenderPassHandle;
    /// Key for a render target owned by the controller.
    pub struct RenderTargetHandle;
    /// Key for a framebuffer owned by the controller.
    pub struct FramebufferHandle;
    /// Key for a pipeline owned by the controller.
    pub struct PipelineHandle;
    /// Key for a command buffer owned by the controller.
    pub struct CommandBufferHandle;
    /// Key for a sync object owned by the controller.
    pub struct SyncObjectHandle;
}
