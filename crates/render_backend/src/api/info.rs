//! Create-info and operation descriptors accepted by the controller.

use std::sync::{Arc, Mutex};

use crate::api::handles::{
    BufferHandle, CommandBufferHandle, FramebufferHandle, ProgramHandle, RenderPassHandle,
    RenderTargetHandle, ShaderHandle, TextureHandle,
};
use crate::api::state::{
    ColorBlendState, DepthStencilState, InputAssemblyState, MultisampleState, RasterizationState,
    VertexInputState, ViewportState,
};
use crate::api::types::{
    AttachmentLoadOp, AttachmentStoreOp, BufferUsageFlags, CompareOp, Extent2D, Format, Offset2D,
    SamplerAddressMode, SamplerFilter, SamplerMipmapMode, SubmitFlags, TextureTiling, TextureType,
    TextureUsageFlags,
};
use crate::native_image::surface::RenderSurface;
use crate::native_image::NativeImageSource;

/// Programmable pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    /// Vertex shader stage.
    Vertex,
    /// Fragment shader stage.
    Fragment,
}

/// Texture creation parameters.
#[derive(Clone, Default)]
pub struct TextureCreateInfo {
    /// Dimensionality.
    pub texture_type: TextureType,
    /// Base level size.
    pub size: Extent2D,
    /// Requested pixel format (may be emulated; see [`Format::is_emulated`]).
    pub format: Format,
    /// Allowed usages.
    pub usage: TextureUsageFlags,
    /// Requested memory layout.
    pub tiling: TextureTiling,
    /// Number of mip levels to allocate.
    pub mip_levels: u32,
    /// Backing native image when the texture wraps an external buffer.
    pub native_image: Option<Arc<dyn NativeImageSource>>,
}

impl std::fmt::Debug for TextureCreateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureCreateInfo")
            .field("texture_type", &self.texture_type)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("usage", &self.usage)
            .field("tiling", &self.tiling)
            .field("mip_levels", &self.mip_levels)
            .field("native_image", &self.native_image.is_some())
            .finish()
    }
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferCreateInfo {
    /// Size in bytes.
    pub size: usize,
    /// Allowed usages.
    pub usage: BufferUsageFlags,
    /// Whether the buffer lives in host-visible memory.
    pub cpu_accessible: bool,
}

/// Sampler creation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerCreateInfo {
    /// Minification filter.
    pub min_filter: SamplerFilter,
    /// Magnification filter.
    pub mag_filter: SamplerFilter,
    /// Mip level selection mode.
    pub mipmap_mode: SamplerMipmapMode,
    /// U coordinate wrapping.
    pub address_mode_u: SamplerAddressMode,
    /// V coordinate wrapping.
    pub address_mode_v: SamplerAddressMode,
    /// W coordinate wrapping.
    pub address_mode_w: SamplerAddressMode,
    /// Enable anisotropic filtering.
    pub anisotropy_enable: bool,
    /// Anisotropy clamp when enabled.
    pub max_anisotropy: f32,
    /// Enable depth comparison sampling.
    pub compare_enable: bool,
    /// Comparison function when enabled.
    pub compare_op: CompareOp,
    /// Use unnormalized texel coordinates.
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerCreateInfo {
    fn default() -> Self {
        SamplerCreateInfo {
            min_filter: SamplerFilter::Linear,
            mag_filter: SamplerFilter::Linear,
            mipmap_mode: SamplerMipmapMode::Linear,
            address_mode_u: SamplerAddressMode::Repeat,
            address_mode_v: SamplerAddressMode::Repeat,
            address_mode_w: SamplerAddressMode::Repeat,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
            compare_enable: false,
            compare_op: CompareOp::Always,
            unnormalized_coordinates: false,
        }
    }
}

/// A named member inside a uniform block, for reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMemberInfo {
    /// Member name as declared in the shader.
    pub name: String,
    /// Byte offset within the block.
    pub offset: u32,
    /// Byte size of the member.
    pub size: u32,
}

/// A uniform block declaration, for reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlockInfo {
    /// Block name.
    pub name: String,
    /// Descriptor binding index.
    pub binding: u32,
    /// Total block size in bytes.
    pub size: u32,
    /// Member layout.
    pub members: Vec<UniformMemberInfo>,
}

/// A combined image sampler declaration, for reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerBindingInfo {
    /// Sampler name.
    pub name: String,
    /// Descriptor binding index.
    pub binding: u32,
}

/// Shader stage creation parameters.
///
/// Reflection metadata rides along with the bytecode: the program assembles
/// its reflection view from these declarations at link time.
#[derive(Debug, Clone, Default)]
pub struct ShaderCreateInfo {
    /// Stage this shader occupies.
    pub stage: Option<PipelineStage>,
    /// SPIR-V bytecode.
    pub source: Vec<u8>,
    /// Entry point name.
    pub entry_point: String,
    /// Uniform block declarations.
    pub uniform_blocks: Vec<UniformBlockInfo>,
    /// Sampler declarations.
    pub samplers: Vec<SamplerBindingInfo>,
}

/// Program creation parameters: the set of stages to link.
#[derive(Debug, Clone, Default)]
pub struct ProgramCreateInfo {
    /// Shader stages, one per [`PipelineStage`] at most.
    pub shaders: Vec<ShaderHandle>,
    /// Diagnostic name.
    pub name: String,
}

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AttachmentDescription {
    /// Attachment pixel format.
    pub format: Format,
    /// Color/depth load behavior.
    pub load_op: AttachmentLoadOp,
    /// Color/depth store behavior.
    pub store_op: AttachmentStoreOp,
    /// Stencil load behavior.
    pub stencil_load_op: AttachmentLoadOp,
    /// Stencil store behavior.
    pub stencil_store_op: AttachmentStoreOp,
}

/// Render pass creation parameters.
#[derive(Debug, Clone, Default)]
pub struct RenderPassCreateInfo {
    /// Attachments in binding order; depth/stencil last when present.
    pub attachments: Vec<AttachmentDescription>,
}

/// Render target creation parameters. Exactly one of `surface` /
/// `framebuffer` must be set; a target with neither is a programming error
/// surfaced when a pipeline first selects it.
#[derive(Clone, Default)]
pub struct RenderTargetCreateInfo {
    /// Window surface target.
    pub surface: Option<Arc<dyn RenderSurface>>,
    /// Off-screen framebuffer target.
    pub framebuffer: Option<FramebufferHandle>,
    /// Target extent.
    pub extent: Extent2D,
}

impl std::fmt::Debug for RenderTargetCreateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTargetCreateInfo")
            .field("surface", &self.surface.is_some())
            .field("framebuffer", &self.framebuffer)
            .field("extent", &self.extent)
            .finish()
    }
}

/// One texture bound as a framebuffer attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentBinding {
    /// The attached texture.
    pub texture: TextureHandle,
    /// Attached mip level.
    pub level: u32,
    /// Attached array layer.
    pub layer: u32,
}

/// Framebuffer creation parameters.
#[derive(Debug, Clone, Default)]
pub struct FramebufferCreateInfo {
    /// Color attachments in order.
    pub color_attachments: Vec<AttachmentBinding>,
    /// Optional depth/stencil attachment.
    pub depth_stencil_attachment: Option<AttachmentBinding>,
    /// Render pass describing attachment compatibility.
    pub render_pass: Option<RenderPassHandle>,
    /// Framebuffer size.
    pub size: Extent2D,
}

/// Pipeline creation parameters.
///
/// Sub-states are borrowed: the pipeline copies every referenced struct
/// into owned storage during creation, so the info (and everything it
/// points at) may live on the caller's stack. `depth_stencil_state: None`
/// declares depth/stencil fully dynamic; `viewport_state: None` declares
/// viewport and scissor dynamic.
#[derive(Debug, Clone, Copy)]
pub struct PipelineCreateInfo<'a> {
    /// The linked program.
    pub program: ProgramHandle,
    /// Vertex input layout.
    pub vertex_input_state: Option<&'a VertexInputState>,
    /// Primitive assembly.
    pub input_assembly_state: Option<&'a InputAssemblyState>,
    /// Rasterizer configuration.
    pub rasterization_state: Option<&'a RasterizationState>,
    /// Static viewport/scissor, or dynamic when absent.
    pub viewport_state: Option<&'a ViewportState>,
    /// Static depth/stencil, or dynamic when absent.
    pub depth_stencil_state: Option<&'a DepthStencilState>,
    /// Blend configuration.
    pub color_blend_state: Option<&'a ColorBlendState>,
    /// Multisample configuration.
    pub multisample_state: Option<&'a MultisampleState>,
    /// The render target this pipeline draws into.
    pub render_target: RenderTargetHandle,
}

/// Command buffer creation parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBufferCreateInfo {
    /// Recording level.
    pub level: CommandBufferLevel,
    /// Fixed command capacity; `Some(1)` marks a presentation buffer
    /// eligible for pooling.
    pub fixed_capacity: Option<u32>,
}

/// Primary buffers submit directly; secondary buffers only execute inside
/// a primary's execute-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandBufferLevel {
    /// Submittable buffer.
    #[default]
    Primary,
    /// Nested buffer.
    Secondary,
}

/// Sync object creation parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncObjectCreateInfo;

/// A batch of command buffers handed to the controller.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    /// Buffers in submission order.
    pub command_buffers: Vec<CommandBufferHandle>,
    /// Submission behavior flags.
    pub flags: SubmitFlags,
}

/// Reference-counted CPU pixel storage handed over as an upload source.
///
/// The storage can be released (dropped) independently of the `PixelData`
/// object itself once an upload consumed it; release happens at most once.
#[derive(Debug)]
pub struct PixelData {
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
    /// Source pixel format.
    pub format: Format,
    /// Row stride in bytes; 0 means tightly packed.
    pub stride: u32,
    storage: Mutex<Option<Vec<u8>>>,
}

impl PixelData {
    /// Wraps pixel bytes.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: Format, stride: u32) -> Arc<Self> {
        Arc::new(PixelData {
            width,
            height,
            format,
            stride,
            storage: Mutex::new(Some(data)),
        })
    }

    /// Runs `f` over the pixel bytes, if still held.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let guard = self.storage.lock().ok()?;
        guard.as_deref().map(f)
    }

    /// Releases the underlying storage. Returns whether this call was the
    /// one that released it.
    pub fn release_storage(&self) -> bool {
        match self.storage.lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(_) => false,
        }
    }

    /// Whether the storage has been released.
    pub fn is_released(&self) -> bool {
        self.storage.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

/// Source payload of one texture update.
pub enum UpdateSource {
    /// Caller-owned bytes; dropped (freed) after the upload consumes them.
    Memory(Vec<u8>),
    /// Shared pixel storage, optionally released after upload.
    PixelData {
        /// The shared storage.
        data: Arc<PixelData>,
        /// Release the storage once consumed.
        release_after_upload: bool,
    },
    /// A GPU buffer source.
    Buffer(BufferHandle),
}

impl std::fmt::Debug for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateSource::Memory(bytes) => f.debug_tuple("Memory").field(&bytes.len()).finish(),
            UpdateSource::PixelData { data, release_after_upload } => f
                .debug_struct("PixelData")
                .field("released", &data.is_released())
                .field("release_after_upload", release_after_upload)
                .finish(),
            UpdateSource::Buffer(handle) => f.debug_tuple("Buffer").field(handle).finish(),
        }
    }
}

/// One texture update: where the bytes land and how to read the source.
#[derive(Debug, Clone, Copy)]
pub struct TextureUpdateInfo {
    /// Destination texture.
    pub destination: TextureHandle,
    /// Destination top-left corner.
    pub dst_offset: Offset2D,
    /// Index into the accompanying source list.
    pub src_reference: usize,
    /// Byte offset into the source payload.
    pub src_offset: u32,
    /// Source region size in pixels.
    pub src_extent: Extent2D,
    /// Source pixel format.
    pub src_format: Format,
    /// Source row stride in bytes; 0 means tightly packed.
    pub src_stride: u32,
    /// Destination array layer.
    pub layer: u32,
    /// Destination mip level.
    pub level: u32,
}

/// Queryable facts about a texture's GPU-side storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureProperties {
    /// The requested format.
    pub format: Format,
    /// Whether uploads convert in software to a different stored format.
    pub emulated: bool,
    /// The format actually stored.
    pub storage_format: Format,
    /// Base level extent.
    pub extent: Extent2D,
    /// Whether texel rows are tightly packed.
    pub packed: bool,
}

/// Driver memory requirements for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRequirements {
    /// Required allocation size in bytes.
    pub size: u64,
    /// Required allocation alignment in bytes.
    pub alignment: u64,
}
