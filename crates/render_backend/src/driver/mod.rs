//! Driver abstraction: the seam between backend logic and the graphics API.
//!
//! The controller, pipeline cache, transfer engine and native image importer
//! talk to a [`GpuDriver`] trait object instead of the API directly. The
//! production implementation lives in [`vulkan`]; tests run against an
//! in-memory recording implementation.

pub mod vulkan;

#[cfg(test)]
pub mod recording;

pub use vulkan::VulkanDriver;

use std::os::unix::io::RawFd;

use crate::api::info::{MemoryRequirements, PipelineStage, RenderPassCreateInfo, SamplerCreateInfo};
use crate::api::state::{
    ColorBlendState, DepthStencilState, InputAssemblyState, MultisampleState, RasterizationState,
    VertexInputState, ViewportState,
};
use crate::api::types::{
    BlendEquation, BlendOp, BufferUsageFlags, ChromaLocation, ClearValue, CompareOp, Extent2D,
    Format, IndexFormat, Offset2D, Rect2D, SamplerFilter, StencilOp, TextureLayout, TextureTiling,
    TextureType, TextureUsageFlags, Viewport, YcbcrModel, YcbcrRange,
};
use crate::error::BackendResult;

slotmap::new_key_type! {
    /// Driver-side image identifier.
    pub struct ImageId;
    /// Driver-side image view identifier.
    pub struct ImageViewId;
    /// Driver-side buffer identifier.
    pub struct BufferId;
    /// Driver-side sampler identifier.
    pub struct SamplerId;
    /// Driver-side shader module identifier.
    pub struct ShaderId;
    /// Driver-side render pass identifier.
    pub struct RenderPassId;
    /// Driver-side framebuffer identifier.
    pub struct FramebufferId;
    /// Driver-side pipeline object identifier.
    pub struct PipelineId;
    /// Driver-side fence identifier.
    pub struct FenceId;
    /// Driver-side device memory identifier (imported allocations).
    pub struct MemoryId;
    /// Driver-side sampler conversion identifier.
    pub struct ConversionId;
    /// Driver-side presentation surface identifier.
    pub struct SurfaceId;
}

/// Opaque token for a finished encoding, issued by [`CommandEncoder::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodedCommands(pub(crate) u64);

/// Identity of the device a pipeline cache blob was produced on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    /// PCI vendor id.
    pub vendor_id: u32,
    /// PCI device id.
    pub device_id: u32,
    /// Driver version.
    pub driver_version: u32,
    /// Driver ABI (pointer width in bytes).
    pub driver_abi: u32,
    /// Pipeline cache UUID.
    pub uuid: [u8; 16],
}

/// Alignment and sizing limits the backend must respect.
#[derive(Debug, Clone, Copy)]
pub struct DriverLimits {
    /// Minimum alignment of buffer offsets in buffer-image copies.
    pub buffer_copy_offset_alignment: u64,
    /// Minimum alignment of row pitches in buffer-image copies.
    pub buffer_copy_row_pitch_alignment: u64,
    /// Flush granularity of non-coherent mapped memory.
    pub non_coherent_atom_size: u64,
    /// Upper bound for sampler anisotropy.
    pub max_sampler_anisotropy: f32,
}

impl Default for DriverLimits {
    fn default() -> Self {
        DriverLimits {
            buffer_copy_offset_alignment: 4,
            buffer_copy_row_pitch_alignment: 4,
            non_coherent_atom_size: 64,
            max_sampler_anisotropy: 1.0,
        }
    }
}

/// Image creation parameters at the driver level. The format here is the
/// storage format: emulation decisions have already been made.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Dimensionality.
    pub image_type: TextureType,
    /// Base level extent.
    pub extent: Extent2D,
    /// Stored pixel format.
    pub format: Format,
    /// Mip level count.
    pub mip_levels: u32,
    /// Array layer count.
    pub array_layers: u32,
    /// Memory layout.
    pub tiling: TextureTiling,
    /// Allowed usages.
    pub usage: TextureUsageFlags,
    /// Host-visible backing for linear-tiled images.
    pub cpu_accessible: bool,
}

/// Image view creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    /// Viewed image.
    pub image: ImageId,
    /// View format.
    pub format: Format,
    /// First visible mip level.
    pub base_mip: u32,
    /// Number of visible mip levels.
    pub mip_count: u32,
    /// First visible array layer.
    pub base_layer: u32,
    /// Number of visible array layers.
    pub layer_count: u32,
    /// Sampler conversion attached to the view, for external formats.
    pub conversion: Option<ConversionId>,
}

/// Buffer creation parameters at the driver level.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    /// Size in bytes.
    pub size: u64,
    /// Allowed usages.
    pub usage: BufferUsageFlags,
    /// Host-visible, persistently mapped backing.
    pub cpu_accessible: bool,
}

/// Creation parameters for an image backed by externally owned memory.
#[derive(Debug, Clone, Copy)]
pub struct ExternalImageDesc {
    /// Image extent.
    pub extent: Extent2D,
    /// Stored pixel format.
    pub format: Format,
    /// Allowed usages.
    pub usage: TextureUsageFlags,
    /// DRM format modifier describing the external layout.
    pub modifier: u64,
    /// Number of memory planes.
    pub plane_count: u32,
    /// Planes bind to separate allocations.
    pub disjoint: bool,
}

/// Sampler conversion parameters for luma/chroma formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YcbcrConversionDesc {
    /// External image format.
    pub format: Format,
    /// Color model used for conversion.
    pub model: YcbcrModel,
    /// Encoded channel range.
    pub range: YcbcrRange,
    /// Horizontal chroma sample placement.
    pub x_chroma_offset: ChromaLocation,
    /// Vertical chroma sample placement.
    pub y_chroma_offset: ChromaLocation,
    /// Filter used when reconstructing chroma.
    pub chroma_filter: SamplerFilter,
}

/// Device capabilities for sampling a luma/chroma format.
#[derive(Debug, Clone, Copy, Default)]
pub struct YcbcrSupport {
    /// Chroma samples may be placed cosited with even luma samples.
    pub cosited_chroma: bool,
    /// Chroma samples may be placed midway between luma samples.
    pub midpoint_chroma: bool,
    /// Linear filtering may cross the conversion.
    pub linear_filter: bool,
}

/// Framebuffer creation parameters at the driver level.
#[derive(Debug, Clone)]
pub struct FramebufferDesc {
    /// Compatible render pass.
    pub render_pass: RenderPassId,
    /// Attachment views in binding order.
    pub attachments: Vec<ImageViewId>,
    /// Framebuffer extent.
    pub extent: Extent2D,
}

/// One shader stage of a pipeline.
#[derive(Debug, Clone)]
pub struct StageDesc {
    /// Stage occupied.
    pub stage: PipelineStage,
    /// Compiled module.
    pub module: ShaderId,
    /// Entry point name.
    pub entry_point: String,
}

/// Fully resolved pipeline state handed to the driver for compilation.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    /// Shader stages.
    pub stages: Vec<StageDesc>,
    /// Vertex input layout.
    pub vertex_input: VertexInputState,
    /// Primitive assembly.
    pub input_assembly: InputAssemblyState,
    /// Rasterizer configuration.
    pub rasterization: RasterizationState,
    /// Static viewport, or dynamic when absent.
    pub viewport: Option<ViewportState>,
    /// Depth/stencil configuration.
    pub depth_stencil: DepthStencilState,
    /// Blend configuration.
    pub color_blend: ColorBlendState,
    /// Multisample configuration.
    pub multisample: MultisampleState,
    /// Render pass the pipeline executes in.
    pub render_pass: RenderPassId,
}

/// Presentation surface registration parameters.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceDesc {
    /// Surface extent.
    pub extent: Extent2D,
    /// Color format of the surface images.
    pub format: Format,
    /// Number of buffered images.
    pub buffer_count: u32,
}

/// One buffer-to-image copy region.
#[derive(Debug, Clone, Copy)]
pub struct BufferImageCopy {
    /// Byte offset into the source buffer.
    pub buffer_offset: u64,
    /// Source row length in pixels; 0 means tightly packed.
    pub buffer_row_length: u32,
    /// Destination top-left corner.
    pub image_offset: Offset2D,
    /// Destination region extent.
    pub image_extent: Extent2D,
    /// Destination mip level.
    pub mip_level: u32,
    /// First destination array layer.
    pub base_layer: u32,
    /// Number of destination layers.
    pub layer_count: u32,
}

/// One buffer-to-buffer copy region.
#[derive(Debug, Clone, Copy)]
pub struct BufferCopy {
    /// Byte offset into the source buffer.
    pub src_offset: u64,
    /// Byte offset into the destination buffer.
    pub dst_offset: u64,
    /// Bytes to copy.
    pub size: u64,
}

/// One image blit: scales `src_region` of `src_mip` into `dst_region` of
/// `dst_mip`.
#[derive(Debug, Clone, Copy)]
pub struct ImageBlit {
    /// Source region corners.
    pub src_region: Rect2D,
    /// Source mip level.
    pub src_mip: u32,
    /// Destination region corners.
    pub dst_region: Rect2D,
    /// Destination mip level.
    pub dst_mip: u32,
    /// Array layer blitted.
    pub layer: u32,
}

/// Uniform buffer slice bound at a descriptor binding.
#[derive(Debug, Clone, Copy)]
pub struct UniformBufferBinding {
    /// Descriptor binding index.
    pub binding: u32,
    /// Bound buffer.
    pub buffer: BufferId,
    /// Byte offset of the slice.
    pub offset: u64,
    /// Byte length of the slice.
    pub range: u64,
}

/// Records native commands for one submission.
///
/// Encoders are created by [`GpuDriver::create_encoder`], driven by the
/// replay executor and the transfer engine, then consumed by
/// [`CommandEncoder::finish`]. Render pass scope rules follow the native
/// API: draws and state changes are only valid between
/// [`CommandEncoder::begin_render_pass`] and
/// [`CommandEncoder::end_render_pass`]; copies and barriers only outside.
pub trait CommandEncoder {
    /// Starts recording.
    fn begin(&mut self) -> BackendResult<()>;

    /// Opens a render pass over `framebuffer`.
    fn begin_render_pass(
        &mut self,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        render_area: Rect2D,
        clear_values: &[ClearValue],
    ) -> BackendResult<()>;

    /// Closes the open render pass.
    fn end_render_pass(&mut self) -> BackendResult<()>;

    /// Selects the pipeline for subsequent draws.
    fn bind_pipeline(&mut self, pipeline: PipelineId) -> BackendResult<()>;

    /// Binds vertex buffers starting at `first_binding`.
    fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[(BufferId, u64)],
    ) -> BackendResult<()>;

    /// Binds the index buffer.
    fn bind_index_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        format: IndexFormat,
    ) -> BackendResult<()>;

    /// Binds uniform buffer slices.
    fn bind_uniform_buffers(&mut self, bindings: &[UniformBufferBinding]) -> BackendResult<()>;

    /// Binds a sampled image, with an optional paired sampler.
    fn bind_texture(
        &mut self,
        binding: u32,
        view: ImageViewId,
        sampler: Option<SamplerId>,
    ) -> BackendResult<()>;

    /// Binds a standalone sampler.
    fn bind_sampler(&mut self, binding: u32, sampler: SamplerId) -> BackendResult<()>;

    /// Non-indexed draw.
    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> BackendResult<()>;

    /// Indexed draw.
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> BackendResult<()>;

    /// Indirect indexed draw sourced from `buffer`.
    fn draw_indexed_indirect(
        &mut self,
        buffer: BufferId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> BackendResult<()>;

    /// Sets the scissor rectangle.
    fn set_scissor(&mut self, region: Rect2D) -> BackendResult<()>;

    /// Sets the viewport.
    fn set_viewport(&mut self, region: Viewport) -> BackendResult<()>;

    /// Toggles stencil testing.
    fn set_stencil_test_enable(&mut self, enable: bool) -> BackendResult<()>;

    /// Sets the stencil write mask for both faces.
    fn set_stencil_write_mask(&mut self, mask: u32) -> BackendResult<()>;

    /// Sets stencil compare and op state for both faces.
    #[allow(clippy::too_many_arguments)]
    fn set_stencil_state(
        &mut self,
        compare_op: CompareOp,
        reference: u32,
        compare_mask: u32,
        fail_op: StencilOp,
        pass_op: StencilOp,
        depth_fail_op: StencilOp,
    ) -> BackendResult<()>;

    /// Sets the depth comparison function.
    fn set_depth_compare_op(&mut self, op: CompareOp) -> BackendResult<()>;

    /// Toggles depth testing.
    fn set_depth_test_enable(&mut self, enable: bool) -> BackendResult<()>;

    /// Toggles depth writes.
    fn set_depth_write_enable(&mut self, enable: bool) -> BackendResult<()>;

    /// Toggles all color channel writes on attachment zero.
    fn set_color_mask(&mut self, enable: bool) -> BackendResult<()>;

    /// Toggles blending on attachment zero.
    fn set_color_blend_enable(&mut self, enable: bool) -> BackendResult<()>;

    /// Sets the dynamic blend equation on attachment zero.
    fn set_color_blend_equation(&mut self, equation: BlendEquation) -> BackendResult<()>;

    /// Sets an advanced blend operation on attachment zero.
    fn set_color_blend_advanced(
        &mut self,
        src_premultiplied: bool,
        dst_premultiplied: bool,
        blend_op: BlendOp,
    ) -> BackendResult<()>;

    /// Transitions an image subresource range between layouts. The driver
    /// derives access masks and pipeline stages from the pair of layouts.
    /// `u32::MAX` for `mip_count` or `layer_count` selects every remaining
    /// level or layer.
    #[allow(clippy::too_many_arguments)]
    fn transition_image(
        &mut self,
        image: ImageId,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
    ) -> BackendResult<()>;

    /// Copies buffer regions into an image expected in `layout`.
    fn copy_buffer_to_image(
        &mut self,
        src: BufferId,
        dst: ImageId,
        layout: TextureLayout,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()>;

    /// Copies buffer regions between buffers.
    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        dst: BufferId,
        regions: &[BufferCopy],
    ) -> BackendResult<()>;

    /// Blits between mip levels of images, filtering as requested.
    fn blit_image(
        &mut self,
        src: ImageId,
        dst: ImageId,
        regions: &[ImageBlit],
        filter: SamplerFilter,
    ) -> BackendResult<()>;

    /// Ends recording and hands the encoding back for submission.
    fn finish(self: Box<Self>) -> BackendResult<EncodedCommands>;
}

/// The backend's view of a graphics device.
///
/// Implementations own every native object behind the returned ids and are
/// internally synchronized; all methods take `&self`.
pub trait GpuDriver: Send + Sync {
    /// Whether `format` is usable with the given tiling and usage.
    fn is_format_supported(
        &self,
        format: Format,
        tiling: TextureTiling,
        usage: TextureUsageFlags,
    ) -> bool;

    /// Identity of the underlying device.
    fn device_identity(&self) -> DeviceIdentity;

    /// Device limits.
    fn limits(&self) -> DriverLimits;

    /// Creates an image.
    fn create_image(&self, desc: &ImageDesc) -> BackendResult<ImageId>;

    /// Memory footprint of an image.
    fn image_memory_requirements(&self, image: ImageId) -> BackendResult<MemoryRequirements>;

    /// Creates a view over an image.
    fn create_image_view(&self, desc: &ImageViewDesc) -> BackendResult<ImageViewId>;

    /// Destroys an image view.
    fn destroy_image_view(&self, view: ImageViewId);

    /// Destroys an image and its backing allocation.
    fn destroy_image(&self, image: ImageId);

    /// Creates an image that will be bound to imported memory.
    fn create_external_image(&self, desc: &ExternalImageDesc) -> BackendResult<ImageId>;

    /// Imports a dma-buf file descriptor as device memory dedicated to
    /// `image`. Ownership of `fd` passes to the driver on success.
    fn import_memory_fd(&self, fd: RawFd, size: u64, image: ImageId) -> BackendResult<MemoryId>;

    /// Binds imported allocations to an external image's planes, in plane
    /// order. Each entry pairs the allocation with the plane's byte offset
    /// within it.
    fn bind_image_planes(&self, image: ImageId, planes: &[(MemoryId, u64)]) -> BackendResult<()>;

    /// Reports how the device can sample a luma/chroma format. Errors when
    /// `format` carries no chroma planes.
    fn ycbcr_support(&self, format: Format) -> BackendResult<YcbcrSupport>;

    /// Creates a sampler conversion for luma/chroma sampling.
    fn create_ycbcr_conversion(&self, desc: &YcbcrConversionDesc) -> BackendResult<ConversionId>;

    /// Destroys a sampler conversion.
    fn destroy_ycbcr_conversion(&self, conversion: ConversionId);

    /// Frees an imported allocation.
    fn free_memory(&self, memory: MemoryId);

    /// Creates a buffer.
    fn create_buffer(&self, desc: &BufferDesc) -> BackendResult<BufferId>;

    /// Memory footprint of a buffer.
    fn buffer_memory_requirements(&self, buffer: BufferId) -> BackendResult<MemoryRequirements>;

    /// Returns the persistent mapping of a host-visible buffer. The pointer
    /// stays valid until the buffer is destroyed.
    fn map_buffer(&self, buffer: BufferId) -> BackendResult<*mut u8>;

    /// Releases a mapping obtained from [`GpuDriver::map_buffer`].
    fn unmap_buffer(&self, buffer: BufferId);

    /// Flushes a mapped range to the device.
    fn flush_mapped_buffer(&self, buffer: BufferId, offset: u64, size: u64) -> BackendResult<()>;

    /// Destroys a buffer and its backing allocation.
    fn destroy_buffer(&self, buffer: BufferId);

    /// Returns the mapping of a host-visible linear image.
    fn map_image(&self, image: ImageId) -> BackendResult<*mut u8>;

    /// Releases a mapping obtained from [`GpuDriver::map_image`].
    fn unmap_image(&self, image: ImageId);

    /// Row pitch in bytes of a linear image's mip level.
    fn image_row_pitch(&self, image: ImageId, mip_level: u32) -> BackendResult<u64>;

    /// Creates a sampler.
    fn create_sampler(&self, desc: &SamplerCreateInfo) -> BackendResult<SamplerId>;

    /// Creates a sampler whose reads pass through a luma/chroma conversion.
    fn create_sampler_with_conversion(
        &self,
        desc: &SamplerCreateInfo,
        conversion: ConversionId,
    ) -> BackendResult<SamplerId>;

    /// Destroys a sampler.
    fn destroy_sampler(&self, sampler: SamplerId);

    /// Creates a shader module from SPIR-V bytes.
    fn create_shader_module(&self, spirv: &[u8]) -> BackendResult<ShaderId>;

    /// Destroys a shader module.
    fn destroy_shader_module(&self, shader: ShaderId);

    /// Creates a render pass.
    fn create_render_pass(&self, desc: &RenderPassCreateInfo) -> BackendResult<RenderPassId>;

    /// Destroys a render pass.
    fn destroy_render_pass(&self, render_pass: RenderPassId);

    /// Creates a framebuffer.
    fn create_framebuffer(&self, desc: &FramebufferDesc) -> BackendResult<FramebufferId>;

    /// Destroys a framebuffer.
    fn destroy_framebuffer(&self, framebuffer: FramebufferId);

    /// Compiles a pipeline object.
    fn create_pipeline(&self, desc: &PipelineDesc) -> BackendResult<PipelineId>;

    /// Destroys a pipeline object.
    fn destroy_pipeline(&self, pipeline: PipelineId);

    /// Serializes the device pipeline cache.
    fn pipeline_cache_data(&self) -> BackendResult<Vec<u8>>;

    /// Seeds the device pipeline cache with a previously serialized blob.
    fn seed_pipeline_cache(&self, data: &[u8]) -> BackendResult<()>;

    /// Registers a presentation surface and allocates its buffered images.
    fn register_surface(&self, desc: &SurfaceDesc) -> BackendResult<SurfaceId>;

    /// Unregisters a surface and destroys its images.
    fn unregister_surface(&self, surface: SurfaceId);

    /// Returns the framebuffer of the surface's current buffered image,
    /// creating one compatible with `render_pass` on first use.
    fn surface_framebuffer(
        &self,
        surface: SurfaceId,
        render_pass: RenderPassId,
    ) -> BackendResult<FramebufferId>;

    /// Advances the surface to its next buffered image.
    fn advance_surface(&self, surface: SurfaceId) -> BackendResult<()>;

    /// Creates a command encoder.
    fn create_encoder(&self) -> BackendResult<Box<dyn CommandEncoder>>;

    /// Submits finished encodings in order, optionally signaling `signal`
    /// on completion. Ownership of the encodings passes to the driver.
    fn submit(&self, commands: Vec<EncodedCommands>, signal: Option<FenceId>) -> BackendResult<()>;

    /// Creates a fence.
    fn create_fence(&self, signaled: bool) -> BackendResult<FenceId>;

    /// Blocks until the fence signals or `timeout_ns` elapses. Returns
    /// whether the fence signaled.
    fn wait_for_fence(&self, fence: FenceId, timeout_ns: u64) -> BackendResult<bool>;

    /// Returns a signaled fence to the unsignaled state.
    fn reset_fence(&self, fence: FenceId) -> BackendResult<()>;

    /// Destroys a fence.
    fn destroy_fence(&self, fence: FenceId);

    /// Blocks until the device is idle.
    fn wait_idle(&self) -> BackendResult<()>;
}
