//! In-memory [`GpuDriver`] used by unit tests.
//!
//! Creation calls hand out slotmap ids backed by simulated storage, encoders
//! record their calls as [`RecordedOp`] values, and submission executes
//! buffer and level-zero image copies against that storage immediately.
//! Tests inspect the resulting bytes and the submission/fence timeline.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slotmap::SlotMap;

use crate::api::info::{MemoryRequirements, RenderPassCreateInfo, SamplerCreateInfo};
use crate::api::types::{
    BlendEquation, BlendOp, ClearValue, CompareOp, Extent2D, Format, IndexFormat, Rect2D,
    SamplerFilter, StencilOp, TextureLayout, TextureTiling, TextureUsageFlags, Viewport,
};
use crate::error::{BackendError, BackendResult};

use super::{
    BufferCopy, BufferDesc, BufferId, BufferImageCopy, CommandEncoder, ConversionId,
    DeviceIdentity, DriverLimits, EncodedCommands, ExternalImageDesc, FenceId, FramebufferDesc,
    FramebufferId, GpuDriver, ImageBlit, ImageDesc, ImageId, ImageViewDesc, ImageViewId, MemoryId,
    PipelineDesc, PipelineId, RenderPassId, SamplerId, ShaderId, SurfaceDesc, SurfaceId,
    YcbcrConversionDesc, YcbcrSupport,
};

const CACHE_PAYLOAD: &[u8] = b"recording-driver-pipeline-cache-v1";

/// One encoder call, as recorded. Copies and blits are flattened to one op
/// per region.
#[derive(Debug, Clone)]
pub enum RecordedOp {
    BeginRenderPass {
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        render_area: Rect2D,
        clear_values: usize,
    },
    EndRenderPass,
    BindPipeline(PipelineId),
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(BufferId, u64)>,
    },
    BindIndexBuffer {
        buffer: BufferId,
        offset: u64,
        format: IndexFormat,
    },
    BindUniformBuffers {
        bindings: usize,
    },
    BindTexture {
        binding: u32,
        view: ImageViewId,
        sampler: Option<SamplerId>,
    },
    BindSampler {
        binding: u32,
        sampler: SamplerId,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndexedIndirect {
        buffer: BufferId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    SetScissor(Rect2D),
    SetViewport(Viewport),
    SetStencilTestEnable(bool),
    SetStencilWriteMask(u32),
    SetStencilState {
        compare_op: CompareOp,
        reference: u32,
        compare_mask: u32,
        fail_op: StencilOp,
        pass_op: StencilOp,
        depth_fail_op: StencilOp,
    },
    SetDepthCompareOp(CompareOp),
    SetDepthTestEnable(bool),
    SetDepthWriteEnable(bool),
    SetColorMask(bool),
    SetColorBlendEnable(bool),
    SetColorBlendEquation(BlendEquation),
    SetColorBlendAdvanced {
        src_premultiplied: bool,
        dst_premultiplied: bool,
        blend_op: BlendOp,
    },
    Transition {
        image: ImageId,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
    },
    CopyBufferToImage {
        src: BufferId,
        dst: ImageId,
        layout: TextureLayout,
        copy: BufferImageCopy,
    },
    CopyBufferToBuffer {
        src: BufferId,
        dst: BufferId,
        copy: BufferCopy,
    },
    Blit {
        src: ImageId,
        dst: ImageId,
        src_mip: u32,
        dst_mip: u32,
        src_extent: Extent2D,
        dst_extent: Extent2D,
        filter: SamplerFilter,
    },
}

/// One entry of the driver's observable history.
#[derive(Debug, Clone)]
pub enum TimelineEvent {
    /// A queue submission; `fence` records whether one was attached.
    Submission { ops: Vec<RecordedOp>, fence: bool },
    /// A blocking fence wait.
    FenceWait,
    /// A fence reset.
    FenceReset,
}

struct ImageRecord {
    extent: Extent2D,
    format: Format,
    mip_levels: u32,
    tiling: TextureTiling,
    /// Level-zero contents; empty for externally backed images.
    bytes: Box<[u8]>,
    external: bool,
    planes_bound: usize,
}

struct BufferRecord {
    size: u64,
    bytes: Box<[u8]>,
    cpu_accessible: bool,
}

struct SurfaceRecord {
    desc: SurfaceDesc,
    framebuffer: Option<(RenderPassId, FramebufferId)>,
    current: u32,
}

#[derive(Default)]
struct State {
    images: SlotMap<ImageId, ImageRecord>,
    views: SlotMap<ImageViewId, ImageId>,
    buffers: SlotMap<BufferId, BufferRecord>,
    samplers: SlotMap<SamplerId, ()>,
    shaders: SlotMap<ShaderId, ()>,
    render_passes: SlotMap<RenderPassId, ()>,
    framebuffers: SlotMap<FramebufferId, RenderPassId>,
    pipelines: SlotMap<PipelineId, ()>,
    fences: SlotMap<FenceId, bool>,
    memories: SlotMap<MemoryId, RawFd>,
    conversions: SlotMap<ConversionId, YcbcrConversionDesc>,
    surfaces: SlotMap<SurfaceId, SurfaceRecord>,
    finished: HashMap<u64, Vec<RecordedOp>>,
    next_encoding: u64,
    timeline: Vec<TimelineEvent>,
    seeded_cache: Option<Vec<u8>>,
    destroyed_pipelines: usize,
    format_overrides: HashMap<Format, bool>,
    ycbcr_override: Option<YcbcrSupport>,
    failures: HashSet<&'static str>,
}

impl State {
    /// Consumes a one-shot injected failure for `op`.
    fn take_failure(&mut self, op: &'static str) -> BackendResult<()> {
        if self.failures.remove(op) {
            Err(BackendError::invalid(format!("injected failure: {op}")))
        } else {
            Ok(())
        }
    }
}

/// Test driver recording every call against simulated memory.
pub struct RecordingDriver {
    state: Arc<Mutex<State>>,
    identity: DeviceIdentity,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::with_device_id(0x0001)
    }

    /// A driver reporting a different device, for cache-identity tests.
    pub fn with_device_id(device_id: u32) -> Self {
        RecordingDriver {
            state: Arc::new(Mutex::new(State::default())),
            identity: DeviceIdentity {
                vendor_id: 0x1111,
                device_id,
                driver_version: 1,
                driver_abi: std::mem::size_of::<usize>() as u32,
                uuid: [0x42; 16],
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the next call to `op` as failing. One-shot.
    pub fn fail_next(&self, op: &'static str) {
        self.lock().failures.insert(op);
    }

    /// Overrides [`GpuDriver::is_format_supported`] for `format`.
    pub fn set_format_supported(&self, format: Format, supported: bool) {
        self.lock().format_overrides.insert(format, supported);
    }

    /// Overrides [`GpuDriver::ycbcr_support`] for all luma/chroma formats.
    pub fn set_ycbcr_support(&self, support: YcbcrSupport) {
        self.lock().ycbcr_override = Some(support);
    }

    /// Parameters of a live sampler conversion.
    pub fn conversion_desc(&self, conversion: ConversionId) -> Option<YcbcrConversionDesc> {
        self.lock().conversions.get(conversion).copied()
    }

    /// The payload [`GpuDriver::pipeline_cache_data`] serves.
    pub fn cache_payload(&self) -> Vec<u8> {
        CACHE_PAYLOAD.to_vec()
    }

    /// Bytes passed to [`GpuDriver::seed_pipeline_cache`], if it was called.
    pub fn seeded_cache(&self) -> Option<Vec<u8>> {
        self.lock().seeded_cache.clone()
    }

    /// Allocates a bare render pass without an attachment description.
    pub fn make_render_pass(&self) -> RenderPassId {
        self.lock().render_passes.insert(())
    }

    /// Allocates a full-mip-chain image with zeroed level-zero storage.
    pub fn make_image(&self, extent: Extent2D, format: Format) -> ImageId {
        let size = packed_size(extent, format);
        let mip_levels = 32 - extent.width.max(extent.height).max(1).leading_zeros();
        self.lock().images.insert(ImageRecord {
            extent,
            format,
            mip_levels,
            tiling: TextureTiling::Optimal,
            bytes: vec![0; size].into_boxed_slice(),
            external: false,
            planes_bound: 0,
        })
    }

    /// Number of memory planes bound to an external image.
    pub fn bound_planes(&self, image: ImageId) -> Option<usize> {
        self.lock().images.get(image).map(|i| i.planes_bound)
    }

    /// Current contents of a buffer's simulated memory.
    pub fn buffer_bytes(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.lock().buffers.get(buffer).map(|b| b.bytes.to_vec())
    }

    /// Current level-zero contents of an image's simulated memory.
    pub fn image_bytes(&self, image: ImageId) -> Option<Vec<u8>> {
        self.lock().images.get(image).map(|i| i.bytes.to_vec())
    }

    /// Every submission, wait and reset so far, in order.
    pub fn timeline(&self) -> Vec<TimelineEvent> {
        self.lock().timeline.clone()
    }

    /// Pipelines destroyed so far.
    pub fn destroyed_pipelines(&self) -> usize {
        self.lock().destroyed_pipelines
    }

    /// Count of all live driver objects, for leak and rollback checks.
    pub fn live_objects(&self) -> usize {
        let state = self.lock();
        state.images.len()
            + state.views.len()
            + state.buffers.len()
            + state.samplers.len()
            + state.shaders.len()
            + state.render_passes.len()
            + state.framebuffers.len()
            + state.pipelines.len()
            + state.fences.len()
            + state.memories.len()
            + state.conversions.len()
            + state.surfaces.len()
    }

    /// File descriptors currently held by imported memory objects.
    pub fn imported_fds(&self) -> Vec<RawFd> {
        self.lock().memories.values().copied().collect()
    }
}

impl Default for RecordingDriver {
    fn default() -> Self {
        RecordingDriver::new()
    }
}

impl GpuDriver for RecordingDriver {
    fn is_format_supported(
        &self,
        format: Format,
        _tiling: TextureTiling,
        _usage: TextureUsageFlags,
    ) -> bool {
        let state = self.lock();
        state
            .format_overrides
            .get(&format)
            .copied()
            .unwrap_or_else(|| format != Format::Undefined && !format.is_emulated())
    }

    fn device_identity(&self) -> DeviceIdentity {
        self.identity
    }

    fn limits(&self) -> DriverLimits {
        DriverLimits::default()
    }

    fn create_image(&self, desc: &ImageDesc) -> BackendResult<ImageId> {
        let mut state = self.lock();
        state.take_failure("create_image")?;
        let size = packed_size(desc.extent, desc.format);
        Ok(state.images.insert(ImageRecord {
            extent: desc.extent,
            format: desc.format,
            mip_levels: desc.mip_levels,
            tiling: desc.tiling,
            bytes: vec![0; size].into_boxed_slice(),
            external: false,
            planes_bound: 0,
        }))
    }

    fn image_memory_requirements(&self, image: ImageId) -> BackendResult<MemoryRequirements> {
        let state = self.lock();
        let record = state
            .images
            .get(image)
            .ok_or(BackendError::StaleHandle { kind: "image" })?;
        Ok(MemoryRequirements {
            size: record.bytes.len() as u64,
            alignment: 4,
        })
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> BackendResult<ImageViewId> {
        let mut state = self.lock();
        state.take_failure("create_image_view")?;
        if !state.images.contains_key(desc.image) {
            return Err(BackendError::StaleHandle { kind: "image" });
        }
        if let Some(conversion) = desc.conversion {
            if !state.conversions.contains_key(conversion) {
                return Err(BackendError::StaleHandle { kind: "conversion" });
            }
        }
        Ok(state.views.insert(desc.image))
    }

    fn destroy_image_view(&self, view: ImageViewId) {
        self.lock().views.remove(view);
    }

    fn destroy_image(&self, image: ImageId) {
        self.lock().images.remove(image);
    }

    fn create_external_image(&self, desc: &ExternalImageDesc) -> BackendResult<ImageId> {
        let mut state = self.lock();
        state.take_failure("create_external_image")?;
        Ok(state.images.insert(ImageRecord {
            extent: desc.extent,
            format: desc.format,
            mip_levels: 1,
            tiling: TextureTiling::Optimal,
            bytes: Box::default(),
            external: true,
            planes_bound: 0,
        }))
    }

    fn import_memory_fd(&self, fd: RawFd, _size: u64, image: ImageId) -> BackendResult<MemoryId> {
        let mut state = self.lock();
        state.take_failure("import_memory_fd")?;
        if !state.images.contains_key(image) {
            return Err(BackendError::StaleHandle { kind: "image" });
        }
        Ok(state.memories.insert(fd))
    }

    fn bind_image_planes(&self, image: ImageId, planes: &[(MemoryId, u64)]) -> BackendResult<()> {
        let mut state = self.lock();
        state.take_failure("bind_image_planes")?;
        if planes.iter().any(|&(m, _)| !state.memories.contains_key(m)) {
            return Err(BackendError::StaleHandle { kind: "memory" });
        }
        let record = state
            .images
            .get_mut(image)
            .ok_or(BackendError::StaleHandle { kind: "image" })?;
        if !record.external {
            return Err(BackendError::invalid("plane binding on a non-external image"));
        }
        record.planes_bound = planes.len();
        Ok(())
    }

    fn ycbcr_support(&self, format: Format) -> BackendResult<YcbcrSupport> {
        let mut state = self.lock();
        state.take_failure("ycbcr_support")?;
        if !format.is_ycbcr() {
            return Err(BackendError::invalid(format!(
                "ycbcr support queried for single-plane format {format:?}"
            )));
        }
        Ok(state.ycbcr_override.unwrap_or(YcbcrSupport {
            cosited_chroma: false,
            midpoint_chroma: true,
            linear_filter: true,
        }))
    }

    fn create_ycbcr_conversion(&self, desc: &YcbcrConversionDesc) -> BackendResult<ConversionId> {
        let mut state = self.lock();
        state.take_failure("create_ycbcr_conversion")?;
        Ok(state.conversions.insert(*desc))
    }

    fn destroy_ycbcr_conversion(&self, conversion: ConversionId) {
        self.lock().conversions.remove(conversion);
    }

    fn free_memory(&self, memory: MemoryId) {
        self.lock().memories.remove(memory);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> BackendResult<BufferId> {
        let mut state = self.lock();
        state.take_failure("create_buffer")?;
        Ok(state.buffers.insert(BufferRecord {
            size: desc.size,
            bytes: vec![0; desc.size as usize].into_boxed_slice(),
            cpu_accessible: desc.cpu_accessible,
        }))
    }

    fn buffer_memory_requirements(&self, buffer: BufferId) -> BackendResult<MemoryRequirements> {
        let state = self.lock();
        let record = state
            .buffers
            .get(buffer)
            .ok_or(BackendError::StaleHandle { kind: "buffer" })?;
        Ok(MemoryRequirements {
            size: record.size,
            alignment: 4,
        })
    }

    fn map_buffer(&self, buffer: BufferId) -> BackendResult<*mut u8> {
        let mut state = self.lock();
        let record = state
            .buffers
            .get_mut(buffer)
            .ok_or(BackendError::StaleHandle { kind: "buffer" })?;
        if !record.cpu_accessible {
            return Err(BackendError::invalid("mapping a device-local buffer"));
        }
        // The boxed payload never moves, so the pointer outlives the lock.
        Ok(record.bytes.as_mut_ptr())
    }

    fn unmap_buffer(&self, _buffer: BufferId) {}

    fn flush_mapped_buffer(&self, buffer: BufferId, offset: u64, size: u64) -> BackendResult<()> {
        let state = self.lock();
        let record = state
            .buffers
            .get(buffer)
            .ok_or(BackendError::StaleHandle { kind: "buffer" })?;
        if offset.saturating_add(size) > record.size {
            return Err(BackendError::invalid("flush range beyond buffer size"));
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        self.lock().buffers.remove(buffer);
    }

    fn map_image(&self, image: ImageId) -> BackendResult<*mut u8> {
        let mut state = self.lock();
        let record = state
            .images
            .get_mut(image)
            .ok_or(BackendError::StaleHandle { kind: "image" })?;
        if record.tiling != TextureTiling::Linear || record.bytes.is_empty() {
            return Err(BackendError::invalid("mapping a non-linear image"));
        }
        Ok(record.bytes.as_mut_ptr())
    }

    fn unmap_image(&self, _image: ImageId) {}

    fn image_row_pitch(&self, image: ImageId, mip_level: u32) -> BackendResult<u64> {
        let state = self.lock();
        let record = state
            .images
            .get(image)
            .ok_or(BackendError::StaleHandle { kind: "image" })?;
        if mip_level >= record.mip_levels {
            return Err(BackendError::invalid("row pitch queried past the mip chain"));
        }
        let width = (record.extent.width >> mip_level).max(1);
        Ok(u64::from(width) * u64::from(record.format.bytes_per_pixel()))
    }

    fn create_sampler(&self, _desc: &SamplerCreateInfo) -> BackendResult<SamplerId> {
        let mut state = self.lock();
        state.take_failure("create_sampler")?;
        Ok(state.samplers.insert(()))
    }

    fn create_sampler_with_conversion(
        &self,
        _desc: &SamplerCreateInfo,
        conversion: ConversionId,
    ) -> BackendResult<SamplerId> {
        let mut state = self.lock();
        state.take_failure("create_sampler_with_conversion")?;
        if !state.conversions.contains_key(conversion) {
            return Err(BackendError::StaleHandle { kind: "conversion" });
        }
        Ok(state.samplers.insert(()))
    }

    fn destroy_sampler(&self, sampler: SamplerId) {
        self.lock().samplers.remove(sampler);
    }

    fn create_shader_module(&self, spirv: &[u8]) -> BackendResult<ShaderId> {
        let mut state = self.lock();
        state.take_failure("create_shader_module")?;
        if spirv.len() % 4 != 0 {
            return Err(BackendError::invalid("SPIR-V byte length not word aligned"));
        }
        Ok(state.shaders.insert(()))
    }

    fn destroy_shader_module(&self, shader: ShaderId) {
        self.lock().shaders.remove(shader);
    }

    fn create_render_pass(&self, _desc: &RenderPassCreateInfo) -> BackendResult<RenderPassId> {
        let mut state = self.lock();
        state.take_failure("create_render_pass")?;
        Ok(state.render_passes.insert(()))
    }

    fn destroy_render_pass(&self, render_pass: RenderPassId) {
        self.lock().render_passes.remove(render_pass);
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> BackendResult<FramebufferId> {
        let mut state = self.lock();
        state.take_failure("create_framebuffer")?;
        if !state.render_passes.contains_key(desc.render_pass) {
            return Err(BackendError::StaleHandle { kind: "render pass" });
        }
        if desc.attachments.iter().any(|&v| !state.views.contains_key(v)) {
            return Err(BackendError::StaleHandle { kind: "image view" });
        }
        Ok(state.framebuffers.insert(desc.render_pass))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) {
        self.lock().framebuffers.remove(framebuffer);
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> BackendResult<PipelineId> {
        let mut state = self.lock();
        state.take_failure("create_pipeline")?;
        if !state.render_passes.contains_key(desc.render_pass) {
            return Err(BackendError::StaleHandle { kind: "render pass" });
        }
        Ok(state.pipelines.insert(()))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        let mut state = self.lock();
        if state.pipelines.remove(pipeline).is_some() {
            state.destroyed_pipelines += 1;
        }
    }

    fn pipeline_cache_data(&self) -> BackendResult<Vec<u8>> {
        Ok(CACHE_PAYLOAD.to_vec())
    }

    fn seed_pipeline_cache(&self, data: &[u8]) -> BackendResult<()> {
        self.lock().seeded_cache = Some(data.to_vec());
        Ok(())
    }

    fn register_surface(&self, desc: &SurfaceDesc) -> BackendResult<SurfaceId> {
        let mut state = self.lock();
        state.take_failure("register_surface")?;
        Ok(state.surfaces.insert(SurfaceRecord {
            desc: *desc,
            framebuffer: None,
            current: 0,
        }))
    }

    fn unregister_surface(&self, surface: SurfaceId) {
        let mut state = self.lock();
        if let Some(record) = state.surfaces.remove(surface) {
            if let Some((_, framebuffer)) = record.framebuffer {
                state.framebuffers.remove(framebuffer);
            }
        }
    }

    fn surface_framebuffer(
        &self,
        surface: SurfaceId,
        render_pass: RenderPassId,
    ) -> BackendResult<FramebufferId> {
        let mut state = self.lock();
        if !state.render_passes.contains_key(render_pass) {
            return Err(BackendError::StaleHandle { kind: "render pass" });
        }
        let existing = state
            .surfaces
            .get(surface)
            .ok_or(BackendError::StaleHandle { kind: "surface" })?
            .framebuffer;
        match existing {
            Some((pass, framebuffer)) if pass == render_pass => Ok(framebuffer),
            _ => {
                if let Some((_, stale)) = existing {
                    state.framebuffers.remove(stale);
                }
                let framebuffer = state.framebuffers.insert(render_pass);
                if let Some(record) = state.surfaces.get_mut(surface) {
                    record.framebuffer = Some((render_pass, framebuffer));
                }
                Ok(framebuffer)
            }
        }
    }

    fn advance_surface(&self, surface: SurfaceId) -> BackendResult<()> {
        let mut state = self.lock();
        let record = state
            .surfaces
            .get_mut(surface)
            .ok_or(BackendError::StaleHandle { kind: "surface" })?;
        record.current = (record.current + 1) % record.desc.buffer_count.max(1);
        Ok(())
    }

    fn create_encoder(&self) -> BackendResult<Box<dyn CommandEncoder>> {
        self.lock().take_failure("create_encoder")?;
        Ok(Box::new(RecordingEncoder {
            state: Arc::clone(&self.state),
            ops: Vec::new(),
            began: false,
            in_pass: false,
        }))
    }

    fn submit(&self, commands: Vec<EncodedCommands>, signal: Option<FenceId>) -> BackendResult<()> {
        let mut state = self.lock();
        let mut ops = Vec::new();
        for encoding in commands {
            let mut encoded = state
                .finished
                .remove(&encoding.0)
                .ok_or_else(|| BackendError::invalid("submitted an unknown encoding"))?;
            ops.append(&mut encoded);
        }
        state.timeline.push(TimelineEvent::Submission {
            ops: ops.clone(),
            fence: signal.is_some(),
        });
        for op in &ops {
            execute(&mut state, op)?;
        }
        if let Some(fence) = signal {
            let slot = state
                .fences
                .get_mut(fence)
                .ok_or(BackendError::StaleHandle { kind: "fence" })?;
            *slot = true;
        }
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceId> {
        let mut state = self.lock();
        state.take_failure("create_fence")?;
        Ok(state.fences.insert(signaled))
    }

    fn wait_for_fence(&self, fence: FenceId, _timeout_ns: u64) -> BackendResult<bool> {
        let mut state = self.lock();
        state.timeline.push(TimelineEvent::FenceWait);
        state
            .fences
            .get(fence)
            .copied()
            .ok_or(BackendError::StaleHandle { kind: "fence" })
    }

    fn reset_fence(&self, fence: FenceId) -> BackendResult<()> {
        let mut state = self.lock();
        state.timeline.push(TimelineEvent::FenceReset);
        let slot = state
            .fences
            .get_mut(fence)
            .ok_or(BackendError::StaleHandle { kind: "fence" })?;
        *slot = false;
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.lock().fences.remove(fence);
    }

    fn wait_idle(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Applies one op to the simulated memory. Draws, binds and transitions
/// have no memory effect; copies beyond level zero are dropped.
fn execute(state: &mut State, op: &RecordedOp) -> BackendResult<()> {
    match op {
        RecordedOp::CopyBufferToImage { src, dst, copy, .. } => {
            if copy.mip_level != 0 || copy.base_layer != 0 {
                return Ok(());
            }
            let src_bytes = state
                .buffers
                .get(*src)
                .ok_or(BackendError::StaleHandle { kind: "buffer" })?
                .bytes
                .clone();
            let record = state
                .images
                .get_mut(*dst)
                .ok_or(BackendError::StaleHandle { kind: "image" })?;
            copy_rows_into_image(&src_bytes, record, copy)
        }
        RecordedOp::CopyBufferToBuffer { src, dst, copy } => {
            let src_bytes = state
                .buffers
                .get(*src)
                .ok_or(BackendError::StaleHandle { kind: "buffer" })?
                .bytes
                .clone();
            let dst_record = state
                .buffers
                .get_mut(*dst)
                .ok_or(BackendError::StaleHandle { kind: "buffer" })?;
            let src_range = range_of(copy.src_offset, copy.size, src_bytes.len())?;
            let dst_range = range_of(copy.dst_offset, copy.size, dst_record.bytes.len())?;
            dst_record.bytes[dst_range].copy_from_slice(&src_bytes[src_range]);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn copy_rows_into_image(
    src: &[u8],
    image: &mut ImageRecord,
    copy: &BufferImageCopy,
) -> BackendResult<()> {
    let bpp = u64::from(image.format.bytes_per_pixel());
    if bpp == 0 {
        return Err(BackendError::invalid("copy into a formatless image"));
    }
    if copy.image_offset.x < 0 || copy.image_offset.y < 0 {
        return Err(BackendError::invalid("negative image offset in copy"));
    }
    let row_pixels = if copy.buffer_row_length == 0 {
        copy.image_extent.width
    } else {
        copy.buffer_row_length
    };
    let src_pitch = u64::from(row_pixels) * bpp;
    let dst_pitch = u64::from(image.extent.width) * bpp;
    let row_bytes = (u64::from(copy.image_extent.width) * bpp) as usize;

    for row in 0..u64::from(copy.image_extent.height) {
        let src_start = copy.buffer_offset + row * src_pitch;
        let dst_start = (u64::from(copy.image_offset.y as u32) + row) * dst_pitch
            + u64::from(copy.image_offset.x as u32) * bpp;
        let src_range = range_of(src_start, row_bytes as u64, src.len())?;
        let dst_range = range_of(dst_start, row_bytes as u64, image.bytes.len())?;
        image.bytes[dst_range].copy_from_slice(&src[src_range]);
    }
    Ok(())
}

fn range_of(offset: u64, len: u64, capacity: usize) -> BackendResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= capacity as u64)
        .ok_or_else(|| BackendError::invalid("copy range beyond allocation"))?;
    Ok(offset as usize..end as usize)
}

fn packed_size(extent: Extent2D, format: Format) -> usize {
    extent.width as usize * extent.height as usize * format.bytes_per_pixel() as usize
}

struct RecordingEncoder {
    state: Arc<Mutex<State>>,
    ops: Vec<RecordedOp>,
    began: bool,
    in_pass: bool,
}

impl RecordingEncoder {
    fn record_in_pass(&mut self, op: RecordedOp) -> BackendResult<()> {
        if !self.in_pass {
            return Err(BackendError::invalid("draw or state call outside a render pass"));
        }
        self.ops.push(op);
        Ok(())
    }

    fn record_outside_pass(&mut self, op: RecordedOp) -> BackendResult<()> {
        if !self.began {
            return Err(BackendError::invalid("recording before begin"));
        }
        if self.in_pass {
            return Err(BackendError::invalid("copy or barrier inside a render pass"));
        }
        self.ops.push(op);
        Ok(())
    }
}

impl CommandEncoder for RecordingEncoder {
    fn begin(&mut self) -> BackendResult<()> {
        if self.began {
            return Err(BackendError::invalid("encoder begun twice"));
        }
        self.began = true;
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        render_area: Rect2D,
        clear_values: &[ClearValue],
    ) -> BackendResult<()> {
        if !self.began {
            return Err(BackendError::invalid("recording before begin"));
        }
        if self.in_pass {
            return Err(BackendError::invalid("render pass begun twice"));
        }
        self.in_pass = true;
        self.ops.push(RecordedOp::BeginRenderPass {
            render_pass,
            framebuffer,
            render_area,
            clear_values: clear_values.len(),
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        if !self.in_pass {
            return Err(BackendError::invalid("no render pass to end"));
        }
        self.in_pass = false;
        self.ops.push(RecordedOp::EndRenderPass);
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: PipelineId) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::BindPipeline(pipeline))
    }

    fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[(BufferId, u64)],
    ) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::BindVertexBuffers {
            first_binding,
            buffers: buffers.to_vec(),
        })
    }

    fn bind_index_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        format: IndexFormat,
    ) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::BindIndexBuffer { buffer, offset, format })
    }

    fn bind_uniform_buffers(
        &mut self,
        bindings: &[super::UniformBufferBinding],
    ) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::BindUniformBuffers { bindings: bindings.len() })
    }

    fn bind_texture(
        &mut self,
        binding: u32,
        view: ImageViewId,
        sampler: Option<SamplerId>,
    ) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::BindTexture { binding, view, sampler })
    }

    fn bind_sampler(&mut self, binding: u32, sampler: SamplerId) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::BindSampler { binding, sampler })
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    fn draw_indexed_indirect(
        &mut self,
        buffer: BufferId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::DrawIndexedIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        })
    }

    fn set_scissor(&mut self, region: Rect2D) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetScissor(region))
    }

    fn set_viewport(&mut self, region: Viewport) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetViewport(region))
    }

    fn set_stencil_test_enable(&mut self, enable: bool) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetStencilTestEnable(enable))
    }

    fn set_stencil_write_mask(&mut self, mask: u32) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetStencilWriteMask(mask))
    }

    fn set_stencil_state(
        &mut self,
        compare_op: CompareOp,
        reference: u32,
        compare_mask: u32,
        fail_op: StencilOp,
        pass_op: StencilOp,
        depth_fail_op: StencilOp,
    ) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetStencilState {
            compare_op,
            reference,
            compare_mask,
            fail_op,
            pass_op,
            depth_fail_op,
        })
    }

    fn set_depth_compare_op(&mut self, op: CompareOp) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetDepthCompareOp(op))
    }

    fn set_depth_test_enable(&mut self, enable: bool) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetDepthTestEnable(enable))
    }

    fn set_depth_write_enable(&mut self, enable: bool) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetDepthWriteEnable(enable))
    }

    fn set_color_mask(&mut self, enable: bool) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetColorMask(enable))
    }

    fn set_color_blend_enable(&mut self, enable: bool) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetColorBlendEnable(enable))
    }

    fn set_color_blend_equation(&mut self, equation: BlendEquation) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetColorBlendEquation(equation))
    }

    fn set_color_blend_advanced(
        &mut self,
        src_premultiplied: bool,
        dst_premultiplied: bool,
        blend_op: BlendOp,
    ) -> BackendResult<()> {
        self.record_in_pass(RecordedOp::SetColorBlendAdvanced {
            src_premultiplied,
            dst_premultiplied,
            blend_op,
        })
    }

    fn transition_image(
        &mut self,
        image: ImageId,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
    ) -> BackendResult<()> {
        self.record_outside_pass(RecordedOp::Transition {
            image,
            old_layout,
            new_layout,
            base_mip,
            mip_count,
            base_layer,
            layer_count,
        })
    }

    fn copy_buffer_to_image(
        &mut self,
        src: BufferId,
        dst: ImageId,
        layout: TextureLayout,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()> {
        for &copy in regions {
            self.record_outside_pass(RecordedOp::CopyBufferToImage { src, dst, layout, copy })?;
        }
        Ok(())
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        dst: BufferId,
        regions: &[BufferCopy],
    ) -> BackendResult<()> {
        for &copy in regions {
            self.record_outside_pass(RecordedOp::CopyBufferToBuffer { src, dst, copy })?;
        }
        Ok(())
    }

    fn blit_image(
        &mut self,
        src: ImageId,
        dst: ImageId,
        regions: &[ImageBlit],
        filter: SamplerFilter,
    ) -> BackendResult<()> {
        for blit in regions {
            self.record_outside_pass(RecordedOp::Blit {
                src,
                dst,
                src_mip: blit.src_mip,
                dst_mip: blit.dst_mip,
                src_extent: blit.src_region.extent,
                dst_extent: blit.dst_region.extent,
                filter,
            })?;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> BackendResult<EncodedCommands> {
        if !self.began {
            return Err(BackendError::invalid("finishing an encoder that never began"));
        }
        if self.in_pass {
            return Err(BackendError::invalid("finishing inside a render pass"));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let token = state.next_encoding;
        state.next_encoding += 1;
        state.finished.insert(token, self.ops);
        Ok(EncodedCommands(token))
    }
}
