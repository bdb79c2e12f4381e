//! The graphics controller: resource ownership and frame sequencing.
//!
//! The rendering core records [`CommandBuffer`](crate::command::CommandBuffer)
//! logs against plain handles; the controller owns the resources behind
//! those handles and turns the logs into driver work at flush points. A
//! frame runs as: frame start, resource creates, submissions, create-queue
//! drain, replay, discard-queue drain, present. Everything except the
//! transfer worker pool happens on the calling thread.

mod present;
mod replay;

use std::sync::Arc;

use slotmap::{SecondaryMap, SlotMap};

use crate::api::handles::{
    BufferHandle, CommandBufferHandle, FramebufferHandle, PipelineHandle, ProgramHandle,
    RenderPassHandle, RenderTargetHandle, SamplerHandle, ShaderHandle, SyncObjectHandle,
    TextureHandle,
};
use crate::api::info::{
    AttachmentDescription, BufferCreateInfo, CommandBufferCreateInfo, FramebufferCreateInfo,
    MemoryRequirements, PipelineCreateInfo, ProgramCreateInfo, RenderPassCreateInfo,
    RenderTargetCreateInfo, SamplerCreateInfo, ShaderCreateInfo, SubmitInfo, SyncObjectCreateInfo,
    TextureCreateInfo, TextureProperties, TextureUpdateInfo, UpdateSource,
};
use crate::api::types::{
    AttachmentLoadOp, AttachmentStoreOp, CommandBufferUsageFlags, SubmitFlags, TextureLayout,
};
use crate::command::CommandBuffer;
use crate::config::BackendSettings;
use crate::driver::{BufferId, GpuDriver, ImageId, RenderPassId};
use crate::error::{BackendError, BackendResult};
use crate::native_image::{format_and_usage, initialize_native_texture};
use crate::pipeline::{PipelineCacheManager, PipelineResource};
use crate::resources::texture::resolve_storage_format;
use crate::resources::{
    BufferResource, CreateEntry, DiscardEntry, FramebufferResource, ProgramReflection,
    ProgramResource, RenderPassResource, RenderTargetResource, SamplerResource, ShaderResource,
    SyncObjectResource, TextureResource,
};
use crate::transfer::{MipmapRequest, TransferEngine, TransferRequest};

use present::PresentBufferPool;
use replay::{ReplayEnv, Replayer};

/// Queued texture-update source bytes that force an implicit flush.
const UPDATE_FLUSH_THRESHOLD: usize = 1024 * 1024;

/// Per-frame diagnostic counters, reset by [`GraphicsController::frame_start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Command buffers submitted this frame.
    pub submitted_buffers: u32,
    /// Commands replayed into native encoders this frame.
    pub replayed_commands: u32,
    /// Source bytes queued through texture updates this frame.
    pub update_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
enum MappedTarget {
    Buffer(BufferId),
    Image(ImageId),
}

/// A host-visible mapping; dropping the guard unmaps.
pub struct MappedMemory<'a> {
    driver: &'a dyn GpuDriver,
    target: MappedTarget,
    ptr: *mut u8,
    size: usize,
}

impl MappedMemory<'_> {
    /// Start of the mapped range.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Bytes covered by the mapping.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the mapping covers zero bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Copies `bytes` into the mapping at `offset`. The range must lie
    /// inside the mapping.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset.checked_add(bytes.len()).is_some_and(|end| end <= self.size),
            "write outside the mapped range"
        );
        // Safety: the guard holds the only mapping of this range and the
        // bounds were checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }

    /// Releases the mapping now; dropping the guard does the same.
    pub fn unmap(self) {}
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        match self.target {
            MappedTarget::Buffer(buffer) => self.driver.unmap_buffer(buffer),
            MappedTarget::Image(image) => self.driver.unmap_image(image),
        }
    }
}

/// Owner of every backend resource and executor of recorded command logs.
pub struct GraphicsController {
    driver: Arc<dyn GpuDriver>,
    settings: BackendSettings,
    transfer: TransferEngine,
    pipeline_cache: PipelineCacheManager,

    textures: SlotMap<TextureHandle, TextureResource>,
    buffers: SlotMap<BufferHandle, BufferResource>,
    samplers: SlotMap<SamplerHandle, SamplerResource>,
    shaders: SlotMap<ShaderHandle, ShaderResource>,
    programs: SlotMap<ProgramHandle, ProgramResource>,
    render_passes: SlotMap<RenderPassHandle, RenderPassResource>,
    render_targets: SlotMap<RenderTargetHandle, RenderTargetResource>,
    framebuffers: SlotMap<FramebufferHandle, FramebufferResource>,
    pipelines: SlotMap<PipelineHandle, PipelineResource>,
    command_buffers: SlotMap<CommandBufferHandle, CommandBuffer>,
    sync_objects: SlotMap<SyncObjectHandle, SyncObjectResource>,

    create_queue: Vec<CreateEntry>,
    discard_queue: Vec<DiscardEntry>,
    submit_queue: Vec<CommandBufferHandle>,
    pending_updates: Vec<TextureUpdateInfo>,
    pending_sources: Vec<UpdateSource>,
    pending_update_bytes: usize,
    pending_syncs: Vec<SyncObjectHandle>,

    /// Controller-owned passes compiled for surface targets, so pipelines
    /// can bake variants before any caller-declared pass exists.
    surface_passes: SecondaryMap<RenderTargetHandle, RenderPassHandle>,

    present_pool: PresentBufferPool,
    stats: FrameStats,
    frame_count: u64,
    initialized: bool,
    paused: bool,
    draw_on_resume: bool,
}

impl GraphicsController {
    /// Builds a controller over `driver`. Inert until
    /// [`initialize`](Self::initialize) runs.
    pub fn new(driver: Arc<dyn GpuDriver>, settings: BackendSettings) -> Self {
        let transfer = TransferEngine::new(&settings);
        GraphicsController {
            driver,
            transfer,
            pipeline_cache: PipelineCacheManager::new(),
            settings,
            textures: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            programs: SlotMap::with_key(),
            render_passes: SlotMap::with_key(),
            render_targets: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            command_buffers: SlotMap::with_key(),
            sync_objects: SlotMap::with_key(),
            create_queue: Vec::new(),
            discard_queue: Vec::new(),
            submit_queue: Vec::new(),
            pending_updates: Vec::new(),
            pending_sources: Vec::new(),
            pending_update_bytes: 0,
            pending_syncs: Vec::new(),
            surface_passes: SecondaryMap::new(),
            present_pool: PresentBufferPool::new(),
            stats: FrameStats::default(),
            frame_count: 0,
            initialized: false,
            paused: false,
            draw_on_resume: false,
        }
    }

    /// Brings the controller up and seeds the pipeline cache from disk.
    /// Initializing twice without a shutdown in between is a programming
    /// error.
    pub fn initialize(&mut self) {
        debug_assert!(
            !self.initialized,
            "controller initialized twice without shutdown"
        );
        self.initialized = true;
        self.frame_count = 0;
        if self.settings.enable_pipeline_cache {
            if let Some(path) = self.settings.pipeline_cache_path.clone() {
                match self.pipeline_cache.load_blob(&path, self.driver.as_ref()) {
                    Ok(true) => log::debug!("pipeline cache seeded from {}", path.display()),
                    Ok(false) => {}
                    Err(e) => log::warn!("pipeline cache load failed: {e}"),
                }
            }
        }
        log::debug!(
            "graphics controller initialized, {} transfer workers",
            self.settings.transfer_workers
        );
    }

    /// Tears the controller down: pending work flushes, discards drain,
    /// the pipeline cache persists, and every owned resource is destroyed.
    /// Shutting down before initializing is a programming error.
    pub fn shutdown(&mut self) {
        debug_assert!(
            self.initialized,
            "controller shut down without initialization"
        );
        if let Err(e) = self.flush_submissions() {
            log::error!("final submission flush failed: {e}");
        }
        if let Err(e) = self.transfer.shutdown(self.driver.as_ref()) {
            log::error!("transfer engine shutdown failed: {e}");
        }
        if let Err(e) = self.driver.wait_idle() {
            log::error!("device idle wait failed: {e}");
        }

        // Undrained create entries are moot: destruction below covers live
        // driver objects and empty wrappers alike.
        self.create_queue.clear();
        self.process_discard_queues();
        debug_assert!(
            self.discard_queue.is_empty(),
            "discards queued during shutdown"
        );

        if self.settings.enable_pipeline_cache {
            if let Some(path) = self.settings.pipeline_cache_path.clone() {
                if let Err(e) = self.pipeline_cache.save_blob(&path, self.driver.as_ref()) {
                    log::warn!("pipeline cache save failed: {e}");
                }
            }
        }

        let driver = self.driver.as_ref();
        for (_, mut pipeline) in self.pipelines.drain() {
            pipeline.destroy(driver, Some(&mut self.pipeline_cache));
        }
        for (_, mut framebuffer) in self.framebuffers.drain() {
            framebuffer.destroy(driver);
        }
        for (_, mut target) in self.render_targets.drain() {
            target.destroy(driver);
        }
        for (_, mut pass) in self.render_passes.drain() {
            pass.destroy(driver);
        }
        for (_, mut texture) in self.textures.drain() {
            texture.destroy(driver);
        }
        for (_, mut buffer) in self.buffers.drain() {
            buffer.destroy(driver);
        }
        for (_, mut sampler) in self.samplers.drain() {
            sampler.destroy(driver);
        }
        for (_, mut shader) in self.shaders.drain() {
            shader.destroy(driver);
        }
        for (_, mut sync) in self.sync_objects.drain() {
            sync.destroy(driver);
        }
        self.programs.clear();
        self.command_buffers.clear();
        self.surface_passes.clear();
        self.present_pool = PresentBufferPool::new();
        self.submit_queue.clear();
        self.pending_syncs.clear();

        self.initialized = false;
        log::debug!(
            "graphics controller shut down after {} frames",
            self.frame_count
        );
    }

    /// Effective settings.
    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// Opens a frame: counters reset and the draw-on-resume flag clears.
    pub fn frame_start(&mut self) {
        self.frame_count += 1;
        self.stats = FrameStats::default();
        self.draw_on_resume = false;
        log::trace!("frame {} started", self.frame_count);
    }

    /// Diagnostic counters accumulated since the last frame start.
    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    /// Frames started since initialization.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Blocks until the device finishes all submitted work.
    pub fn wait_idle(&self) -> BackendResult<()> {
        self.driver.wait_idle()
    }

    /// Suspends frame production. Submissions queued while paused are
    /// kept and replay on the next flush.
    pub fn pause(&mut self) {
        self.paused = true;
        log::debug!("controller paused");
    }

    /// Resumes frame production and requests one draw for the first frame
    /// back, so stale surface content never shows.
    pub fn resume(&mut self) {
        self.paused = false;
        self.draw_on_resume = true;
        log::debug!("controller resumed");
    }

    /// Whether frame production is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the first frame after a resume still has to draw.
    pub fn is_draw_on_resume_required(&self) -> bool {
        self.draw_on_resume
    }

    /// Whether no resources await destruction.
    pub fn is_discard_queue_empty(&self) -> bool {
        self.discard_queue.is_empty()
    }

    /// Drains discard queues outside the frame loop, for teardown paths
    /// that want memory back before the next frame.
    pub fn run_garbage_collector(&mut self) {
        self.process_discard_queues();
    }

    /// Replays anything still queued, then drains discard queues. For
    /// background transitions that should give memory back immediately.
    pub fn discard_unused_resources(&mut self) -> BackendResult<()> {
        self.flush_submissions()?;
        self.process_discard_queues();
        Ok(())
    }
}

// Resource creation and discard.
impl GraphicsController {
    /// Creates a texture, recycling `old`'s driver objects when the
    /// descriptors are compatible. Textures wrapping a native image import
    /// during the next create-queue drain.
    pub fn create_texture(
        &mut self,
        info: TextureCreateInfo,
        old: Option<TextureHandle>,
    ) -> BackendResult<TextureHandle> {
        if let Some(source) = info.native_image.clone() {
            let (format, usage) = format_and_usage(source.as_ref())?;
            let mut info = info;
            info.format = format;
            info.usage = usage;
            info.size = source.extent();
            info.mip_levels = 1;
            let handle = self.textures.insert(TextureResource::new(info, format));
            self.create_queue.push(CreateEntry::Texture(handle));
            log::debug!("native texture queued for import");
            return Ok(handle);
        }

        let storage_format =
            resolve_storage_format(self.driver.as_ref(), info.format, info.tiling, info.usage);

        if let Some(old_handle) = old {
            if let Some(mut predecessor) = self.take_compatible_texture(old_handle, &info) {
                let layout = predecessor.current_layout();
                let (image, view) = predecessor.take_driver_objects();
                self.create_queue
                    .retain(|e| *e != CreateEntry::Texture(old_handle));
                self.discard_queue
                    .retain(|e| *e != DiscardEntry::Texture(old_handle));
                let mut resource = TextureResource::new(info, storage_format);
                resource.adopt_driver_objects(image, view, layout);
                let handle = self.textures.insert(resource);
                if image.is_none() {
                    self.create_queue.push(CreateEntry::Texture(handle));
                }
                log::trace!("texture recycled in place");
                return Ok(handle);
            }
        }

        let handle = self
            .textures
            .insert(TextureResource::new(info, storage_format));
        self.create_queue.push(CreateEntry::Texture(handle));
        Ok(handle)
    }

    /// Creates a buffer, recycling `old`'s driver object when compatible.
    pub fn create_buffer(
        &mut self,
        info: BufferCreateInfo,
        old: Option<BufferHandle>,
    ) -> BufferHandle {
        if let Some(old_handle) = old {
            let compatible = self
                .buffers
                .get(old_handle)
                .is_some_and(|candidate| candidate.is_compatible_with(&info));
            if compatible {
                if let Some(mut predecessor) = self.buffers.remove(old_handle) {
                    let recycled = predecessor.take_driver_objects();
                    self.create_queue
                        .retain(|e| *e != CreateEntry::Buffer(old_handle));
                    self.discard_queue
                        .retain(|e| *e != DiscardEntry::Buffer(old_handle));
                    let mut resource = BufferResource::new(info);
                    resource.adopt_driver_objects(recycled);
                    let handle = self.buffers.insert(resource);
                    if recycled.is_none() {
                        self.create_queue.push(CreateEntry::Buffer(handle));
                    }
                    return handle;
                }
            }
        }
        let handle = self.buffers.insert(BufferResource::new(info));
        self.create_queue.push(CreateEntry::Buffer(handle));
        handle
    }

    /// Creates a sampler, reusing `old`'s driver object when the
    /// descriptor matches exactly.
    pub fn create_sampler(
        &mut self,
        info: SamplerCreateInfo,
        old: Option<SamplerHandle>,
    ) -> BackendResult<SamplerHandle> {
        if let Some(old_handle) = old {
            let reusable = self
                .samplers
                .get(old_handle)
                .is_some_and(|s| s.is_compatible_with(&info) && s.sampler().is_some());
            if reusable {
                if let Some(mut predecessor) = self.samplers.remove(old_handle) {
                    if let Some(sampler) = predecessor.take_driver_objects() {
                        self.discard_queue
                            .retain(|e| *e != DiscardEntry::Sampler(old_handle));
                        return Ok(self
                            .samplers
                            .insert(SamplerResource::from_recycled(info, sampler)));
                    }
                }
            }
        }
        let resource = SamplerResource::create(info, self.driver.as_ref())?;
        Ok(self.samplers.insert(resource))
    }

    /// Compiles a shader module, reusing `old`'s when the stage and
    /// bytecode match.
    pub fn create_shader(
        &mut self,
        info: ShaderCreateInfo,
        old: Option<ShaderHandle>,
    ) -> BackendResult<ShaderHandle> {
        if let Some(old_handle) = old {
            let reusable = self
                .shaders
                .get(old_handle)
                .is_some_and(|s| s.is_compatible_with(&info) && s.module().is_some());
            if reusable {
                if let Some(mut predecessor) = self.shaders.remove(old_handle) {
                    if let Some(module) = predecessor.take_driver_objects() {
                        self.discard_queue
                            .retain(|e| *e != DiscardEntry::Shader(old_handle));
                        return Ok(self
                            .shaders
                            .insert(ShaderResource::from_recycled(info, module)));
                    }
                }
            }
        }
        let resource = ShaderResource::create(info, self.driver.as_ref())?;
        Ok(self.shaders.insert(resource))
    }

    /// Links a program from compiled shaders. When `old` links the same
    /// set of modules, its linkage and reflection move to the new handle.
    pub fn create_program(
        &mut self,
        info: ProgramCreateInfo,
        old: Option<ProgramHandle>,
    ) -> BackendResult<ProgramHandle> {
        let mut stages = Vec::with_capacity(info.shaders.len());
        for shader in &info.shaders {
            let resource = self
                .shaders
                .get(*shader)
                .ok_or(BackendError::StaleHandle { kind: "shader" })?;
            let module = resource
                .module()
                .ok_or(BackendError::StaleHandle { kind: "shader" })?;
            stages.push((resource.info().clone(), module));
        }

        if let Some(old_handle) = old {
            let same_modules = self.programs.get(old_handle).is_some_and(|p| {
                p.stages().len() == stages.len()
                    && stages
                        .iter()
                        .all(|(_, module)| p.stages().iter().any(|s| s.module == *module))
            });
            if same_modules {
                if let Some(predecessor) = self.programs.remove(old_handle) {
                    self.discard_queue
                        .retain(|e| *e != DiscardEntry::Program(old_handle));
                    return Ok(self.programs.insert(predecessor));
                }
            }
        }

        let program = ProgramResource::link(info.name, stages)?;
        Ok(self.programs.insert(program))
    }

    /// Creates a render pass. An `old` pass with identical attachments
    /// moves to the new handle instead of allocating.
    pub fn create_render_pass(
        &mut self,
        info: RenderPassCreateInfo,
        old: Option<RenderPassHandle>,
    ) -> BackendResult<RenderPassHandle> {
        if let Some(old_handle) = old {
            let identical = self
                .render_passes
                .get(old_handle)
                .is_some_and(|p| p.info().attachments == info.attachments && p.render_pass().is_some());
            if identical {
                if let Some(predecessor) = self.render_passes.remove(old_handle) {
                    self.discard_queue
                        .retain(|e| *e != DiscardEntry::RenderPass(old_handle));
                    return Ok(self.render_passes.insert(predecessor));
                }
            }
        }
        let resource = RenderPassResource::create(info, self.driver.as_ref())?;
        Ok(self.render_passes.insert(resource))
    }

    /// Creates a render target. Surface registrations are bound to one
    /// windowing surface, so `old` keeps its own discard lifecycle.
    pub fn create_render_target(
        &mut self,
        info: RenderTargetCreateInfo,
        old: Option<RenderTargetHandle>,
    ) -> BackendResult<RenderTargetHandle> {
        if old.is_some() {
            log::trace!("render targets never recycle");
        }
        let resource = RenderTargetResource::create(info, self.driver.as_ref())?;
        Ok(self.render_targets.insert(resource))
    }

    /// Creates a framebuffer. The driver object is built during the next
    /// create-queue drain, after attachment textures initialize.
    pub fn create_framebuffer(
        &mut self,
        info: FramebufferCreateInfo,
        old: Option<FramebufferHandle>,
    ) -> FramebufferHandle {
        if old.is_some() {
            log::trace!("framebuffers never recycle");
        }
        let handle = self.framebuffers.insert(FramebufferResource::new(info));
        self.create_queue.push(CreateEntry::Framebuffer(handle));
        handle
    }

    /// Creates a pipeline against a program and render target. An `old`
    /// pipeline with an identical descriptor keeps its compiled variants.
    pub fn create_pipeline(
        &mut self,
        info: &PipelineCreateInfo<'_>,
        old: Option<PipelineHandle>,
    ) -> BackendResult<PipelineHandle> {
        if let Some(old_handle) = old {
            let identical = self
                .pipelines
                .get(old_handle)
                .is_some_and(|p| p.matches_create_info(info));
            if identical {
                if let Some(predecessor) = self.pipelines.remove(old_handle) {
                    self.discard_queue
                        .retain(|e| *e != DiscardEntry::Pipeline(old_handle));
                    log::trace!(
                        "pipeline recycled with {} compiled variants",
                        predecessor.variant_count()
                    );
                    return Ok(self.pipelines.insert(predecessor));
                }
            }
        }

        let stages = self
            .programs
            .get(info.program)
            .ok_or(BackendError::StaleHandle { kind: "program" })?
            .stages()
            .to_vec();
        let (pass_handle, pass_id) = self.pipeline_render_pass(info.render_target)?;
        let mut resource = PipelineResource::new(info, stages);
        resource.initialize(
            self.driver.as_ref(),
            &mut self.pipeline_cache,
            pass_handle,
            pass_id,
        )?;
        Ok(self.pipelines.insert(resource))
    }

    /// Creates a command buffer, reconfiguring `old` in place to keep its
    /// command allocation when one is supplied.
    pub fn create_command_buffer(
        &mut self,
        info: &CommandBufferCreateInfo,
        old: Option<CommandBufferHandle>,
    ) -> CommandBufferHandle {
        if let Some(old_handle) = old {
            if let Some(mut predecessor) = self.command_buffers.remove(old_handle) {
                predecessor.reset(info.level, info.fixed_capacity);
                return self.command_buffers.insert(predecessor);
            }
        }
        self.command_buffers
            .insert(CommandBuffer::new(info.level, info.fixed_capacity))
    }

    /// Creates a sync object whose fence signals once the work queued
    /// before the next flush completes.
    pub fn create_sync_object(
        &mut self,
        _info: SyncObjectCreateInfo,
        old: Option<SyncObjectHandle>,
    ) -> BackendResult<SyncObjectHandle> {
        if old.is_some() {
            log::trace!("sync objects never recycle");
        }
        let resource = SyncObjectResource::create(self.driver.as_ref())?;
        let handle = self.sync_objects.insert(resource);
        self.pending_syncs.push(handle);
        Ok(handle)
    }

    /// Queues a texture for destruction at the next discard drain.
    pub fn discard_texture(&mut self, handle: TextureHandle) {
        if let Some(texture) = self.textures.get_mut(handle) {
            texture.mark_discarded();
            self.discard_queue.push(DiscardEntry::Texture(handle));
        }
    }

    /// Queues a buffer for destruction at the next discard drain.
    pub fn discard_buffer(&mut self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.get_mut(handle) {
            buffer.mark_discarded();
            self.discard_queue.push(DiscardEntry::Buffer(handle));
        }
    }

    /// Queues a sampler for destruction at the next discard drain.
    pub fn discard_sampler(&mut self, handle: SamplerHandle) {
        if let Some(sampler) = self.samplers.get_mut(handle) {
            sampler.mark_discarded();
            self.discard_queue.push(DiscardEntry::Sampler(handle));
        }
    }

    /// Queues a shader for destruction at the next discard drain.
    pub fn discard_shader(&mut self, handle: ShaderHandle) {
        if let Some(shader) = self.shaders.get_mut(handle) {
            shader.mark_discarded();
            self.discard_queue.push(DiscardEntry::Shader(handle));
        }
    }

    /// Queues a program for destruction at the next discard drain.
    pub fn discard_program(&mut self, handle: ProgramHandle) {
        if let Some(program) = self.programs.get_mut(handle) {
            program.mark_discarded();
            self.discard_queue.push(DiscardEntry::Program(handle));
        }
    }

    /// Queues a render pass for destruction at the next discard drain.
    pub fn discard_render_pass(&mut self, handle: RenderPassHandle) {
        if let Some(pass) = self.render_passes.get_mut(handle) {
            pass.mark_discarded();
            self.discard_queue.push(DiscardEntry::RenderPass(handle));
        }
    }

    /// Queues a render target for destruction, along with any
    /// controller-owned pass compiled for its surface.
    pub fn discard_render_target(&mut self, handle: RenderTargetHandle) {
        let Some(target) = self.render_targets.get_mut(handle) else {
            return;
        };
        target.mark_discarded();
        self.discard_queue.push(DiscardEntry::RenderTarget(handle));
        if let Some(pass) = self.surface_passes.remove(handle) {
            self.discard_render_pass(pass);
        }
    }

    /// Queues a framebuffer for destruction at the next discard drain.
    pub fn discard_framebuffer(&mut self, handle: FramebufferHandle) {
        if let Some(framebuffer) = self.framebuffers.get_mut(handle) {
            framebuffer.mark_discarded();
            self.discard_queue.push(DiscardEntry::Framebuffer(handle));
        }
    }

    /// Queues a pipeline for destruction at the next discard drain.
    pub fn discard_pipeline(&mut self, handle: PipelineHandle) {
        if let Some(pipeline) = self.pipelines.get_mut(handle) {
            pipeline.mark_discarded();
            self.discard_queue.push(DiscardEntry::Pipeline(handle));
        }
    }

    /// Queues a sync object for destruction at the next discard drain.
    pub fn discard_sync_object(&mut self, handle: SyncObjectHandle) {
        if let Some(sync) = self.sync_objects.get_mut(handle) {
            sync.mark_discarded();
            self.discard_queue.push(DiscardEntry::SyncObject(handle));
            self.pending_syncs.retain(|h| *h != handle);
        }
    }

    /// Destroys a command buffer immediately; recorded logs own no driver
    /// objects.
    pub fn discard_command_buffer(&mut self, handle: CommandBufferHandle) {
        debug_assert!(
            !self.submit_queue.contains(&handle),
            "discarding a command buffer queued for replay"
        );
        self.command_buffers.remove(handle);
    }

    /// Removes `old` for recycling when its descriptor is compatible,
    /// leaving it untouched otherwise.
    fn take_compatible_texture(
        &mut self,
        old: TextureHandle,
        info: &TextureCreateInfo,
    ) -> Option<TextureResource> {
        if self.textures.get(old)?.is_compatible_with(info) {
            self.textures.remove(old)
        } else {
            None
        }
    }

    /// The render pass a pipeline targeting `target` bakes variants
    /// against: a framebuffer target's declared pass, or a controller-owned
    /// pass matching the surface format.
    fn pipeline_render_pass(
        &mut self,
        target: RenderTargetHandle,
    ) -> BackendResult<(RenderPassHandle, RenderPassId)> {
        let resource = self
            .render_targets
            .get(target)
            .ok_or(BackendError::StaleHandle { kind: "render target" })?;

        if let Some(framebuffer) = resource.framebuffer() {
            let declared = self
                .framebuffers
                .get(framebuffer)
                .ok_or(BackendError::StaleHandle { kind: "framebuffer" })?
                .render_pass_handle()
                .ok_or_else(|| BackendError::invalid("framebuffer declares no render pass"))?;
            let id = self
                .render_passes
                .get(declared)
                .and_then(RenderPassResource::render_pass)
                .ok_or(BackendError::StaleHandle { kind: "render pass" })?;
            return Ok((declared, id));
        }

        let Some(surface) = resource.surface() else {
            debug_assert!(false, "render target has neither surface nor framebuffer");
            return Err(BackendError::invalid(
                "render target has neither surface nor framebuffer",
            ));
        };

        if let Some(&existing) = self.surface_passes.get(target) {
            if let Some(id) = self
                .render_passes
                .get(existing)
                .and_then(RenderPassResource::render_pass)
            {
                return Ok((existing, id));
            }
        }

        let info = RenderPassCreateInfo {
            attachments: vec![AttachmentDescription {
                format: surface.color_format(),
                load_op: AttachmentLoadOp::Clear,
                store_op: AttachmentStoreOp::Store,
                stencil_load_op: AttachmentLoadOp::DontCare,
                stencil_store_op: AttachmentStoreOp::DontCare,
            }],
        };
        let pass = RenderPassResource::create(info, self.driver.as_ref())?;
        let id = pass
            .render_pass()
            .ok_or(BackendError::StaleHandle { kind: "render pass" })?;
        let handle = self.render_passes.insert(pass);
        self.surface_passes.insert(target, handle);
        log::debug!("render pass created for surface target");
        Ok((handle, id))
    }
}

// Queue drains, submission and transfers.
impl GraphicsController {
    /// Drains the create queue, building driver objects in push order. A
    /// failed creation logs and leaves the resource empty; binds of an
    /// empty resource are skipped during replay.
    pub fn process_create_queues(&mut self) {
        if self.create_queue.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.create_queue);
        log::trace!("processing {} create entries", entries.len());
        for entry in entries {
            match entry {
                CreateEntry::Texture(handle) => self.create_queued_texture(handle),
                CreateEntry::Buffer(handle) => {
                    let Some(buffer) = self.buffers.get_mut(handle) else {
                        continue;
                    };
                    if let Err(e) = buffer.ensure_initialized(self.driver.as_ref()) {
                        log::error!("buffer creation failed: {e}");
                    }
                }
                CreateEntry::Framebuffer(handle) => self.create_queued_framebuffer(handle),
            }
        }
    }

    /// Drains the discard queue, destroying driver objects. Runs after
    /// the frame's replays so nothing in flight references the victims.
    pub fn process_discard_queues(&mut self) {
        if self.discard_queue.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.discard_queue);
        log::trace!("processing {} discard entries", entries.len());
        let driver = self.driver.as_ref();
        for entry in entries {
            match entry {
                DiscardEntry::Texture(handle) => {
                    if let Some(mut texture) = self.textures.remove(handle) {
                        texture.destroy(driver);
                    }
                }
                DiscardEntry::Buffer(handle) => {
                    if let Some(mut buffer) = self.buffers.remove(handle) {
                        buffer.destroy(driver);
                    }
                }
                DiscardEntry::Sampler(handle) => {
                    if let Some(mut sampler) = self.samplers.remove(handle) {
                        sampler.destroy(driver);
                    }
                }
                DiscardEntry::Shader(handle) => {
                    if let Some(mut shader) = self.shaders.remove(handle) {
                        shader.destroy(driver);
                    }
                }
                DiscardEntry::Program(handle) => {
                    self.programs.remove(handle);
                }
                DiscardEntry::RenderPass(handle) => {
                    if let Some(mut pass) = self.render_passes.remove(handle) {
                        pass.destroy(driver);
                    }
                }
                DiscardEntry::RenderTarget(handle) => {
                    if let Some(mut target) = self.render_targets.remove(handle) {
                        target.destroy(driver);
                    }
                }
                DiscardEntry::Framebuffer(handle) => {
                    if let Some(mut framebuffer) = self.framebuffers.remove(handle) {
                        framebuffer.destroy(driver);
                    }
                }
                DiscardEntry::Pipeline(handle) => {
                    if let Some(mut pipeline) = self.pipelines.remove(handle) {
                        pipeline.destroy(driver, Some(&mut self.pipeline_cache));
                    }
                }
                DiscardEntry::SyncObject(handle) => {
                    if let Some(mut sync) = self.sync_objects.remove(handle) {
                        sync.destroy(driver);
                    }
                }
            }
        }
    }

    /// Enqueues command buffers for replay. A FLUSH flag replays the
    /// whole queue synchronously before returning.
    pub fn submit_command_buffers(&mut self, info: SubmitInfo) -> BackendResult<()> {
        self.stats.submitted_buffers += info.command_buffers.len() as u32;
        self.submit_queue.extend(info.command_buffers);
        if info.flags.contains(SubmitFlags::FLUSH) {
            self.flush_submissions()?;
        }
        Ok(())
    }

    /// Presents a render target's surface through a pooled one-command
    /// buffer. The submission flushes implicitly.
    pub fn present_render_target(&mut self, target: RenderTargetHandle) -> BackendResult<()> {
        let handle = self.present_pool.acquire(&mut self.command_buffers);
        if let Some(buffer) = self.command_buffers.get_mut(handle) {
            buffer.begin(CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            buffer.present(target);
            buffer.end();
        }
        let result = self.submit_command_buffers(SubmitInfo {
            command_buffers: vec![handle],
            flags: SubmitFlags::FLUSH,
        });
        self.present_pool.release(handle);
        result
    }

    /// Queues texture updates. Once queued source bytes pass the implicit
    /// flush threshold the whole batch drains immediately, bounding peak
    /// staging memory.
    pub fn update_textures(
        &mut self,
        updates: Vec<TextureUpdateInfo>,
        sources: Vec<UpdateSource>,
    ) -> BackendResult<()> {
        let base = self.pending_sources.len();
        for mut update in updates {
            update.src_reference += base;
            self.pending_updates.push(update);
        }
        for source in &sources {
            let bytes = match source {
                UpdateSource::Memory(bytes) => bytes.len(),
                UpdateSource::PixelData { data, .. } => data.with_bytes(<[u8]>::len).unwrap_or(0),
                UpdateSource::Buffer(_) => 0,
            };
            self.pending_update_bytes += bytes;
            self.stats.update_bytes += bytes;
        }
        self.pending_sources.extend(sources);

        if self.pending_update_bytes >= UPDATE_FLUSH_THRESHOLD {
            log::trace!(
                "implicit texture update flush at {} queued bytes",
                self.pending_update_bytes
            );
            self.flush_texture_work()?;
        }
        Ok(())
    }

    /// Queues full-chain mipmap generation. The pass runs after queued
    /// texture updates, so the base level holds its final content.
    pub fn generate_texture_mipmaps(&mut self, handle: TextureHandle) -> BackendResult<()> {
        let pending_write = self.pending_updates.iter().any(|u| u.destination == handle);
        let Some(texture) = self.textures.get_mut(handle) else {
            return Err(BackendError::StaleHandle { kind: "texture" });
        };
        texture.ensure_initialized(self.driver.as_ref())?;
        let Some(image) = texture.image() else {
            return Err(BackendError::invalid("mipmaps requested for an empty texture"));
        };
        if texture.mip_levels() <= 1 {
            return Ok(());
        }
        // Updates queued ahead of this pass leave the image shader-readable.
        let base_layout = if pending_write {
            TextureLayout::ShaderReadOnly
        } else {
            texture.current_layout()
        };
        self.transfer.schedule_texture_mipmaps(MipmapRequest {
            image,
            extent: texture.info().size,
            mip_levels: texture.mip_levels(),
            base_layout,
        });
        texture.set_current_layout(TextureLayout::ShaderReadOnly);
        Ok(())
    }

    /// Appends a raw transfer request. Non-deferred requests drain the
    /// transfer queue synchronously before returning.
    pub fn schedule_resource_transfer(
        &mut self,
        request: TransferRequest,
        deferred: bool,
    ) -> BackendResult<()> {
        self.transfer
            .schedule_resource_transfer(self.driver.as_ref(), request, deferred)
    }

    /// Replays every queued submission in order, after draining queued
    /// texture work so uploads land before the draws that sample them.
    fn flush_submissions(&mut self) -> BackendResult<()> {
        self.flush_texture_work()?;
        if self.submit_queue.is_empty() {
            return self.signal_pending_syncs();
        }

        let queued = std::mem::take(&mut self.submit_queue);
        log::trace!("replaying {} command buffers", queued.len());

        let mut encoder = self.driver.create_encoder()?;
        encoder.begin()?;
        let mut replayer = Replayer::new();
        {
            let mut env = ReplayEnv {
                driver: self.driver.as_ref(),
                textures: &self.textures,
                buffers: &self.buffers,
                samplers: &self.samplers,
                pipelines: &mut self.pipelines,
                render_passes: &self.render_passes,
                render_targets: &self.render_targets,
                framebuffers: &self.framebuffers,
                cache: &mut self.pipeline_cache,
            };
            for handle in &queued {
                replayer.replay_buffer(&mut env, &self.command_buffers, encoder.as_mut(), *handle)?;
            }
        }
        replayer.assert_passes_closed();
        self.stats.replayed_commands += replayer.replayed_commands();
        let presents = replayer.take_presents();

        let encoded = encoder.finish()?;
        let fence = self.driver.create_fence(false)?;
        let submitted = self
            .driver
            .submit(vec![encoded], Some(fence))
            .and_then(|()| self.driver.wait_for_fence(fence, u64::MAX))
            .map(|_| ());
        self.driver.destroy_fence(fence);
        submitted?;

        for target in presents {
            self.finish_present(target)?;
        }
        self.signal_pending_syncs()
    }

    /// Drains queued texture updates, deferred transfer requests and
    /// mipmap passes, in that order.
    fn flush_texture_work(&mut self) -> BackendResult<()> {
        if !self.pending_updates.is_empty() {
            let updates = std::mem::take(&mut self.pending_updates);
            let sources = std::mem::take(&mut self.pending_sources);
            self.pending_update_bytes = 0;
            self.transfer.process_texture_updates(
                self.driver.as_ref(),
                &mut self.textures,
                &mut self.buffers,
                &updates,
                sources,
            )?;
        }
        self.transfer
            .process_resource_transfer_requests(self.driver.as_ref())?;
        self.transfer.process_mipmap_requests(self.driver.as_ref())
    }

    /// Completes a present collected during replay: the surface advances
    /// to its next buffered image and the windowing side swaps.
    fn finish_present(&self, target: RenderTargetHandle) -> BackendResult<()> {
        let Some(resource) = self.render_targets.get(target) else {
            debug_assert!(false, "presenting a discarded render target");
            return Err(BackendError::StaleHandle { kind: "render target" });
        };
        let Some(surface) = resource.surface() else {
            log::warn!("present recorded for a target without a surface");
            return Ok(());
        };
        if let Some(surface_id) = resource.surface_id() {
            self.driver.advance_surface(surface_id)?;
        }
        surface.post_render();
        Ok(())
    }

    /// Signals fences of sync objects created since the last flush. Work
    /// queued before their creation has completed by now.
    fn signal_pending_syncs(&mut self) -> BackendResult<()> {
        for handle in std::mem::take(&mut self.pending_syncs) {
            if let Some(fence) = self.sync_objects.get(handle).and_then(SyncObjectResource::fence)
            {
                self.driver.submit(Vec::new(), Some(fence))?;
            }
        }
        Ok(())
    }

    fn create_queued_texture(&mut self, handle: TextureHandle) {
        let Some(texture) = self.textures.get_mut(handle) else {
            return;
        };
        if texture.is_native() {
            let Some(source) = texture.info().native_image.clone() else {
                return;
            };
            match initialize_native_texture(self.driver.as_ref(), source) {
                Ok(imported) => {
                    texture.adopt_imported(imported.image, imported.view, imported.state);
                }
                // A failed import leaves the texture empty; binds of it are
                // skipped during replay.
                Err(e) => log::error!("native image import failed: {e}"),
            }
            return;
        }
        if let Err(e) = texture.ensure_initialized(self.driver.as_ref()) {
            log::error!("texture creation failed: {e}");
        }
    }

    fn create_queued_framebuffer(&mut self, handle: FramebufferHandle) {
        let Some(info) = self.framebuffers.get(handle).map(|f| f.info().clone()) else {
            return;
        };
        let Some(pass_handle) = info.render_pass else {
            log::error!("framebuffer declares no render pass");
            return;
        };
        let Some(pass_id) = self
            .render_passes
            .get(pass_handle)
            .and_then(RenderPassResource::render_pass)
        else {
            log::error!("framebuffer references a destroyed render pass");
            return;
        };

        let mut attachments = Vec::with_capacity(info.color_attachments.len() + 1);
        let bindings = info
            .color_attachments
            .iter()
            .chain(info.depth_stencil_attachment.iter());
        for binding in bindings {
            let Some(texture) = self.textures.get_mut(binding.texture) else {
                log::error!("framebuffer attachment references a destroyed texture");
                return;
            };
            if let Err(e) = texture.ensure_initialized(self.driver.as_ref()) {
                log::error!("framebuffer attachment creation failed: {e}");
                return;
            }
            let Some(view) = texture.view() else {
                log::error!("framebuffer attachment has no image view");
                return;
            };
            if binding.level != 0 {
                log::warn!(
                    "attachment binds mip {}; the whole-texture view is attached",
                    binding.level
                );
            }
            attachments.push(view);
        }

        let Some(framebuffer) = self.framebuffers.get_mut(handle) else {
            return;
        };
        if let Err(e) = framebuffer.initialize(self.driver.as_ref(), pass_id, attachments) {
            log::error!("framebuffer creation failed: {e}");
        }
    }
}

// Queries and memory access.
impl GraphicsController {
    /// GPU-side facts about a texture, including emulated storage.
    pub fn get_texture_properties(&self, handle: TextureHandle) -> BackendResult<TextureProperties> {
        self.textures
            .get(handle)
            .map(TextureResource::properties)
            .ok_or(BackendError::StaleHandle { kind: "texture" })
    }

    /// Reflection facts of a linked program.
    pub fn get_program_reflection(&self, handle: ProgramHandle) -> BackendResult<&ProgramReflection> {
        self.programs
            .get(handle)
            .map(ProgramResource::reflection)
            .ok_or(BackendError::StaleHandle { kind: "program" })
    }

    /// Whether two pipelines bake identical state against the same
    /// program and render target.
    pub fn pipeline_equals(&self, a: PipelineHandle, b: PipelineHandle) -> bool {
        match (self.pipelines.get(a), self.pipelines.get(b)) {
            (Some(a), Some(b)) => {
                a.program() == b.program()
                    && a.render_target() == b.render_target()
                    && a.owned_state() == b.owned_state()
            }
            _ => false,
        }
    }

    /// Driver memory requirements of a buffer, instantiating it first if
    /// its create queue entry has not drained yet.
    pub fn get_buffer_memory_requirements(
        &mut self,
        handle: BufferHandle,
    ) -> BackendResult<MemoryRequirements> {
        let Some(buffer) = self.buffers.get_mut(handle) else {
            return Err(BackendError::StaleHandle { kind: "buffer" });
        };
        buffer.ensure_initialized(self.driver.as_ref())?;
        let id = buffer
            .buffer()
            .ok_or(BackendError::StaleHandle { kind: "buffer" })?;
        self.driver.buffer_memory_requirements(id)
    }

    /// Driver memory requirements of a texture, instantiating it first if
    /// its create queue entry has not drained yet.
    pub fn get_texture_memory_requirements(
        &mut self,
        handle: TextureHandle,
    ) -> BackendResult<MemoryRequirements> {
        let Some(texture) = self.textures.get_mut(handle) else {
            return Err(BackendError::StaleHandle { kind: "texture" });
        };
        texture.ensure_initialized(self.driver.as_ref())?;
        let id = texture
            .image()
            .ok_or(BackendError::StaleHandle { kind: "texture" })?;
        self.driver.image_memory_requirements(id)
    }

    /// Maps a range of a host-visible buffer for writing.
    pub fn map_buffer_range(
        &mut self,
        handle: BufferHandle,
        offset: usize,
        size: usize,
    ) -> BackendResult<MappedMemory<'_>> {
        let Some(buffer) = self.buffers.get_mut(handle) else {
            return Err(BackendError::StaleHandle { kind: "buffer" });
        };
        if !buffer.info().cpu_accessible {
            return Err(BackendError::invalid("buffer is not host visible"));
        }
        if offset
            .checked_add(size)
            .map_or(true, |end| end > buffer.info().size)
        {
            return Err(BackendError::invalid("mapped range exceeds buffer size"));
        }
        buffer.ensure_initialized(self.driver.as_ref())?;
        let id = buffer
            .buffer()
            .ok_or(BackendError::StaleHandle { kind: "buffer" })?;
        let base = self.driver.map_buffer(id)?;
        // Safety: the driver maps the whole buffer and the range was
        // bounds-checked against its size.
        let ptr = unsafe { base.add(offset) };
        Ok(MappedMemory {
            driver: self.driver.as_ref(),
            target: MappedTarget::Buffer(id),
            ptr,
            size,
        })
    }

    /// Maps a range of a linear, host-writable texture.
    pub fn map_texture_range(
        &mut self,
        handle: TextureHandle,
        offset: usize,
        size: usize,
    ) -> BackendResult<MappedMemory<'_>> {
        let Some(texture) = self.textures.get_mut(handle) else {
            return Err(BackendError::StaleHandle { kind: "texture" });
        };
        if !texture.is_direct_writable() {
            return Err(BackendError::invalid(
                "texture tiling does not allow host mapping",
            ));
        }
        texture.ensure_initialized(self.driver.as_ref())?;
        let id = texture
            .image()
            .ok_or(BackendError::StaleHandle { kind: "texture" })?;
        let base = self.driver.map_image(id)?;
        // Safety: linear images map whole; the caller sized the range
        // from the requirements it queried beforehand.
        let ptr = unsafe { base.add(offset) };
        Ok(MappedMemory {
            driver: self.driver.as_ref(),
            target: MappedTarget::Image(id),
            ptr,
            size,
        })
    }

    /// The recorded log behind a command buffer handle.
    pub fn command_buffer(&self, handle: CommandBufferHandle) -> Option<&CommandBuffer> {
        self.command_buffers.get(handle)
    }

    /// Mutable access for recording into a command buffer.
    pub fn command_buffer_mut(&mut self, handle: CommandBufferHandle) -> Option<&mut CommandBuffer> {
        self.command_buffers.get_mut(handle)
    }
}

impl Drop for GraphicsController {
    fn drop(&mut self) {
        if self.initialized {
            log::warn!("graphics controller dropped without shutdown; driver objects leak");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    use crate::api::info::{
        AttachmentBinding, CommandBufferLevel, PipelineStage, PixelData,
    };
    use crate::api::state::DepthStencilState;
    use crate::api::types::{
        BufferUsageFlags, ClearValue, Extent2D, Format, Offset2D, Rect2D, TextureTiling,
        TextureType, TextureUsageFlags,
    };
    use crate::driver::recording::{RecordedOp, RecordingDriver, TimelineEvent};
    use crate::native_image::surface::{NativeBufferId, RenderSurface, SurfaceReferenceManager};
    use crate::native_image::{NativeImageSource, PlaneLayout};

    fn test_settings() -> BackendSettings {
        BackendSettings {
            transfer_workers: 0,
            enable_pipeline_cache: false,
            ..BackendSettings::default()
        }
    }

    fn controller() -> (Arc<RecordingDriver>, GraphicsController) {
        let _ = env_logger::builder().is_test(true).try_init();
        let driver = Arc::new(RecordingDriver::new());
        let mut controller = GraphicsController::new(driver.clone(), test_settings());
        controller.initialize();
        (driver, controller)
    }

    fn rgba_texture(size: u32) -> TextureCreateInfo {
        TextureCreateInfo {
            texture_type: TextureType::Texture2D,
            size: Extent2D {
                width: size,
                height: size,
            },
            format: Format::R8G8B8A8Unorm,
            usage: TextureUsageFlags::SAMPLE | TextureUsageFlags::TRANSFER_DST,
            tiling: TextureTiling::Optimal,
            mip_levels: 1,
            native_image: None,
        }
    }

    fn full_texture_update(texture: TextureHandle, size: u32) -> TextureUpdateInfo {
        TextureUpdateInfo {
            destination: texture,
            dst_offset: Offset2D::default(),
            src_reference: 0,
            src_offset: 0,
            src_extent: Extent2D {
                width: size,
                height: size,
            },
            src_format: Format::R8G8B8A8Unorm,
            src_stride: 0,
            layer: 0,
            level: 0,
        }
    }

    fn spirv_stub(stage: PipelineStage) -> ShaderCreateInfo {
        ShaderCreateInfo {
            stage: Some(stage),
            source: vec![0x03, 0x02, 0x23, 0x07],
            entry_point: "main".into(),
            uniform_blocks: Vec::new(),
            samplers: Vec::new(),
        }
    }

    fn linked_program(controller: &mut GraphicsController) -> ProgramHandle {
        let vert = controller
            .create_shader(spirv_stub(PipelineStage::Vertex), None)
            .unwrap();
        let frag = controller
            .create_shader(spirv_stub(PipelineStage::Fragment), None)
            .unwrap();
        controller
            .create_program(
                ProgramCreateInfo {
                    shaders: vec![vert, frag],
                    name: "test".into(),
                },
                None,
            )
            .unwrap()
    }

    struct Scene {
        render_pass: RenderPassHandle,
        render_target: RenderTargetHandle,
        program: ProgramHandle,
        pipeline: PipelineHandle,
    }

    fn offscreen_scene(controller: &mut GraphicsController) -> Scene {
        let color = controller
            .create_texture(
                TextureCreateInfo {
                    usage: TextureUsageFlags::COLOR_ATTACHMENT | TextureUsageFlags::SAMPLE,
                    ..rgba_texture(64)
                },
                None,
            )
            .unwrap();
        let render_pass = controller
            .create_render_pass(
                RenderPassCreateInfo {
                    attachments: vec![AttachmentDescription {
                        format: Format::R8G8B8A8Unorm,
                        load_op: AttachmentLoadOp::Clear,
                        store_op: AttachmentStoreOp::Store,
                        ..AttachmentDescription::default()
                    }],
                },
                None,
            )
            .unwrap();
        let framebuffer = controller.create_framebuffer(
            FramebufferCreateInfo {
                color_attachments: vec![AttachmentBinding {
                    texture: color,
                    level: 0,
                    layer: 0,
                }],
                depth_stencil_attachment: None,
                render_pass: Some(render_pass),
                size: Extent2D {
                    width: 64,
                    height: 64,
                },
            },
            None,
        );
        let render_target = controller
            .create_render_target(
                RenderTargetCreateInfo {
                    surface: None,
                    framebuffer: Some(framebuffer),
                    extent: Extent2D {
                        width: 64,
                        height: 64,
                    },
                },
                None,
            )
            .unwrap();
        controller.process_create_queues();
        assert!(controller.framebuffers[framebuffer].framebuffer().is_some());

        let program = linked_program(controller);
        let pipeline = controller
            .create_pipeline(
                &PipelineCreateInfo {
                    program,
                    vertex_input_state: None,
                    input_assembly_state: None,
                    rasterization_state: None,
                    viewport_state: None,
                    depth_stencil_state: None,
                    color_blend_state: None,
                    multisample_state: None,
                    render_target,
                },
                None,
            )
            .unwrap();
        Scene {
            render_pass,
            render_target,
            program,
            pipeline,
        }
    }

    fn submission_ops(driver: &RecordingDriver) -> Vec<RecordedOp> {
        driver
            .timeline()
            .into_iter()
            .filter_map(|event| match event {
                TimelineEvent::Submission { ops, .. } => Some(ops),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[derive(Debug, Default)]
    struct FakeWindow {
        swaps: AtomicU32,
    }

    impl RenderSurface for FakeWindow {
        fn extent(&self) -> Extent2D {
            Extent2D {
                width: 320,
                height: 240,
            }
        }

        fn color_format(&self) -> Format {
            Format::B8G8R8A8Unorm
        }

        fn make_context_current(&self) {}

        fn post_render(&self) {
            self.swaps.fetch_add(1, Ordering::SeqCst);
        }

        fn buffer_age(&self) -> u32 {
            0
        }
    }

    #[derive(Debug)]
    struct FakePixmap {
        file: File,
        acquires: AtomicU32,
        releases: AtomicU32,
        plane_refs: AtomicI32,
    }

    impl FakePixmap {
        fn new() -> Self {
            FakePixmap {
                file: File::open("/dev/null").unwrap(),
                acquires: AtomicU32::new(0),
                releases: AtomicU32::new(0),
                plane_refs: AtomicI32::new(0),
            }
        }

        fn balanced(&self) -> bool {
            self.acquires.load(Ordering::SeqCst) == self.releases.load(Ordering::SeqCst)
                && self.plane_refs.load(Ordering::SeqCst) == 0
        }
    }

    impl SurfaceReferenceManager for FakePixmap {
        fn acquire_surface_reference(&self, _buffer: NativeBufferId) {
            self.acquires.fetch_add(1, Ordering::SeqCst);
        }

        fn release_surface_reference(&self, _buffer: NativeBufferId) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl NativeImageSource for FakePixmap {
        fn is_valid(&self) -> bool {
            true
        }

        fn format(&self) -> Format {
            Format::R8G8B8A8Unorm
        }

        fn extent(&self) -> Extent2D {
            Extent2D {
                width: 32,
                height: 32,
            }
        }

        fn modifier(&self) -> u64 {
            0
        }

        fn plane_count(&self) -> u32 {
            1
        }

        fn create_resource(&self) -> bool {
            true
        }

        fn current_buffer(&self) -> Option<NativeBufferId> {
            Some(7)
        }

        fn plane(&self, _index: u32) -> BackendResult<PlaneLayout> {
            Ok(PlaneLayout {
                fd: self.file.as_raw_fd(),
                size: 4096,
                offset: 0,
            })
        }

        fn ref_plane_allocation(&self, _index: u32) {
            self.plane_refs.fetch_add(1, Ordering::SeqCst);
        }

        fn unref_plane_allocation(&self, _index: u32) {
            self.plane_refs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn test_double_initialize_is_fatal() {
        let (_driver, mut controller) = controller();
        controller.initialize();
    }

    #[test]
    fn test_compatible_create_recycles_discarded_texture() {
        let (driver, mut controller) = controller();
        let first = controller.create_texture(rgba_texture(256), None).unwrap();
        controller.process_create_queues();
        let original = controller.textures[first].image().unwrap();
        let allocated = driver.live_objects();

        controller.discard_texture(first);
        let second = controller
            .create_texture(rgba_texture(256), Some(first))
            .unwrap();
        controller.process_create_queues();

        assert_eq!(controller.textures[second].image(), Some(original));
        assert!(controller.textures.get(first).is_none());
        assert!(controller.is_discard_queue_empty());
        assert_eq!(driver.live_objects(), allocated);
    }

    #[test]
    fn test_incompatible_recycle_falls_back_to_fresh_allocation() {
        let (_driver, mut controller) = controller();
        let first = controller.create_texture(rgba_texture(256), None).unwrap();
        controller.process_create_queues();
        let original = controller.textures[first].image().unwrap();

        controller.discard_texture(first);
        let second = controller
            .create_texture(rgba_texture(512), Some(first))
            .unwrap();
        controller.process_create_queues();

        assert_ne!(controller.textures[second].image(), Some(original));
        assert_eq!(controller.textures[first].image(), Some(original));
        assert!(!controller.is_discard_queue_empty());

        controller.process_discard_queues();
        assert!(controller.textures.get(first).is_none());
        assert!(controller.textures.get(second).is_some());
    }

    #[test]
    fn test_buffer_recycle_reuses_driver_object() {
        let (_driver, mut controller) = controller();
        let info = BufferCreateInfo {
            size: 1024,
            usage: BufferUsageFlags::VERTEX_BUFFER,
            cpu_accessible: false,
        };
        let first = controller.create_buffer(info, None);
        controller.process_create_queues();
        let original = controller.buffers[first].buffer().unwrap();

        controller.discard_buffer(first);
        let second = controller.create_buffer(info, Some(first));
        controller.process_create_queues();

        assert_eq!(controller.buffers[second].buffer(), Some(original));
        assert!(controller.buffers.get(first).is_none());
        assert!(controller.is_discard_queue_empty());
    }

    #[test]
    fn test_submission_replays_only_at_flush() {
        let (driver, mut controller) = controller();
        let scene = offscreen_scene(&mut controller);

        let cb = controller.create_command_buffer(&CommandBufferCreateInfo::default(), None);
        {
            let buffer = controller.command_buffer_mut(cb).unwrap();
            buffer.begin(CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            buffer.begin_render_pass(
                scene.render_pass,
                scene.render_target,
                Rect2D::new(0, 0, 64, 64),
                vec![ClearValue::Color([0.0; 4])],
            );
            buffer.bind_pipeline(scene.pipeline);
            buffer.draw(3, 1, 0, 0);
            buffer.end_render_pass();
            buffer.end();
        }

        controller
            .submit_command_buffers(SubmitInfo {
                command_buffers: vec![cb],
                flags: SubmitFlags::empty(),
            })
            .unwrap();
        assert!(driver.timeline().is_empty());

        controller
            .submit_command_buffers(SubmitInfo {
                command_buffers: Vec::new(),
                flags: SubmitFlags::FLUSH,
            })
            .unwrap();

        let timeline = driver.timeline();
        let Some(TimelineEvent::Submission { ops, fence }) = timeline.first() else {
            panic!("expected a fenced submission, got {timeline:?}");
        };
        assert!(*fence);
        assert!(matches!(ops.first(), Some(RecordedOp::BeginRenderPass { .. })));
        assert!(ops.iter().any(|op| matches!(op, RecordedOp::BindPipeline(_))));
        assert!(ops
            .iter()
            .any(|op| matches!(op, RecordedOp::Draw { vertex_count: 3, .. })));
        assert!(matches!(ops.last(), Some(RecordedOp::EndRenderPass)));
        assert!(timeline
            .iter()
            .any(|event| matches!(event, TimelineEvent::FenceWait)));
    }

    #[test]
    fn test_dynamic_depth_states_compile_separate_variants() {
        let (driver, mut controller) = controller();
        let scene = offscreen_scene(&mut controller);

        let cb = controller.create_command_buffer(&CommandBufferCreateInfo::default(), None);
        {
            let buffer = controller.command_buffer_mut(cb).unwrap();
            buffer.begin(CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            buffer.begin_render_pass(
                scene.render_pass,
                scene.render_target,
                Rect2D::new(0, 0, 64, 64),
                vec![ClearValue::Color([0.0; 4])],
            );
            buffer.bind_pipeline(scene.pipeline);
            buffer.set_depth_test_enable(true);
            buffer.draw(3, 1, 0, 0);
            buffer.set_depth_test_enable(false);
            buffer.draw(3, 1, 0, 0);
            buffer.set_depth_test_enable(true);
            buffer.draw(3, 1, 0, 0);
            buffer.end_render_pass();
            buffer.end();
        }
        controller
            .submit_command_buffers(SubmitInfo {
                command_buffers: vec![cb],
                flags: SubmitFlags::FLUSH,
            })
            .unwrap();

        assert_eq!(controller.pipelines[scene.pipeline].variant_count(), 2);
        let natives: Vec<_> = submission_ops(&driver)
            .into_iter()
            .filter_map(|op| match op {
                RecordedOp::BindPipeline(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(natives.len(), 3);
        assert_eq!(natives[0], natives[2]);
        assert_ne!(natives[0], natives[1]);
    }

    #[test]
    fn test_secondary_buffers_replay_inline() {
        let (driver, mut controller) = controller();
        let scene = offscreen_scene(&mut controller);

        let secondary = controller.create_command_buffer(
            &CommandBufferCreateInfo {
                level: CommandBufferLevel::Secondary,
                fixed_capacity: None,
            },
            None,
        );
        {
            let buffer = controller.command_buffer_mut(secondary).unwrap();
            buffer.begin(CommandBufferUsageFlags::RENDER_PASS_CONTINUE);
            buffer.bind_pipeline(scene.pipeline);
            buffer.draw(6, 1, 0, 0);
            buffer.end();
        }
        let primary = controller.create_command_buffer(&CommandBufferCreateInfo::default(), None);
        {
            let buffer = controller.command_buffer_mut(primary).unwrap();
            buffer.begin(CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            buffer.begin_render_pass(
                scene.render_pass,
                scene.render_target,
                Rect2D::new(0, 0, 64, 64),
                vec![ClearValue::Color([0.0; 4])],
            );
            buffer.execute_command_buffers(vec![secondary]);
            buffer.end_render_pass();
            buffer.end();
        }
        controller
            .submit_command_buffers(SubmitInfo {
                command_buffers: vec![primary],
                flags: SubmitFlags::FLUSH,
            })
            .unwrap();

        assert!(submission_ops(&driver)
            .iter()
            .any(|op| matches!(op, RecordedOp::Draw { vertex_count: 6, .. })));
    }

    #[test]
    fn test_present_reuses_one_pooled_buffer() {
        let (driver, mut controller) = controller();
        let window = Arc::new(FakeWindow::default());
        let target = controller
            .create_render_target(
                RenderTargetCreateInfo {
                    surface: Some(window.clone() as Arc<dyn RenderSurface>),
                    framebuffer: None,
                    extent: Extent2D {
                        width: 320,
                        height: 240,
                    },
                },
                None,
            )
            .unwrap();

        controller.present_render_target(target).unwrap();
        controller.present_render_target(target).unwrap();

        assert_eq!(window.swaps.load(Ordering::SeqCst), 2);
        assert_eq!(controller.present_pool.total(), 1);
        assert_eq!(controller.command_buffers.len(), 1);
        let submissions = driver
            .timeline()
            .iter()
            .filter(|event| matches!(event, TimelineEvent::Submission { .. }))
            .count();
        assert_eq!(submissions, 2);
    }

    #[test]
    fn test_update_textures_flushes_implicitly_past_threshold() {
        let (driver, mut controller) = controller();
        let texture = controller.create_texture(rgba_texture(512), None).unwrap();

        controller
            .update_textures(
                vec![full_texture_update(texture, 64)],
                vec![UpdateSource::Memory(vec![0u8; 64 * 64 * 4])],
            )
            .unwrap();
        assert!(driver.timeline().is_empty());
        assert_eq!(controller.pending_updates.len(), 1);

        controller
            .update_textures(
                vec![full_texture_update(texture, 512)],
                vec![UpdateSource::Memory(vec![0xab; 512 * 512 * 4])],
            )
            .unwrap();

        assert!(driver
            .timeline()
            .iter()
            .any(|event| matches!(event, TimelineEvent::Submission { .. })));
        assert!(controller.pending_updates.is_empty());
        assert_eq!(controller.pending_update_bytes, 0);
    }

    #[test]
    fn test_update_sources_rebase_across_calls() {
        let (driver, mut controller) = controller();
        let texture = controller.create_texture(rgba_texture(64), None).unwrap();

        controller
            .update_textures(
                vec![full_texture_update(texture, 64)],
                vec![UpdateSource::Memory(vec![0x11; 64 * 64 * 4])],
            )
            .unwrap();
        controller
            .update_textures(
                vec![full_texture_update(texture, 64)],
                vec![UpdateSource::Memory(vec![0x22; 64 * 64 * 4])],
            )
            .unwrap();
        assert_eq!(controller.pending_updates[1].src_reference, 1);

        controller
            .submit_command_buffers(SubmitInfo {
                command_buffers: Vec::new(),
                flags: SubmitFlags::FLUSH,
            })
            .unwrap();

        let image = controller.textures[texture].image().unwrap();
        // The later update wins the overlap.
        assert_eq!(driver.image_bytes(image).map(|b| b[0]), Some(0x22));
    }

    #[test]
    fn test_mipmap_generation_blits_after_updates() {
        let (driver, mut controller) = controller();
        let texture = controller
            .create_texture(
                TextureCreateInfo {
                    mip_levels: 0,
                    ..rgba_texture(64)
                },
                None,
            )
            .unwrap();

        controller
            .update_textures(
                vec![full_texture_update(texture, 64)],
                vec![UpdateSource::Memory(vec![0x55; 64 * 64 * 4])],
            )
            .unwrap();
        controller.generate_texture_mipmaps(texture).unwrap();
        controller
            .submit_command_buffers(SubmitInfo {
                command_buffers: Vec::new(),
                flags: SubmitFlags::FLUSH,
            })
            .unwrap();

        let timeline = driver.timeline();
        let copy_index = timeline.iter().position(|event| {
            matches!(event, TimelineEvent::Submission { ops, .. }
                if ops.iter().any(|op| matches!(op, RecordedOp::CopyBufferToImage { .. })))
        });
        let blit_index = timeline.iter().position(|event| {
            matches!(event, TimelineEvent::Submission { ops, .. }
                if ops.iter().any(|op| matches!(op, RecordedOp::Blit { .. })))
        });
        assert!(copy_index.unwrap() < blit_index.unwrap());

        let blits = submission_ops(&driver)
            .iter()
            .filter(|op| matches!(op, RecordedOp::Blit { .. }))
            .count();
        // 64x64 expands to seven levels; each level below the base blits
        // from its predecessor.
        assert_eq!(blits, 6);
    }

    #[test]
    fn test_native_texture_imports_in_create_queue_drain() {
        let (driver, mut controller) = controller();
        let pixmap = Arc::new(FakePixmap::new());
        let texture = controller
            .create_texture(
                TextureCreateInfo {
                    native_image: Some(pixmap.clone() as Arc<dyn NativeImageSource>),
                    ..TextureCreateInfo::default()
                },
                None,
            )
            .unwrap();
        assert!(controller.textures[texture].image().is_none());

        controller.process_create_queues();
        let image = controller.textures[texture].image().unwrap();
        assert_eq!(driver.bound_planes(image), Some(1));
        assert_eq!(driver.imported_fds().len(), 1);

        controller.discard_texture(texture);
        controller.process_discard_queues();
        assert_eq!(driver.live_objects(), 0);
        assert!(pixmap.balanced());
    }

    #[test]
    fn test_shared_pixel_data_released_after_upload() {
        let (driver, mut controller) = controller();
        let texture = controller.create_texture(rgba_texture(16), None).unwrap();

        let data = PixelData::new(vec![0x7f; 16 * 16 * 4], 16, 16, Format::R8G8B8A8Unorm, 0);
        controller
            .update_textures(
                vec![full_texture_update(texture, 16)],
                vec![UpdateSource::PixelData {
                    data: data.clone(),
                    release_after_upload: true,
                }],
            )
            .unwrap();
        assert!(!data.is_released());

        controller
            .submit_command_buffers(SubmitInfo {
                command_buffers: Vec::new(),
                flags: SubmitFlags::FLUSH,
            })
            .unwrap();

        assert!(data.is_released());
        let image = controller.textures[texture].image().unwrap();
        assert_eq!(driver.image_bytes(image).unwrap()[0], 0x7f);
    }

    #[test]
    fn test_shutdown_flushes_saves_and_destroys_everything() {
        let driver = Arc::new(RecordingDriver::new());
        let path = std::env::temp_dir().join(format!(
            "render_backend_controller_{}.bin",
            std::process::id()
        ));
        let settings = BackendSettings {
            transfer_workers: 0,
            enable_pipeline_cache: true,
            pipeline_cache_path: Some(path.clone()),
            ..BackendSettings::default()
        };
        let mut controller = GraphicsController::new(driver.clone(), settings);
        controller.initialize();

        let _scene = offscreen_scene(&mut controller);
        let extra = controller.create_texture(rgba_texture(16), None).unwrap();
        controller.discard_texture(extra);

        controller.shutdown();
        assert!(controller.is_discard_queue_empty());
        assert_eq!(driver.live_objects(), 0);
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);

        // A shut-down controller may be brought up again.
        controller.initialize();
        controller.shutdown();
    }

    #[test]
    fn test_resume_requests_one_draw() {
        let (_driver, mut controller) = controller();
        assert!(!controller.is_draw_on_resume_required());

        controller.pause();
        assert!(controller.is_paused());
        controller.resume();
        assert!(!controller.is_paused());
        assert!(controller.is_draw_on_resume_required());

        controller.frame_start();
        assert!(!controller.is_draw_on_resume_required());
    }

    #[test]
    fn test_texture_properties_report_emulated_storage() {
        let (driver, mut controller) = controller();
        driver.set_format_supported(Format::R8G8B8Unorm, false);
        let texture = controller
            .create_texture(
                TextureCreateInfo {
                    format: Format::R8G8B8Unorm,
                    ..rgba_texture(64)
                },
                None,
            )
            .unwrap();

        let properties = controller.get_texture_properties(texture).unwrap();
        assert!(properties.emulated);
        assert_eq!(properties.format, Format::R8G8B8Unorm);
        assert_eq!(properties.storage_format, Format::R8G8B8A8Unorm);
    }

    #[test]
    fn test_pipeline_equals_compares_owned_state() {
        let (_driver, mut controller) = controller();
        let scene = offscreen_scene(&mut controller);
        let info = PipelineCreateInfo {
            program: scene.program,
            vertex_input_state: None,
            input_assembly_state: None,
            rasterization_state: None,
            viewport_state: None,
            depth_stencil_state: None,
            color_blend_state: None,
            multisample_state: None,
            render_target: scene.render_target,
        };

        let twin = controller.create_pipeline(&info, None).unwrap();
        assert!(controller.pipeline_equals(scene.pipeline, twin));

        let depth = DepthStencilState {
            depth_test_enable: true,
            ..DepthStencilState::default()
        };
        let other = controller
            .create_pipeline(
                &PipelineCreateInfo {
                    depth_stencil_state: Some(&depth),
                    ..info
                },
                None,
            )
            .unwrap();
        assert!(!controller.pipeline_equals(scene.pipeline, other));
    }

    #[test]
    fn test_mapped_buffer_guard_unmaps_on_drop() {
        let (driver, mut controller) = controller();
        let buffer = controller.create_buffer(
            BufferCreateInfo {
                size: 256,
                usage: BufferUsageFlags::UNIFORM_BUFFER,
                cpu_accessible: true,
            },
            None,
        );

        {
            let mut mapping = controller.map_buffer_range(buffer, 64, 128).unwrap();
            assert_eq!(mapping.len(), 128);
            mapping.write(0, &[1, 2, 3, 4]);
        }

        let id = controller.buffers[buffer].buffer().unwrap();
        assert_eq!(&driver.buffer_bytes(id).unwrap()[64..68], &[1, 2, 3, 4]);

        // A fresh mapping after the guard dropped must succeed.
        let mapping = controller.map_buffer_range(buffer, 0, 16).unwrap();
        assert!(!mapping.as_mut_ptr().is_null());
        mapping.unmap();
    }

    #[test]
    fn test_map_rejects_out_of_range_and_device_local() {
        let (_driver, mut controller) = controller();
        let local = controller.create_buffer(
            BufferCreateInfo {
                size: 64,
                usage: BufferUsageFlags::VERTEX_BUFFER,
                cpu_accessible: false,
            },
            None,
        );
        assert!(controller.map_buffer_range(local, 0, 16).is_err());

        let visible = controller.create_buffer(
            BufferCreateInfo {
                size: 64,
                usage: BufferUsageFlags::UNIFORM_BUFFER,
                cpu_accessible: true,
            },
            None,
        );
        assert!(controller.map_buffer_range(visible, 32, 64).is_err());
    }

    #[test]
    fn test_sync_object_signals_at_flush() {
        let (_driver, mut controller) = controller();
        let sync = controller
            .create_sync_object(SyncObjectCreateInfo, None)
            .unwrap();

        controller
            .submit_command_buffers(SubmitInfo {
                command_buffers: Vec::new(),
                flags: SubmitFlags::FLUSH,
            })
            .unwrap();

        controller.sync_objects[sync]
            .wait(controller.driver.as_ref())
            .unwrap();
    }

    #[test]
    fn test_surface_pipeline_bakes_against_controller_pass() {
        let (_driver, mut controller) = controller();
        let window = Arc::new(FakeWindow::default());
        let target = controller
            .create_render_target(
                RenderTargetCreateInfo {
                    surface: Some(window as Arc<dyn RenderSurface>),
                    framebuffer: None,
                    extent: Extent2D {
                        width: 320,
                        height: 240,
                    },
                },
                None,
            )
            .unwrap();
        let program = linked_program(&mut controller);
        let depth = DepthStencilState::default();

        let pipeline = controller
            .create_pipeline(
                &PipelineCreateInfo {
                    program,
                    vertex_input_state: None,
                    input_assembly_state: None,
                    rasterization_state: None,
                    viewport_state: None,
                    depth_stencil_state: Some(&depth),
                    color_blend_state: None,
                    multisample_state: None,
                    render_target: target,
                },
                None,
            )
            .unwrap();

        assert_eq!(controller.surface_passes.len(), 1);
        // Static depth/stencil compiles its single variant eagerly against
        // the controller-owned pass.
        assert_eq!(controller.pipelines[pipeline].variant_count(), 1);
    }
}
