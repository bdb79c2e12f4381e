//! Replay of recorded command buffers into native encoders.

use slotmap::SlotMap;

use crate::api::handles::{
    BufferHandle, CommandBufferHandle, FramebufferHandle, PipelineHandle, RenderPassHandle,
    RenderTargetHandle, SamplerHandle, TextureHandle,
};
use crate::api::info::CommandBufferLevel;
use crate::api::state::DepthStencilState;
use crate::api::types::{ClearValue, Offset2D, Rect2D, Viewport};
use crate::command::{Command, CommandBuffer, RecordingState, TextureBinding};
use crate::driver::{
    BufferId, CommandEncoder, FramebufferId, GpuDriver, PipelineId, RenderPassId,
    UniformBufferBinding,
};
use crate::error::{BackendError, BackendResult};
use crate::pipeline::{PipelineCacheManager, PipelineResource};
use crate::resources::{
    BufferResource, FramebufferResource, RenderPassResource, RenderTargetResource,
    SamplerResource, TextureResource,
};

/// Controller state the replay pass reads and updates.
///
/// Split field borrows let pipeline variants compile mid-replay while the
/// rest of the resource maps stay readable.
pub(super) struct ReplayEnv<'a> {
    pub driver: &'a dyn GpuDriver,
    pub textures: &'a SlotMap<TextureHandle, TextureResource>,
    pub buffers: &'a SlotMap<BufferHandle, BufferResource>,
    pub samplers: &'a SlotMap<SamplerHandle, SamplerResource>,
    pub pipelines: &'a mut SlotMap<PipelineHandle, PipelineResource>,
    pub render_passes: &'a SlotMap<RenderPassHandle, RenderPassResource>,
    pub render_targets: &'a SlotMap<RenderTargetHandle, RenderTargetResource>,
    pub framebuffers: &'a SlotMap<FramebufferHandle, FramebufferResource>,
    pub cache: &'a mut PipelineCacheManager,
}

/// One open render pass scope during replay.
struct PassScope {
    render_pass: RenderPassHandle,
    render_pass_id: RenderPassId,
    /// Target height when rendering to a surface; viewport space flips.
    surface_height: Option<u32>,
}

/// Walks recorded command logs and drives a native encoder.
///
/// Pipeline binds are deferred to the first draw that needs them so the
/// accumulated depth/stencil commands select the variant. Presents are
/// collected and executed by the controller after the submission's fence
/// signals.
pub(super) struct Replayer {
    scope: Option<PassScope>,
    depth_stencil: DepthStencilState,
    bound: Option<PipelineHandle>,
    bound_native: Option<PipelineId>,
    pipeline_dirty: bool,
    presents: Vec<RenderTargetHandle>,
    replayed: u32,
}

impl Replayer {
    pub(super) fn new() -> Self {
        Replayer {
            scope: None,
            depth_stencil: DepthStencilState::default(),
            bound: None,
            bound_native: None,
            pipeline_dirty: false,
            presents: Vec::new(),
            replayed: 0,
        }
    }

    /// Targets whose presents were recorded, in replay order.
    pub(super) fn take_presents(&mut self) -> Vec<RenderTargetHandle> {
        std::mem::take(&mut self.presents)
    }

    /// Commands walked so far.
    pub(super) fn replayed_commands(&self) -> u32 {
        self.replayed
    }

    /// A submission that ends inside a render pass is malformed.
    pub(super) fn assert_passes_closed(&self) {
        debug_assert!(self.scope.is_none(), "submission left a render pass open");
    }

    /// Replays one submitted primary buffer.
    pub(super) fn replay_buffer(
        &mut self,
        env: &mut ReplayEnv<'_>,
        command_buffers: &SlotMap<CommandBufferHandle, CommandBuffer>,
        encoder: &mut dyn CommandEncoder,
        handle: CommandBufferHandle,
    ) -> BackendResult<()> {
        let Some(buffer) = command_buffers.get(handle) else {
            debug_assert!(false, "replaying a discarded command buffer");
            return Err(BackendError::StaleHandle { kind: "command buffer" });
        };
        debug_assert_eq!(buffer.level(), CommandBufferLevel::Primary);
        debug_assert_eq!(buffer.state(), RecordingState::Executable);
        self.replay_commands(env, command_buffers, encoder, buffer.commands())
    }

    fn replay_commands(
        &mut self,
        env: &mut ReplayEnv<'_>,
        command_buffers: &SlotMap<CommandBufferHandle, CommandBuffer>,
        encoder: &mut dyn CommandEncoder,
        commands: &[Command],
    ) -> BackendResult<()> {
        for command in commands {
            self.replayed += 1;
            match command {
                Command::Begin { .. } | Command::End => {}
                Command::BeginRenderPass {
                    render_pass,
                    render_target,
                    render_area,
                    clear_values,
                } => {
                    self.begin_pass(
                        env,
                        encoder,
                        *render_pass,
                        *render_target,
                        *render_area,
                        clear_values,
                    )?;
                }
                Command::EndRenderPass => {
                    debug_assert!(self.scope.is_some(), "render pass ended twice");
                    self.scope = None;
                    self.bound_native = None;
                    self.pipeline_dirty = self.bound.is_some();
                    encoder.end_render_pass()?;
                }
                Command::ExecuteCommandBuffers { buffers } => {
                    for &secondary in buffers {
                        let Some(buffer) = command_buffers.get(secondary) else {
                            debug_assert!(false, "executing a discarded command buffer");
                            return Err(BackendError::StaleHandle {
                                kind: "command buffer",
                            });
                        };
                        debug_assert_eq!(buffer.level(), CommandBufferLevel::Secondary);
                        self.replay_commands(env, command_buffers, encoder, buffer.commands())?;
                    }
                }
                Command::BindVertexBuffers {
                    first_binding,
                    buffers,
                } => {
                    let mut resolved = Vec::with_capacity(buffers.len());
                    for (handle, offset) in buffers {
                        resolved.push((resolve_buffer(env, *handle)?, u64::from(*offset)));
                    }
                    encoder.bind_vertex_buffers(*first_binding, &resolved)?;
                }
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    format,
                } => {
                    let buffer = resolve_buffer(env, *buffer)?;
                    encoder.bind_index_buffer(buffer, u64::from(*offset), *format)?;
                }
                Command::BindUniformBuffers { bindings } => {
                    let mut resolved = Vec::with_capacity(bindings.len());
                    for binding in bindings {
                        resolved.push(UniformBufferBinding {
                            binding: binding.binding,
                            buffer: resolve_buffer(env, binding.buffer)?,
                            offset: u64::from(binding.offset),
                            range: u64::from(binding.range),
                        });
                    }
                    encoder.bind_uniform_buffers(&resolved)?;
                }
                Command::BindTextures { bindings } => {
                    for binding in bindings {
                        bind_texture(env, encoder, binding)?;
                    }
                }
                Command::BindSamplers { bindings } => {
                    for binding in bindings {
                        let Some(resource) = env.samplers.get(binding.sampler) else {
                            debug_assert!(false, "binding a discarded sampler");
                            return Err(BackendError::StaleHandle { kind: "sampler" });
                        };
                        let Some(sampler) = resource.sampler() else {
                            continue;
                        };
                        encoder.bind_sampler(binding.binding, sampler)?;
                    }
                }
                Command::BindPipeline { pipeline } => {
                    self.bound = Some(*pipeline);
                    self.pipeline_dirty = true;
                }
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => {
                    self.resolve_pipeline(env, encoder)?;
                    encoder.draw(*vertex_count, *instance_count, *first_vertex, *first_instance)?;
                }
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => {
                    self.resolve_pipeline(env, encoder)?;
                    encoder.draw_indexed(
                        *index_count,
                        *instance_count,
                        *first_index,
                        *vertex_offset,
                        *first_instance,
                    )?;
                }
                Command::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => {
                    let buffer = resolve_buffer(env, *buffer)?;
                    self.resolve_pipeline(env, encoder)?;
                    encoder.draw_indexed_indirect(
                        buffer,
                        u64::from(*offset),
                        *draw_count,
                        *stride,
                    )?;
                }
                Command::DrawNative => {
                    // Externally driven drawing belongs to the windowing
                    // integration; the marker carries no replayable state.
                    log::warn!("native draw skipped during replay");
                }
                Command::SetScissor { region } => encoder.set_scissor(*region)?,
                Command::SetScissorTestEnable { .. } => {
                    // Recording hint only; scissor rectangles are always
                    // honored natively.
                }
                Command::SetViewport { region } => {
                    encoder.set_viewport(self.oriented_viewport(*region))?;
                }
                Command::SetStencilTestEnable { enable } => {
                    self.depth_stencil.stencil_test_enable = *enable;
                    self.pipeline_dirty = true;
                    encoder.set_stencil_test_enable(*enable)?;
                }
                Command::SetStencilWriteMask { mask } => {
                    self.depth_stencil.front.write_mask = *mask;
                    self.depth_stencil.back.write_mask = *mask;
                    self.pipeline_dirty = true;
                    encoder.set_stencil_write_mask(*mask)?;
                }
                Command::SetStencilState {
                    compare_op,
                    reference,
                    compare_mask,
                    fail_op,
                    pass_op,
                    depth_fail_op,
                } => {
                    for face in [&mut self.depth_stencil.front, &mut self.depth_stencil.back] {
                        face.compare_op = *compare_op;
                        face.reference = *reference;
                        face.compare_mask = *compare_mask;
                        face.fail_op = *fail_op;
                        face.pass_op = *pass_op;
                        face.depth_fail_op = *depth_fail_op;
                    }
                    self.pipeline_dirty = true;
                    encoder.set_stencil_state(
                        *compare_op,
                        *reference,
                        *compare_mask,
                        *fail_op,
                        *pass_op,
                        *depth_fail_op,
                    )?;
                }
                Command::SetDepthCompareOp { op } => {
                    self.depth_stencil.depth_compare_op = *op;
                    self.pipeline_dirty = true;
                    encoder.set_depth_compare_op(*op)?;
                }
                Command::SetDepthTestEnable { enable } => {
                    self.depth_stencil.depth_test_enable = *enable;
                    self.pipeline_dirty = true;
                    encoder.set_depth_test_enable(*enable)?;
                }
                Command::SetDepthWriteEnable { enable } => {
                    self.depth_stencil.depth_write_enable = *enable;
                    self.pipeline_dirty = true;
                    encoder.set_depth_write_enable(*enable)?;
                }
                Command::SetColorMask { enable } => encoder.set_color_mask(*enable)?,
                Command::SetColorBlendEnable { enable } => {
                    encoder.set_color_blend_enable(*enable)?;
                }
                Command::SetColorBlendEquation { equation } => {
                    encoder.set_color_blend_equation(*equation)?;
                }
                Command::SetColorBlendAdvanced {
                    src_premultiplied,
                    dst_premultiplied,
                    blend_op,
                } => {
                    encoder.set_color_blend_advanced(
                        *src_premultiplied,
                        *dst_premultiplied,
                        *blend_op,
                    )?;
                }
                Command::Present { target } => {
                    debug_assert!(self.scope.is_none(), "present recorded inside a render pass");
                    self.presents.push(*target);
                }
            }
        }
        Ok(())
    }

    fn begin_pass(
        &mut self,
        env: &mut ReplayEnv<'_>,
        encoder: &mut dyn CommandEncoder,
        render_pass: RenderPassHandle,
        render_target: RenderTargetHandle,
        render_area: Rect2D,
        clear_values: &[ClearValue],
    ) -> BackendResult<()> {
        debug_assert!(self.scope.is_none(), "render pass opened inside another pass");
        let Some(pass) = env.render_passes.get(render_pass) else {
            debug_assert!(false, "replaying against a discarded render pass");
            return Err(BackendError::StaleHandle { kind: "render pass" });
        };
        let pass_id = pass
            .render_pass()
            .ok_or(BackendError::StaleHandle { kind: "render pass" })?;
        let Some(target) = env.render_targets.get(render_target) else {
            debug_assert!(false, "replaying against a discarded render target");
            return Err(BackendError::StaleHandle { kind: "render target" });
        };

        let (framebuffer, surface_height) = resolve_target(env, target, pass_id)?;
        encoder.begin_render_pass(pass_id, framebuffer, render_area, clear_values)?;
        self.scope = Some(PassScope {
            render_pass,
            render_pass_id: pass_id,
            surface_height,
        });
        self.bound_native = None;
        self.pipeline_dirty = self.bound.is_some();

        // Every pass starts from known dynamic state: tests and depth
        // writes off, viewport and scissor covering the whole target.
        self.depth_stencil = DepthStencilState::default();
        encoder.set_depth_test_enable(false)?;
        encoder.set_depth_write_enable(false)?;
        encoder.set_stencil_test_enable(false)?;
        let extent = target.extent();
        encoder.set_viewport(self.oriented_viewport(Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }))?;
        encoder.set_scissor(Rect2D {
            offset: Offset2D::default(),
            extent,
        })?;
        Ok(())
    }

    /// Compiles and binds the pipeline variant for the accumulated
    /// depth/stencil state, if a draw actually needs a new one.
    fn resolve_pipeline(
        &mut self,
        env: &mut ReplayEnv<'_>,
        encoder: &mut dyn CommandEncoder,
    ) -> BackendResult<()> {
        if !self.pipeline_dirty {
            return Ok(());
        }
        let Some(handle) = self.bound else {
            debug_assert!(false, "draw recorded without a bound pipeline");
            return Err(BackendError::invalid("draw recorded without a bound pipeline"));
        };
        let Some(scope) = self.scope.as_ref() else {
            debug_assert!(false, "draw recorded outside a render pass");
            return Err(BackendError::invalid("draw recorded outside a render pass"));
        };

        let driver = env.driver;
        let render_passes = env.render_passes;
        let current = render_passes.get(scope.render_pass);
        let Some(pipeline) = env.pipelines.get_mut(handle) else {
            debug_assert!(false, "drawing with a discarded pipeline");
            return Err(BackendError::StaleHandle { kind: "pipeline" });
        };
        let native = pipeline.native_for(
            &self.depth_stencil,
            scope.render_pass,
            scope.render_pass_id,
            |candidate| match (current, render_passes.get(candidate)) {
                (Some(current), Some(candidate)) => current.is_compatible_with(candidate),
                _ => false,
            },
            driver,
            env.cache,
        )?;
        if self.bound_native != Some(native) {
            encoder.bind_pipeline(native)?;
            self.bound_native = Some(native);
        }
        self.pipeline_dirty = false;
        Ok(())
    }

    fn oriented_viewport(&self, region: Viewport) -> Viewport {
        match self.scope.as_ref().and_then(|scope| scope.surface_height) {
            Some(height) => flip_viewport(region, height),
            None => region,
        }
    }
}

/// Resolves where a pass renders: surface targets borrow the driver's
/// per-swapchain-image framebuffer, offscreen targets use their own.
fn resolve_target(
    env: &ReplayEnv<'_>,
    target: &RenderTargetResource,
    render_pass: RenderPassId,
) -> BackendResult<(FramebufferId, Option<u32>)> {
    if let Some(surface) = target.surface_id() {
        let framebuffer = env.driver.surface_framebuffer(surface, render_pass)?;
        return Ok((framebuffer, Some(target.extent().height)));
    }
    if let Some(handle) = target.framebuffer() {
        let resource = env
            .framebuffers
            .get(handle)
            .ok_or(BackendError::StaleHandle { kind: "framebuffer" })?;
        let framebuffer = resource
            .framebuffer()
            .ok_or_else(|| BackendError::invalid("framebuffer replayed before its create queue drained"))?;
        return Ok((framebuffer, None));
    }
    debug_assert!(false, "render target has neither surface nor framebuffer");
    Err(BackendError::invalid(
        "render target has neither surface nor framebuffer",
    ))
}

fn bind_texture(
    env: &ReplayEnv<'_>,
    encoder: &mut dyn CommandEncoder,
    binding: &TextureBinding,
) -> BackendResult<()> {
    let Some(texture) = env.textures.get(binding.texture) else {
        debug_assert!(false, "binding a discarded texture");
        return Err(BackendError::StaleHandle { kind: "texture" });
    };
    let Some(view) = texture.view() else {
        // A texture whose creation or import failed stays empty; the bind
        // is dropped and the target shows nothing for it.
        log::warn!("skipping bind of a texture with no backing image");
        return Ok(());
    };
    // Imported luma/chroma content must sample through its own
    // conversion-chained sampler.
    let native_sampler = texture.native_state().and_then(|n| n.sampler());
    let sampler = match native_sampler {
        Some(native) => Some(native),
        None => match binding.sampler {
            Some(handle) => {
                let Some(resource) = env.samplers.get(handle) else {
                    debug_assert!(false, "binding a discarded sampler");
                    return Err(BackendError::StaleHandle { kind: "sampler" });
                };
                resource.sampler()
            }
            None => None,
        },
    };
    encoder.bind_texture(binding.binding, view, sampler)
}

fn resolve_buffer(env: &ReplayEnv<'_>, handle: BufferHandle) -> BackendResult<BufferId> {
    let Some(resource) = env.buffers.get(handle) else {
        debug_assert!(false, "command references a discarded buffer");
        return Err(BackendError::StaleHandle { kind: "buffer" });
    };
    resource
        .buffer()
        .ok_or_else(|| BackendError::invalid("buffer replayed before its create queue drained"))
}

/// Flips a viewport into surface orientation. Native clip space puts Y
/// down while the rendering core records Y up; a negative height flips
/// back without touching geometry. Scissors stay unflipped.
fn flip_viewport(region: Viewport, surface_height: u32) -> Viewport {
    Viewport {
        x: region.x,
        y: surface_height as f32 - region.y,
        width: region.width,
        height: -region.height,
        min_depth: region.min_depth,
        max_depth: region.max_depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_surface_viewport_flips_y_and_height() {
        let flipped = flip_viewport(
            Viewport {
                x: 10.0,
                y: 20.0,
                width: 300.0,
                height: 200.0,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            480,
        );

        assert_relative_eq!(flipped.x, 10.0);
        assert_relative_eq!(flipped.y, 460.0);
        assert_relative_eq!(flipped.width, 300.0);
        assert_relative_eq!(flipped.height, -200.0);
        assert_relative_eq!(flipped.min_depth, 0.0);
        assert_relative_eq!(flipped.max_depth, 1.0);
    }

    #[test]
    fn test_full_target_viewport_flip_is_involutive() {
        let region = Viewport {
            x: 0.0,
            y: 0.0,
            width: 640.0,
            height: 480.0,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let once = flip_viewport(region, 480);
        assert_relative_eq!(once.y, 480.0);
        assert_relative_eq!(once.height, -480.0);

        let twice = flip_viewport(once, 480);
        assert_relative_eq!(twice.y, region.y);
        assert_relative_eq!(twice.height, region.height);
    }
}
