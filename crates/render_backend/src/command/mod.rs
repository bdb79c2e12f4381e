//! Client-side command recording.
//!
//! A [`CommandBuffer`] is an append-only log of tagged records. Nothing
//! touches the device during recording; the controller replays the log into
//! a native encoder at submission time.

use crate::api::handles::{
    BufferHandle, CommandBufferHandle, PipelineHandle, RenderPassHandle, RenderTargetHandle,
    SamplerHandle, TextureHandle,
};
use crate::api::info::CommandBufferLevel;
use crate::api::types::{
    BlendEquation, BlendOp, ClearValue, CommandBufferUsageFlags, CompareOp, IndexFormat, Rect2D,
    StencilOp, Viewport,
};

/// A texture bound at a descriptor binding, with an optional paired sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBinding {
    /// Descriptor binding index.
    pub binding: u32,
    /// Bound texture.
    pub texture: TextureHandle,
    /// Sampler paired with the texture; the texture's default applies when
    /// absent.
    pub sampler: Option<SamplerHandle>,
}

/// A standalone sampler bound at a descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerBinding {
    /// Descriptor binding index.
    pub binding: u32,
    /// Bound sampler.
    pub sampler: SamplerHandle,
}

/// A uniform buffer slice bound at a descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    /// Descriptor binding index.
    pub binding: u32,
    /// Bound buffer.
    pub buffer: BufferHandle,
    /// Byte offset of the slice.
    pub offset: u32,
    /// Byte length of the slice.
    pub range: u32,
}

/// One tagged record in a command buffer.
#[derive(Debug, Clone)]
pub enum Command {
    /// Recording started; carries the usage hints.
    Begin {
        /// Usage hints for this recording.
        usage: CommandBufferUsageFlags,
    },
    /// Recording finished.
    End,
    /// Render pass opened over the given target.
    BeginRenderPass {
        /// Attachment load/store description.
        render_pass: RenderPassHandle,
        /// Surface or framebuffer drawn into.
        render_target: RenderTargetHandle,
        /// Area affected by the pass.
        render_area: Rect2D,
        /// Clear values, one per attachment cleared.
        clear_values: Vec<ClearValue>,
    },
    /// Render pass closed.
    EndRenderPass,
    /// Secondary buffers replayed inline at this point.
    ExecuteCommandBuffers {
        /// Buffers replayed, in order.
        buffers: Vec<CommandBufferHandle>,
    },
    /// Vertex buffers bound starting at a binding slot.
    BindVertexBuffers {
        /// First binding slot.
        first_binding: u32,
        /// Buffers with byte offsets, in slot order.
        buffers: Vec<(BufferHandle, u32)>,
    },
    /// Index buffer bound.
    BindIndexBuffer {
        /// Bound buffer.
        buffer: BufferHandle,
        /// Byte offset of the first index.
        offset: u32,
        /// Index width.
        format: IndexFormat,
    },
    /// Uniform buffer slices bound.
    BindUniformBuffers {
        /// Slices bound, one per binding.
        bindings: Vec<UniformBinding>,
    },
    /// Textures bound for sampling.
    BindTextures {
        /// Textures bound, one per binding.
        bindings: Vec<TextureBinding>,
    },
    /// Standalone samplers bound.
    BindSamplers {
        /// Samplers bound, one per binding.
        bindings: Vec<SamplerBinding>,
    },
    /// Pipeline selected for subsequent draws.
    BindPipeline {
        /// Selected pipeline.
        pipeline: PipelineHandle,
    },
    /// Non-indexed draw.
    Draw {
        /// Vertices per instance.
        vertex_count: u32,
        /// Instances drawn.
        instance_count: u32,
        /// First vertex index.
        first_vertex: u32,
        /// First instance index.
        first_instance: u32,
    },
    /// Indexed draw.
    DrawIndexed {
        /// Indices per instance.
        index_count: u32,
        /// Instances drawn.
        instance_count: u32,
        /// First index element.
        first_index: u32,
        /// Value added to each index.
        vertex_offset: i32,
        /// First instance index.
        first_instance: u32,
    },
    /// Indirect indexed draw sourced from a buffer.
    DrawIndexedIndirect {
        /// Buffer holding draw parameters.
        buffer: BufferHandle,
        /// Byte offset of the first parameter block.
        offset: u32,
        /// Number of parameter blocks.
        draw_count: u32,
        /// Byte stride between parameter blocks.
        stride: u32,
    },
    /// Escape hatch for externally driven drawing; ignored on replay.
    DrawNative,
    /// Scissor rectangle set.
    SetScissor {
        /// New scissor rectangle.
        region: Rect2D,
    },
    /// Scissor test toggled; a recording hint with no native counterpart.
    SetScissorTestEnable {
        /// Whether scissor testing applies.
        enable: bool,
    },
    /// Viewport set.
    SetViewport {
        /// New viewport.
        region: Viewport,
    },
    /// Stencil test toggled.
    SetStencilTestEnable {
        /// Whether stencil testing applies.
        enable: bool,
    },
    /// Stencil write mask set for both faces.
    SetStencilWriteMask {
        /// New write mask.
        mask: u32,
    },
    /// Stencil compare and op state set for both faces.
    SetStencilState {
        /// Comparison function.
        compare_op: CompareOp,
        /// Reference value.
        reference: u32,
        /// Compare mask.
        compare_mask: u32,
        /// Op on stencil fail.
        fail_op: StencilOp,
        /// Op on stencil and depth pass.
        pass_op: StencilOp,
        /// Op on stencil pass, depth fail.
        depth_fail_op: StencilOp,
    },
    /// Depth comparison function set.
    SetDepthCompareOp {
        /// Comparison function.
        op: CompareOp,
    },
    /// Depth test toggled.
    SetDepthTestEnable {
        /// Whether depth testing applies.
        enable: bool,
    },
    /// Depth writes toggled.
    SetDepthWriteEnable {
        /// Whether depth writes apply.
        enable: bool,
    },
    /// All color channels toggled on attachment zero.
    SetColorMask {
        /// Whether color writes apply.
        enable: bool,
    },
    /// Blending toggled on attachment zero.
    SetColorBlendEnable {
        /// Whether blending applies.
        enable: bool,
    },
    /// Dynamic blend equation set on attachment zero.
    SetColorBlendEquation {
        /// New blend equation.
        equation: BlendEquation,
    },
    /// Advanced blend operation set on attachment zero.
    SetColorBlendAdvanced {
        /// Source treated as premultiplied.
        src_premultiplied: bool,
        /// Destination treated as premultiplied.
        dst_premultiplied: bool,
        /// Advanced combine operation.
        blend_op: BlendOp,
    },
    /// Target presented after this buffer's work completes.
    Present {
        /// Target whose surface is presented.
        target: RenderTargetHandle,
    },
}

/// Recording lifecycle of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    /// Fresh or reset; not yet recording.
    #[default]
    Initial,
    /// Between begin and end.
    Recording,
    /// Ended; ready for submission.
    Executable,
}

/// An append-only log of commands, recorded by the rendering core and
/// replayed by the controller at submission.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    level: CommandBufferLevel,
    fixed_capacity: Option<u32>,
    usage: CommandBufferUsageFlags,
    state: RecordingState,
    commands: Vec<Command>,
}

impl CommandBuffer {
    /// Creates an empty buffer.
    pub fn new(level: CommandBufferLevel, fixed_capacity: Option<u32>) -> Self {
        let reserve = fixed_capacity.map(|n| n as usize + 2).unwrap_or(0);
        CommandBuffer {
            level,
            fixed_capacity,
            usage: CommandBufferUsageFlags::empty(),
            state: RecordingState::Initial,
            commands: Vec::with_capacity(reserve),
        }
    }

    /// Recording level.
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Fixed command capacity, when created with one.
    pub fn fixed_capacity(&self) -> Option<u32> {
        self.fixed_capacity
    }

    /// Whether this is a single-command presentation buffer eligible for
    /// pooling.
    pub fn is_presentation_buffer(&self) -> bool {
        self.fixed_capacity == Some(1)
    }

    /// Usage flags of the current recording.
    pub fn usage(&self) -> CommandBufferUsageFlags {
        self.usage
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// The recorded log.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Reconfigures the buffer in place, dropping any recorded commands but
    /// keeping the allocation.
    pub fn reset(&mut self, level: CommandBufferLevel, fixed_capacity: Option<u32>) {
        self.level = level;
        self.fixed_capacity = fixed_capacity;
        self.usage = CommandBufferUsageFlags::empty();
        self.state = RecordingState::Initial;
        self.commands.clear();
    }

    /// Starts a new recording, discarding any previous log.
    pub fn begin(&mut self, usage: CommandBufferUsageFlags) {
        self.commands.clear();
        self.usage = usage;
        self.state = RecordingState::Recording;
        self.push(Command::Begin { usage });
    }

    /// Finishes the recording.
    pub fn end(&mut self) {
        debug_assert_eq!(self.state, RecordingState::Recording);
        self.push(Command::End);
        self.state = RecordingState::Executable;
    }

    /// Opens a render pass.
    pub fn begin_render_pass(
        &mut self,
        render_pass: RenderPassHandle,
        render_target: RenderTargetHandle,
        render_area: Rect2D,
        clear_values: Vec<ClearValue>,
    ) {
        self.push(Command::BeginRenderPass {
            render_pass,
            render_target,
            render_area,
            clear_values,
        });
    }

    /// Closes the open render pass.
    pub fn end_render_pass(&mut self) {
        self.push(Command::EndRenderPass);
    }

    /// Replays secondary buffers inline.
    pub fn execute_command_buffers(&mut self, buffers: Vec<CommandBufferHandle>) {
        debug_assert_eq!(self.level, CommandBufferLevel::Primary);
        self.push(Command::ExecuteCommandBuffers { buffers });
    }

    /// Binds vertex buffers starting at `first_binding`.
    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: Vec<(BufferHandle, u32)>) {
        self.push(Command::BindVertexBuffers { first_binding, buffers });
    }

    /// Binds the index buffer.
    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u32, format: IndexFormat) {
        self.push(Command::BindIndexBuffer { buffer, offset, format });
    }

    /// Binds uniform buffer slices.
    pub fn bind_uniform_buffers(&mut self, bindings: Vec<UniformBinding>) {
        self.push(Command::BindUniformBuffers { bindings });
    }

    /// Binds textures for sampling.
    pub fn bind_textures(&mut self, bindings: Vec<TextureBinding>) {
        self.push(Command::BindTextures { bindings });
    }

    /// Binds standalone samplers.
    pub fn bind_samplers(&mut self, bindings: Vec<SamplerBinding>) {
        self.push(Command::BindSamplers { bindings });
    }

    /// Selects the pipeline for subsequent draws.
    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.push(Command::BindPipeline { pipeline });
    }

    /// Records a non-indexed draw.
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    /// Records an indexed draw.
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    /// Records an indirect indexed draw.
    pub fn draw_indexed_indirect(
        &mut self,
        buffer: BufferHandle,
        offset: u32,
        draw_count: u32,
        stride: u32,
    ) {
        self.push(Command::DrawIndexedIndirect { buffer, offset, draw_count, stride });
    }

    /// Records the externally driven drawing escape.
    pub fn draw_native(&mut self) {
        self.push(Command::DrawNative);
    }

    /// Sets the scissor rectangle.
    pub fn set_scissor(&mut self, region: Rect2D) {
        self.push(Command::SetScissor { region });
    }

    /// Toggles scissor testing.
    pub fn set_scissor_test_enable(&mut self, enable: bool) {
        self.push(Command::SetScissorTestEnable { enable });
    }

    /// Sets the viewport.
    pub fn set_viewport(&mut self, region: Viewport) {
        self.push(Command::SetViewport { region });
    }

    /// Toggles stencil testing.
    pub fn set_stencil_test_enable(&mut self, enable: bool) {
        self.push(Command::SetStencilTestEnable { enable });
    }

    /// Sets the stencil write mask for both faces.
    pub fn set_stencil_write_mask(&mut self, mask: u32) {
        self.push(Command::SetStencilWriteMask { mask });
    }

    /// Sets stencil compare and op state for both faces.
    pub fn set_stencil_state(
        &mut self,
        compare_op: CompareOp,
        reference: u32,
        compare_mask: u32,
        fail_op: StencilOp,
        pass_op: StencilOp,
        depth_fail_op: StencilOp,
    ) {
        self.push(Command::SetStencilState {
            compare_op,
            reference,
            compare_mask,
            fail_op,
            pass_op,
            depth_fail_op,
        });
    }

    /// Sets the depth comparison function.
    pub fn set_depth_compare_op(&mut self, op: CompareOp) {
        self.push(Command::SetDepthCompareOp { op });
    }

    /// Toggles depth testing.
    pub fn set_depth_test_enable(&mut self, enable: bool) {
        self.push(Command::SetDepthTestEnable { enable });
    }

    /// Toggles depth writes.
    pub fn set_depth_write_enable(&mut self, enable: bool) {
        self.push(Command::SetDepthWriteEnable { enable });
    }

    /// Toggles color writes on attachment zero.
    pub fn set_color_mask(&mut self, enable: bool) {
        self.push(Command::SetColorMask { enable });
    }

    /// Toggles blending on attachment zero.
    pub fn set_color_blend_enable(&mut self, enable: bool) {
        self.push(Command::SetColorBlendEnable { enable });
    }

    /// Sets the dynamic blend equation on attachment zero.
    pub fn set_color_blend_equation(&mut self, equation: BlendEquation) {
        self.push(Command::SetColorBlendEquation { equation });
    }

    /// Sets an advanced blend operation on attachment zero.
    pub fn set_color_blend_advanced(
        &mut self,
        src_premultiplied: bool,
        dst_premultiplied: bool,
        blend_op: BlendOp,
    ) {
        self.push(Command::SetColorBlendAdvanced {
            src_premultiplied,
            dst_premultiplied,
            blend_op,
        });
    }

    /// Records a present of the target's surface.
    pub fn present(&mut self, target: RenderTargetHandle) {
        self.push(Command::Present { target });
    }

    fn push(&mut self, command: Command) {
        debug_assert_eq!(self.state, RecordingState::Recording);
        if let Some(capacity) = self.fixed_capacity {
            // Begin and End do not count against the fixed capacity.
            if !matches!(command, Command::Begin { .. } | Command::End) {
                let recorded = self.commands.len().saturating_sub(1);
                debug_assert!(recorded < capacity as usize);
            }
        }
        self.commands.push(command);
    }
}
