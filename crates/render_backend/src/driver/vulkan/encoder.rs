//! Command encoder recording into a primary Vulkan command buffer.
//!
//! Resource bindings go through push descriptors against the shared pipeline
//! layout, so no descriptor pools or sets are managed per frame. Dynamic
//! state calls that need an extension the device lacks fail with
//! [`BackendError::Unsupported`].

use std::collections::HashMap;
use std::sync::Arc;

use ash::extensions::ext::{ExtendedDynamicState, ExtendedDynamicState3};
use ash::extensions::khr::PushDescriptor;
use ash::vk;

use crate::api::types::{
    BlendEquation, BlendOp, ClearValue, CompareOp, IndexFormat, Rect2D, SamplerFilter, StencilOp,
    TextureLayout, Viewport,
};
use crate::driver::{
    BufferCopy, BufferId, BufferImageCopy, CommandEncoder, EncodedCommands, FramebufferId,
    ImageBlit, ImageId, ImageViewId, PipelineId, RenderPassId, SamplerId, UniformBufferBinding,
};
use crate::error::{BackendError, BackendResult};

use super::{convert, DriverShared, TEXTURE_SET, UNIFORM_SET};

pub(super) struct VulkanEncoder {
    shared: Arc<DriverShared>,
    command_buffer: vk::CommandBuffer,
    began: bool,
    in_pass: bool,
    finished: bool,
    /// Views currently pushed per texture binding. A later sampler bind at
    /// the same binding re-pushes the pair.
    bound_views: HashMap<u32, vk::ImageView>,
    /// Samplers bound before their texture arrived.
    pending_samplers: HashMap<u32, vk::Sampler>,
}

impl VulkanEncoder {
    pub(super) fn new(shared: Arc<DriverShared>, command_buffer: vk::CommandBuffer) -> Self {
        VulkanEncoder {
            shared,
            command_buffer,
            began: false,
            in_pass: false,
            finished: false,
            bound_views: HashMap::new(),
            pending_samplers: HashMap::new(),
        }
    }

    fn device(&self) -> &ash::Device {
        self.shared.context.device()
    }

    fn require_in_pass(&self) -> BackendResult<()> {
        if !self.in_pass {
            return Err(BackendError::invalid("draw or state call outside a render pass"));
        }
        Ok(())
    }

    fn require_outside_pass(&self) -> BackendResult<()> {
        if !self.began {
            return Err(BackendError::invalid("recording before begin"));
        }
        if self.in_pass {
            return Err(BackendError::invalid("copy or barrier inside a render pass"));
        }
        Ok(())
    }

    fn push_descriptors(&self) -> BackendResult<&PushDescriptor> {
        self.shared.context.push_descriptor().ok_or_else(|| {
            BackendError::Unsupported("VK_KHR_push_descriptor".to_string())
        })
    }

    fn dynamic_state(&self) -> BackendResult<&ExtendedDynamicState> {
        self.shared.context.dynamic_state().ok_or_else(|| {
            BackendError::Unsupported("VK_EXT_extended_dynamic_state".to_string())
        })
    }

    fn dynamic_state3(&self) -> BackendResult<&ExtendedDynamicState3> {
        self.shared.context.dynamic_state3().ok_or_else(|| {
            BackendError::Unsupported("VK_EXT_extended_dynamic_state3".to_string())
        })
    }

    fn push_texture(
        &self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> BackendResult<()> {
        let push = self.push_descriptors()?;
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();
        unsafe {
            push.cmd_push_descriptor_set(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.shared.pipeline_layout,
                TEXTURE_SET,
                &[write],
            );
        }
        Ok(())
    }
}

fn blit_corners(region: Rect2D) -> [vk::Offset3D; 2] {
    [
        vk::Offset3D {
            x: region.offset.x,
            y: region.offset.y,
            z: 0,
        },
        vk::Offset3D {
            x: region.offset.x + region.extent.width as i32,
            y: region.offset.y + region.extent.height as i32,
            z: 1,
        },
    ]
}

impl CommandEncoder for VulkanEncoder {
    fn begin(&mut self) -> BackendResult<()> {
        if self.began {
            return Err(BackendError::invalid("encoder begun twice"));
        }
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device()
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(BackendError::Api)?;
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
        let pass = self.shared.render_pass_handle(render_pass)?;
        let framebuffer = self.shared.framebuffer_handle(framebuffer)?;
        let clears: Vec<vk::ClearValue> =
            clear_values.iter().map(|&value| convert::clear_value(value)).collect();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(convert::rect(render_area))
            .clear_values(&clears);
        unsafe {
            self.device().cmd_begin_render_pass(
                self.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
        self.in_pass = true;
        Ok(())
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        if !self.in_pass {
            return Err(BackendError::invalid("no render pass to end"));
        }
        unsafe { self.device().cmd_end_render_pass(self.command_buffer) };
        self.in_pass = false;
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: PipelineId) -> BackendResult<()> {
        self.require_in_pass()?;
        let pipeline = self.shared.pipeline_handle(pipeline)?;
        unsafe {
            self.device().cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            );
        }
        Ok(())
    }

    fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[(BufferId, u64)],
    ) -> BackendResult<()> {
        self.require_in_pass()?;
        if buffers.is_empty() {
            return Ok(());
        }
        let mut handles = Vec::with_capacity(buffers.len());
        let mut offsets = Vec::with_capacity(buffers.len());
        for &(buffer, offset) in buffers {
            handles.push(self.shared.buffer_handle(buffer)?);
            offsets.push(offset);
        }
        unsafe {
            self.device().cmd_bind_vertex_buffers(
                self.command_buffer,
                first_binding,
                &handles,
                &offsets,
            );
        }
        Ok(())
    }

    fn bind_index_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        format: IndexFormat,
    ) -> BackendResult<()> {
        self.require_in_pass()?;
        let buffer = self.shared.buffer_handle(buffer)?;
        unsafe {
            self.device().cmd_bind_index_buffer(
                self.command_buffer,
                buffer,
                offset,
                convert::index_type(format),
            );
        }
        Ok(())
    }

    fn bind_uniform_buffers(&mut self, bindings: &[UniformBufferBinding]) -> BackendResult<()> {
        self.require_in_pass()?;
        if bindings.is_empty() {
            return Ok(());
        }
        let mut infos = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let buffer = self.shared.buffer_handle(binding.buffer)?;
            infos.push([vk::DescriptorBufferInfo {
                buffer,
                offset: binding.offset,
                range: binding.range,
            }]);
        }
        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .zip(bindings)
            .map(|(info, binding)| {
                vk::WriteDescriptorSet::builder()
                    .dst_binding(binding.binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(info)
                    .build()
            })
            .collect();
        let push = self.push_descriptors()?;
        unsafe {
            push.cmd_push_descriptor_set(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.shared.pipeline_layout,
                UNIFORM_SET,
                &writes,
            );
        }
        Ok(())
    }

    fn bind_texture(
        &mut self,
        binding: u32,
        view: ImageViewId,
        sampler: Option<SamplerId>,
    ) -> BackendResult<()> {
        self.require_in_pass()?;
        let view = self.shared.view_handle(view)?;
        let sampler = match sampler {
            Some(id) => self.shared.sampler_handle(id)?,
            None => self
                .pending_samplers
                .remove(&binding)
                .unwrap_or(self.shared.default_sampler),
        };
        self.bound_views.insert(binding, view);
        self.push_texture(binding, view, sampler)
    }

    fn bind_sampler(&mut self, binding: u32, sampler: SamplerId) -> BackendResult<()> {
        self.require_in_pass()?;
        let sampler = self.shared.sampler_handle(sampler)?;
        match self.bound_views.get(&binding).copied() {
            Some(view) => self.push_texture(binding, view, sampler),
            None => {
                self.pending_samplers.insert(binding, sampler);
                Ok(())
            }
        }
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> BackendResult<()> {
        self.require_in_pass()?;
        unsafe {
            self.device().cmd_draw(
                self.command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> BackendResult<()> {
        self.require_in_pass()?;
        unsafe {
            self.device().cmd_draw_indexed(
                self.command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
        Ok(())
    }

    fn draw_indexed_indirect(
        &mut self,
        buffer: BufferId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> BackendResult<()> {
        self.require_in_pass()?;
        let buffer = self.shared.buffer_handle(buffer)?;
        unsafe {
            self.device().cmd_draw_indexed_indirect(
                self.command_buffer,
                buffer,
                offset,
                draw_count,
                stride,
            );
        }
        Ok(())
    }

    fn set_scissor(&mut self, region: Rect2D) -> BackendResult<()> {
        self.require_in_pass()?;
        unsafe {
            self.device()
                .cmd_set_scissor(self.command_buffer, 0, &[convert::rect(region)]);
        }
        Ok(())
    }

    fn set_viewport(&mut self, region: Viewport) -> BackendResult<()> {
        self.require_in_pass()?;
        unsafe {
            self.device()
                .cmd_set_viewport(self.command_buffer, 0, &[convert::viewport(region)]);
        }
        Ok(())
    }

    fn set_stencil_test_enable(&mut self, enable: bool) -> BackendResult<()> {
        self.require_in_pass()?;
        let dynamic_state = self.dynamic_state()?;
        unsafe { dynamic_state.cmd_set_stencil_test_enable(self.command_buffer, enable) };
        Ok(())
    }

    fn set_stencil_write_mask(&mut self, mask: u32) -> BackendResult<()> {
        self.require_in_pass()?;
        unsafe {
            self.device().cmd_set_stencil_write_mask(
                self.command_buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                mask,
            );
        }
        Ok(())
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
        self.require_in_pass()?;
        let dynamic_state = self.dynamic_state()?;
        unsafe {
            self.device().cmd_set_stencil_reference(
                self.command_buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                reference,
            );
            self.device().cmd_set_stencil_compare_mask(
                self.command_buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                compare_mask,
            );
            dynamic_state.cmd_set_stencil_op(
                self.command_buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                convert::stencil_op(fail_op),
                convert::stencil_op(pass_op),
                convert::stencil_op(depth_fail_op),
                convert::compare_op(compare_op),
            );
        }
        Ok(())
    }

    fn set_depth_compare_op(&mut self, op: CompareOp) -> BackendResult<()> {
        self.require_in_pass()?;
        let dynamic_state = self.dynamic_state()?;
        unsafe {
            dynamic_state.cmd_set_depth_compare_op(self.command_buffer, convert::compare_op(op));
        }
        Ok(())
    }

    fn set_depth_test_enable(&mut self, enable: bool) -> BackendResult<()> {
        self.require_in_pass()?;
        let dynamic_state = self.dynamic_state()?;
        unsafe { dynamic_state.cmd_set_depth_test_enable(self.command_buffer, enable) };
        Ok(())
    }

    fn set_depth_write_enable(&mut self, enable: bool) -> BackendResult<()> {
        self.require_in_pass()?;
        let dynamic_state = self.dynamic_state()?;
        unsafe { dynamic_state.cmd_set_depth_write_enable(self.command_buffer, enable) };
        Ok(())
    }

    fn set_color_mask(&mut self, enable: bool) -> BackendResult<()> {
        self.require_in_pass()?;
        let dynamic_state3 = self.dynamic_state3()?;
        let mask = if enable {
            vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A
        } else {
            vk::ColorComponentFlags::empty()
        };
        unsafe { dynamic_state3.cmd_set_color_write_mask(self.command_buffer, 0, &[mask]) };
        Ok(())
    }

    fn set_color_blend_enable(&mut self, enable: bool) -> BackendResult<()> {
        self.require_in_pass()?;
        let dynamic_state3 = self.dynamic_state3()?;
        unsafe {
            dynamic_state3.cmd_set_color_blend_enable(
                self.command_buffer,
                0,
                &[vk::Bool32::from(enable)],
            );
        }
        Ok(())
    }

    fn set_color_blend_equation(&mut self, equation: BlendEquation) -> BackendResult<()> {
        self.require_in_pass()?;
        let dynamic_state3 = self.dynamic_state3()?;
        let equations = [vk::ColorBlendEquationEXT {
            src_color_blend_factor: convert::blend_factor(equation.src_color),
            dst_color_blend_factor: convert::blend_factor(equation.dst_color),
            color_blend_op: convert::blend_op(equation.color_op),
            src_alpha_blend_factor: convert::blend_factor(equation.src_alpha),
            dst_alpha_blend_factor: convert::blend_factor(equation.dst_alpha),
            alpha_blend_op: convert::blend_op(equation.alpha_op),
        }];
        unsafe {
            dynamic_state3.cmd_set_color_blend_equation(self.command_buffer, 0, &equations);
        }
        Ok(())
    }

    fn set_color_blend_advanced(
        &mut self,
        src_premultiplied: bool,
        dst_premultiplied: bool,
        blend_op: BlendOp,
    ) -> BackendResult<()> {
        self.require_in_pass()?;
        if !self.shared.context.support().advanced_blend {
            return Err(BackendError::Unsupported(
                "VK_EXT_blend_operation_advanced".to_string(),
            ));
        }
        let dynamic_state3 = self.dynamic_state3()?;
        let advanced = [vk::ColorBlendAdvancedEXT {
            advanced_blend_op: convert::blend_op(blend_op),
            src_premultiplied: vk::Bool32::from(src_premultiplied),
            dst_premultiplied: vk::Bool32::from(dst_premultiplied),
            blend_overlap: vk::BlendOverlapEXT::UNCORRELATED,
            clamp_results: vk::FALSE,
        }];
        unsafe {
            dynamic_state3.cmd_set_color_blend_advanced(self.command_buffer, 0, &advanced);
        }
        Ok(())
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
        self.require_outside_pass()?;
        let (image, aspect) = self.shared.image_handle(image)?;
        let (src_access, src_stage) = convert::layout_access(old_layout);
        let (dst_access, dst_stage) = convert::layout_access(new_layout);
        // u32::MAX coincides with VK_REMAINING_MIP_LEVELS / _ARRAY_LAYERS, so
        // the counts pass straight through.
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(convert::image_layout(old_layout))
            .new_layout(convert::image_layout(new_layout))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: base_mip,
                level_count: mip_count,
                base_array_layer: base_layer,
                layer_count,
            })
            .build();
        unsafe {
            self.device().cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        Ok(())
    }

    fn copy_buffer_to_image(
        &mut self,
        src: BufferId,
        dst: ImageId,
        layout: TextureLayout,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()> {
        self.require_outside_pass()?;
        let src = self.shared.buffer_handle(src)?;
        let (dst, aspect) = self.shared.image_handle(dst)?;
        let copies: Vec<vk::BufferImageCopy> = regions
            .iter()
            .map(|region| vk::BufferImageCopy {
                buffer_offset: region.buffer_offset,
                buffer_row_length: region.buffer_row_length,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: region.mip_level,
                    base_array_layer: region.base_layer,
                    layer_count: region.layer_count,
                },
                image_offset: vk::Offset3D {
                    x: region.image_offset.x,
                    y: region.image_offset.y,
                    z: 0,
                },
                image_extent: vk::Extent3D {
                    width: region.image_extent.width,
                    height: region.image_extent.height,
                    depth: 1,
                },
            })
            .collect();
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                self.command_buffer,
                src,
                dst,
                convert::image_layout(layout),
                &copies,
            );
        }
        Ok(())
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        dst: BufferId,
        regions: &[BufferCopy],
    ) -> BackendResult<()> {
        self.require_outside_pass()?;
        let src = self.shared.buffer_handle(src)?;
        let dst = self.shared.buffer_handle(dst)?;
        let copies: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|region| vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            })
            .collect();
        unsafe {
            self.device()
                .cmd_copy_buffer(self.command_buffer, src, dst, &copies);
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
        self.require_outside_pass()?;
        let (src, src_aspect) = self.shared.image_handle(src)?;
        let (dst, dst_aspect) = self.shared.image_handle(dst)?;
        let blits: Vec<vk::ImageBlit> = regions
            .iter()
            .map(|blit| vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: src_aspect,
                    mip_level: blit.src_mip,
                    base_array_layer: blit.layer,
                    layer_count: 1,
                },
                src_offsets: blit_corners(blit.src_region),
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: dst_aspect,
                    mip_level: blit.dst_mip,
                    base_array_layer: blit.layer,
                    layer_count: 1,
                },
                dst_offsets: blit_corners(blit.dst_region),
            })
            .collect();
        unsafe {
            self.device().cmd_blit_image(
                self.command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &blits,
                convert::filter(filter),
            );
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> BackendResult<EncodedCommands> {
        if !self.began {
            return Err(BackendError::invalid("finishing an encoder that never began"));
        }
        if self.in_pass {
            return Err(BackendError::invalid("finishing inside a render pass"));
        }
        unsafe {
            self.device()
                .end_command_buffer(self.command_buffer)
                .map_err(BackendError::Api)?;
        }
        self.finished = true;
        Ok(self.shared.store_finished(self.command_buffer))
    }
}

impl Drop for VulkanEncoder {
    fn drop(&mut self) {
        // An encoder abandoned before finish() returns its buffer to the pool.
        if !self.finished {
            let pool = self.shared.command_pool();
            unsafe {
                self.shared
                    .context
                    .device()
                    .free_command_buffers(*pool, &[self.command_buffer]);
            }
        }
    }
}
