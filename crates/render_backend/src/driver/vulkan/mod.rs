//! Vulkan implementation of [`GpuDriver`].
//!
//! All native objects live in slotmap tables behind one mutex; handles the
//! rest of the backend holds are table keys, never raw Vulkan handles.
//! Rendering targets buffered offscreen images registered per surface, so
//! the driver runs headless with no swapchain. Submissions attach an
//! internal fence used to reclaim command buffers once the queue is done
//! with them.
//!
//! Resource binding uses VK_KHR_push_descriptor against one pipeline layout
//! shared by every pipeline: set 0 carries uniform buffers, set 1 combined
//! image samplers. Depth, stencil and blend state stay dynamic through
//! VK_EXT_extended_dynamic_state and VK_EXT_extended_dynamic_state3 where
//! the device offers them.

mod convert;
mod device;
mod encoder;

use std::collections::HashMap;
use std::ffi::CString;
use std::io::Cursor;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use slotmap::SlotMap;

use crate::api::info::{
    MemoryRequirements, PipelineStage, RenderPassCreateInfo, SamplerCreateInfo,
};
use crate::api::state::StencilOpState;
use crate::api::types::{
    AttachmentLoadOp, Format, TextureTiling, TextureType, TextureUsageFlags, VertexInputRate,
};
use crate::config::BackendSettings;
use crate::error::{BackendError, BackendResult};

use self::device::DeviceContext;
use super::{
    BufferDesc, BufferId, CommandEncoder, ConversionId, DeviceIdentity, DriverLimits,
    EncodedCommands, ExternalImageDesc, FenceId, FramebufferDesc, FramebufferId, GpuDriver,
    ImageDesc, ImageId, ImageViewDesc, ImageViewId, MemoryId, PipelineDesc, PipelineId,
    RenderPassId, SamplerId, ShaderId, SurfaceDesc, SurfaceId, YcbcrConversionDesc, YcbcrSupport,
};

/// Descriptor set carrying uniform buffers.
const UNIFORM_SET: u32 = 0;
/// Descriptor set carrying combined image samplers.
const TEXTURE_SET: u32 = 1;
/// Bindings declared per descriptor set.
const MAX_BINDINGS: u32 = 16;

struct ImageRecord {
    image: vk::Image,
    /// Backing allocation. Null for externally backed images, whose memory
    /// lives in the imported-memory table.
    memory: vk::DeviceMemory,
    format: Format,
    aspect: vk::ImageAspectFlags,
    cube: bool,
    external: bool,
    disjoint: bool,
    cpu_accessible: bool,
    mapped: *mut u8,
}

struct BufferRecord {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    cpu_accessible: bool,
    mapped: *mut u8,
}

struct SurfaceBuffer {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    framebuffer: Option<(RenderPassId, FramebufferId)>,
}

struct SurfaceRecord {
    extent: vk::Extent2D,
    buffers: Vec<SurfaceBuffer>,
    current: usize,
}

#[derive(Default)]
struct Tables {
    images: SlotMap<ImageId, ImageRecord>,
    views: SlotMap<ImageViewId, vk::ImageView>,
    buffers: SlotMap<BufferId, BufferRecord>,
    samplers: SlotMap<SamplerId, vk::Sampler>,
    shaders: SlotMap<ShaderId, vk::ShaderModule>,
    render_passes: SlotMap<RenderPassId, vk::RenderPass>,
    framebuffers: SlotMap<FramebufferId, vk::Framebuffer>,
    pipelines: SlotMap<PipelineId, vk::Pipeline>,
    fences: SlotMap<FenceId, vk::Fence>,
    memories: SlotMap<MemoryId, vk::DeviceMemory>,
    conversions: SlotMap<ConversionId, vk::SamplerYcbcrConversion>,
    surfaces: SlotMap<SurfaceId, SurfaceRecord>,
}

// The raw pointers are persistent mappings of device memory owned by the
// same records; the table merely stores them.
unsafe impl Send for Tables {}

struct InFlight {
    fence: vk::Fence,
    buffers: Vec<vk::CommandBuffer>,
}

#[derive(Default)]
struct Submissions {
    finished: HashMap<u64, vk::CommandBuffer>,
    next_encoding: u64,
    in_flight: Vec<InFlight>,
}

/// State shared between the driver and its encoders.
struct DriverShared {
    tables: Mutex<Tables>,
    submissions: Mutex<Submissions>,
    command_pool: Mutex<vk::CommandPool>,
    pipeline_cache: Mutex<vk::PipelineCache>,
    descriptor_layouts: [vk::DescriptorSetLayout; 2],
    pipeline_layout: vk::PipelineLayout,
    /// Bound when a texture arrives without a sampler.
    default_sampler: vk::Sampler,
    /// Declared last so every other object is destroyed first.
    context: DeviceContext,
}

impl DriverShared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submissions(&self) -> MutexGuard<'_, Submissions> {
        self.submissions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command_pool(&self) -> MutexGuard<'_, vk::CommandPool> {
        self.command_pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pipeline_cache(&self) -> MutexGuard<'_, vk::PipelineCache> {
        self.pipeline_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn image_handle(&self, image: ImageId) -> BackendResult<(vk::Image, vk::ImageAspectFlags)> {
        self.tables()
            .images
            .get(image)
            .map(|record| (record.image, record.aspect))
            .ok_or(BackendError::StaleHandle { kind: "image" })
    }

    fn view_handle(&self, view: ImageViewId) -> BackendResult<vk::ImageView> {
        self.tables()
            .views
            .get(view)
            .copied()
            .ok_or(BackendError::StaleHandle { kind: "image view" })
    }

    fn buffer_handle(&self, buffer: BufferId) -> BackendResult<vk::Buffer> {
        self.tables()
            .buffers
            .get(buffer)
            .map(|record| record.buffer)
            .ok_or(BackendError::StaleHandle { kind: "buffer" })
    }

    fn sampler_handle(&self, sampler: SamplerId) -> BackendResult<vk::Sampler> {
        self.tables()
            .samplers
            .get(sampler)
            .copied()
            .ok_or(BackendError::StaleHandle { kind: "sampler" })
    }

    fn render_pass_handle(&self, render_pass: RenderPassId) -> BackendResult<vk::RenderPass> {
        self.tables()
            .render_passes
            .get(render_pass)
            .copied()
            .ok_or(BackendError::StaleHandle { kind: "render pass" })
    }

    fn framebuffer_handle(&self, framebuffer: FramebufferId) -> BackendResult<vk::Framebuffer> {
        self.tables()
            .framebuffers
            .get(framebuffer)
            .copied()
            .ok_or(BackendError::StaleHandle { kind: "framebuffer" })
    }

    fn pipeline_handle(&self, pipeline: PipelineId) -> BackendResult<vk::Pipeline> {
        self.tables()
            .pipelines
            .get(pipeline)
            .copied()
            .ok_or(BackendError::StaleHandle { kind: "pipeline" })
    }

    fn fence_handle(&self, fence: FenceId) -> BackendResult<vk::Fence> {
        self.tables()
            .fences
            .get(fence)
            .copied()
            .ok_or(BackendError::StaleHandle { kind: "fence" })
    }

    fn conversion_handle(
        &self,
        conversion: ConversionId,
    ) -> BackendResult<vk::SamplerYcbcrConversion> {
        self.tables()
            .conversions
            .get(conversion)
            .copied()
            .ok_or(BackendError::StaleHandle { kind: "conversion" })
    }

    fn store_finished(&self, command_buffer: vk::CommandBuffer) -> EncodedCommands {
        let mut submissions = self.submissions();
        let token = submissions.next_encoding;
        submissions.next_encoding += 1;
        submissions.finished.insert(token, command_buffer);
        EncodedCommands(token)
    }

    /// Returns command buffers of completed submissions to the pool.
    fn reclaim_completed(&self) {
        let device = self.context.device();
        let mut submissions = self.submissions();
        let pool = self.command_pool();
        submissions.in_flight.retain(|entry| {
            let signaled = matches!(unsafe { device.get_fence_status(entry.fence) }, Ok(true));
            if signaled {
                unsafe {
                    device.free_command_buffers(*pool, &entry.buffers);
                    device.destroy_fence(entry.fence, None);
                }
            }
            !signaled
        });
    }

    fn destroy_surface_buffers(&self, tables: &mut Tables, buffers: Vec<SurfaceBuffer>) {
        let device = self.context.device();
        for buffer in buffers {
            if let Some((_, framebuffer)) = buffer.framebuffer {
                if let Some(handle) = tables.framebuffers.remove(framebuffer) {
                    unsafe { device.destroy_framebuffer(handle, None) };
                }
            }
            unsafe {
                device.destroy_image_view(buffer.view, None);
                device.destroy_image(buffer.image, None);
                device.free_memory(buffer.memory, None);
            }
        }
    }
}

impl Drop for DriverShared {
    fn drop(&mut self) {
        let _ = self.context.wait_idle();
        let device = self.context.device();
        unsafe {
            let submissions =
                self.submissions.get_mut().unwrap_or_else(PoisonError::into_inner);
            for entry in submissions.in_flight.drain(..) {
                device.destroy_fence(entry.fence, None);
            }
            submissions.finished.clear();

            // Anything still alive belongs to leaked handles; reclaim it
            // while the device exists.
            let tables = self.tables.get_mut().unwrap_or_else(PoisonError::into_inner);
            // Cached surface framebuffers sit in the framebuffer table and
            // fall out of its drain below.
            for (_, record) in tables.surfaces.drain() {
                for buffer in record.buffers {
                    device.destroy_image_view(buffer.view, None);
                    device.destroy_image(buffer.image, None);
                    device.free_memory(buffer.memory, None);
                }
            }
            for (_, framebuffer) in tables.framebuffers.drain() {
                device.destroy_framebuffer(framebuffer, None);
            }
            for (_, pipeline) in tables.pipelines.drain() {
                device.destroy_pipeline(pipeline, None);
            }
            for (_, render_pass) in tables.render_passes.drain() {
                device.destroy_render_pass(render_pass, None);
            }
            for (_, view) in tables.views.drain() {
                device.destroy_image_view(view, None);
            }
            for (_, sampler) in tables.samplers.drain() {
                device.destroy_sampler(sampler, None);
            }
            for (_, shader) in tables.shaders.drain() {
                device.destroy_shader_module(shader, None);
            }
            for (_, record) in tables.images.drain() {
                device.destroy_image(record.image, None);
                if record.memory != vk::DeviceMemory::null() {
                    device.free_memory(record.memory, None);
                }
            }
            for (_, record) in tables.buffers.drain() {
                device.destroy_buffer(record.buffer, None);
                device.free_memory(record.memory, None);
            }
            for (_, memory) in tables.memories.drain() {
                device.free_memory(memory, None);
            }
            for (_, conversion) in tables.conversions.drain() {
                device.destroy_sampler_ycbcr_conversion(conversion, None);
            }
            for (_, fence) in tables.fences.drain() {
                device.destroy_fence(fence, None);
            }

            device.destroy_sampler(self.default_sampler, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            for layout in self.descriptor_layouts {
                device.destroy_descriptor_set_layout(layout, None);
            }
            let cache = self.pipeline_cache.get_mut().unwrap_or_else(PoisonError::into_inner);
            device.destroy_pipeline_cache(*cache, None);
            let pool = self.command_pool.get_mut().unwrap_or_else(PoisonError::into_inner);
            device.destroy_command_pool(*pool, None);
        }
    }
}

/// The production [`GpuDriver`].
pub struct VulkanDriver {
    shared: Arc<DriverShared>,
}

impl VulkanDriver {
    /// Brings up the device and the driver-lifetime objects.
    pub fn new(settings: &BackendSettings) -> BackendResult<Self> {
        let context = DeviceContext::new(settings.enable_validation)?;
        let device = context.device();

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.queue_family())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None).map_err(BackendError::Api)? };

        let push = context.support().push_descriptor;
        let descriptor_layouts = [
            create_set_layout(device, vk::DescriptorType::UNIFORM_BUFFER, push)?,
            create_set_layout(device, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, push)?,
        ];
        let layout_info =
            vk::PipelineLayoutCreateInfo::builder().set_layouts(&descriptor_layouts);
        let pipeline_layout = unsafe {
            device.create_pipeline_layout(&layout_info, None).map_err(BackendError::Api)?
        };

        let sampler_info = vk::SamplerCreateInfo::builder()
            .min_filter(vk::Filter::LINEAR)
            .mag_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let default_sampler =
            unsafe { device.create_sampler(&sampler_info, None).map_err(BackendError::Api)? };

        let cache_info = vk::PipelineCacheCreateInfo::builder();
        let pipeline_cache =
            unsafe { device.create_pipeline_cache(&cache_info, None).map_err(BackendError::Api)? };

        Ok(VulkanDriver {
            shared: Arc::new(DriverShared {
                tables: Mutex::new(Tables::default()),
                submissions: Mutex::new(Submissions::default()),
                command_pool: Mutex::new(command_pool),
                pipeline_cache: Mutex::new(pipeline_cache),
                descriptor_layouts,
                pipeline_layout,
                default_sampler,
                context,
            }),
        })
    }

    fn allocate_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> BackendResult<vk::DeviceMemory> {
        let device = self.shared.context.device();
        let memory_type = self
            .shared
            .context
            .find_memory_type(requirements.memory_type_bits, properties)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        unsafe {
            device.allocate_memory(&alloc_info, None).map_err(|err| match err {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    BackendError::OutOfMemory { requested: requirements.size }
                }
                other => BackendError::Api(other),
            })
        }
    }

    fn allocate_bound_image_memory(
        &self,
        image: vk::Image,
        cpu_accessible: bool,
    ) -> BackendResult<vk::DeviceMemory> {
        let device = self.shared.context.device();
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let properties = if cpu_accessible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let memory = self.allocate_memory(&requirements, properties)?;
        if let Err(err) =
            unsafe { device.bind_image_memory(image, memory, 0).map_err(BackendError::Api) }
        {
            unsafe { device.free_memory(memory, None) };
            return Err(err);
        }
        Ok(memory)
    }

    fn build_sampler(
        &self,
        desc: &SamplerCreateInfo,
        conversion: Option<vk::SamplerYcbcrConversion>,
    ) -> BackendResult<vk::Sampler> {
        let device = self.shared.context.device();
        let limits = self.shared.context.properties().limits;
        let anisotropy_enable = desc.anisotropy_enable && limits.max_sampler_anisotropy > 1.0;
        let max_lod = if desc.unnormalized_coordinates { 0.0 } else { vk::LOD_CLAMP_NONE };
        let mut conversion_info =
            vk::SamplerYcbcrConversionInfo::builder().conversion(conversion.unwrap_or_default());
        let mut create_info = vk::SamplerCreateInfo::builder()
            .min_filter(convert::filter(desc.min_filter))
            .mag_filter(convert::filter(desc.mag_filter))
            .mipmap_mode(convert::mipmap_mode(desc.mipmap_mode))
            .address_mode_u(convert::address_mode(desc.address_mode_u))
            .address_mode_v(convert::address_mode(desc.address_mode_v))
            .address_mode_w(convert::address_mode(desc.address_mode_w))
            .anisotropy_enable(anisotropy_enable)
            .max_anisotropy(desc.max_anisotropy.clamp(1.0, limits.max_sampler_anisotropy))
            .compare_enable(desc.compare_enable)
            .compare_op(convert::compare_op(desc.compare_op))
            .min_lod(0.0)
            .max_lod(max_lod)
            .unnormalized_coordinates(desc.unnormalized_coordinates);
        if conversion.is_some() {
            create_info = create_info.push_next(&mut conversion_info);
        }
        unsafe { device.create_sampler(&create_info, None).map_err(BackendError::Api) }
    }
}

fn create_set_layout(
    device: &ash::Device,
    descriptor_type: vk::DescriptorType,
    push_descriptors: bool,
) -> BackendResult<vk::DescriptorSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..MAX_BINDINGS)
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .build()
        })
        .collect();
    let flags = if push_descriptors {
        vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR
    } else {
        vk::DescriptorSetLayoutCreateFlags::empty()
    };
    let create_info =
        vk::DescriptorSetLayoutCreateInfo::builder().flags(flags).bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&create_info, None).map_err(BackendError::Api) }
}

fn plane_aspect(index: usize) -> vk::ImageAspectFlags {
    match index {
        0 => vk::ImageAspectFlags::PLANE_0,
        1 => vk::ImageAspectFlags::PLANE_1,
        _ => vk::ImageAspectFlags::PLANE_2,
    }
}

fn sample_count(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

fn stencil_op_state(state: &StencilOpState) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: convert::stencil_op(state.fail_op),
        pass_op: convert::stencil_op(state.pass_op),
        depth_fail_op: convert::stencil_op(state.depth_fail_op),
        compare_op: convert::compare_op(state.compare_op),
        compare_mask: state.compare_mask,
        write_mask: state.write_mask,
        reference: state.reference,
    }
}

impl GpuDriver for VulkanDriver {
    fn is_format_supported(
        &self,
        format: Format,
        tiling: TextureTiling,
        usage: TextureUsageFlags,
    ) -> bool {
        let properties = unsafe {
            self.shared.context.instance().get_physical_device_format_properties(
                self.shared.context.physical_device(),
                convert::format(format),
            )
        };
        let available = match tiling {
            TextureTiling::Optimal => properties.optimal_tiling_features,
            TextureTiling::Linear => properties.linear_tiling_features,
        };
        available.contains(convert::format_features(usage, format.has_depth()))
    }

    fn device_identity(&self) -> DeviceIdentity {
        let properties = self.shared.context.properties();
        DeviceIdentity {
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            driver_version: properties.driver_version,
            driver_abi: std::mem::size_of::<usize>() as u32,
            uuid: properties.pipeline_cache_uuid,
        }
    }

    fn limits(&self) -> DriverLimits {
        let limits = self.shared.context.properties().limits;
        DriverLimits {
            buffer_copy_offset_alignment: limits.optimal_buffer_copy_offset_alignment,
            buffer_copy_row_pitch_alignment: limits.optimal_buffer_copy_row_pitch_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            max_sampler_anisotropy: limits.max_sampler_anisotropy,
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> BackendResult<ImageId> {
        let device = self.shared.context.device();
        let cube = desc.image_type == TextureType::TextureCubemap;
        let flags = if cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let create_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(convert::image_type(desc.image_type))
            .format(convert::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(convert::tiling(desc.tiling))
            .usage(convert::image_usage(desc.usage, desc.format.has_depth()))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image =
            unsafe { device.create_image(&create_info, None).map_err(BackendError::Api)? };

        let memory = match self.allocate_bound_image_memory(image, desc.cpu_accessible) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };

        Ok(self.shared.tables().images.insert(ImageRecord {
            image,
            memory,
            format: desc.format,
            aspect: convert::aspect(desc.format),
            cube,
            external: false,
            disjoint: false,
            cpu_accessible: desc.cpu_accessible,
            mapped: std::ptr::null_mut(),
        }))
    }

    fn image_memory_requirements(&self, image: ImageId) -> BackendResult<MemoryRequirements> {
        let device = self.shared.context.device();
        let (image, _) = self.shared.image_handle(image)?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        Ok(MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
        })
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> BackendResult<ImageViewId> {
        let device = self.shared.context.device();
        let mut tables = self.shared.tables();
        let record = tables
            .images
            .get(desc.image)
            .ok_or(BackendError::StaleHandle { kind: "image" })?;
        let view_type = if record.cube && desc.layer_count == 6 {
            vk::ImageViewType::CUBE
        } else if desc.layer_count > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let image = record.image;
        let conversion = match desc.conversion {
            Some(id) => Some(
                *tables
                    .conversions
                    .get(id)
                    .ok_or(BackendError::StaleHandle { kind: "conversion" })?,
            ),
            None => None,
        };
        let mut conversion_info =
            vk::SamplerYcbcrConversionInfo::builder().conversion(conversion.unwrap_or_default());
        let mut create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(convert::format(desc.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: convert::aspect(desc.format),
                base_mip_level: desc.base_mip,
                level_count: desc.mip_count,
                base_array_layer: desc.base_layer,
                layer_count: desc.layer_count,
            });
        if conversion.is_some() {
            create_info = create_info.push_next(&mut conversion_info);
        }
        let view =
            unsafe { device.create_image_view(&create_info, None).map_err(BackendError::Api)? };
        Ok(tables.views.insert(view))
    }

    fn destroy_image_view(&self, view: ImageViewId) {
        if let Some(handle) = self.shared.tables().views.remove(view) {
            unsafe { self.shared.context.device().destroy_image_view(handle, None) };
        }
    }

    fn destroy_image(&self, image: ImageId) {
        if let Some(record) = self.shared.tables().images.remove(image) {
            let device = self.shared.context.device();
            unsafe {
                device.destroy_image(record.image, None);
                if record.memory != vk::DeviceMemory::null() {
                    device.free_memory(record.memory, None);
                }
            }
        }
    }

    fn create_external_image(&self, desc: &ExternalImageDesc) -> BackendResult<ImageId> {
        if !self.shared.context.support().external_memory {
            return Err(BackendError::Unsupported(
                "VK_EXT_external_memory_dma_buf".to_string(),
            ));
        }
        let device = self.shared.context.device();
        let disjoint = desc.disjoint && desc.plane_count > 1;
        let flags = if disjoint {
            vk::ImageCreateFlags::DISJOINT
        } else {
            vk::ImageCreateFlags::empty()
        };
        // Modifier zero advertises a linear layout; anything else describes
        // an opaque tiled layout negotiated by the producer.
        let tiling = if desc.modifier == 0 {
            vk::ImageTiling::LINEAR
        } else {
            vk::ImageTiling::OPTIMAL
        };
        let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let create_info = vk::ImageCreateInfo::builder()
            .push_next(&mut external_info)
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(convert::image_usage(desc.usage, desc.format.has_depth()))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image =
            unsafe { device.create_image(&create_info, None).map_err(BackendError::Api)? };

        Ok(self.shared.tables().images.insert(ImageRecord {
            image,
            memory: vk::DeviceMemory::null(),
            format: desc.format,
            aspect: convert::aspect(desc.format),
            cube: false,
            external: true,
            disjoint,
            cpu_accessible: false,
            mapped: std::ptr::null_mut(),
        }))
    }

    fn import_memory_fd(&self, fd: RawFd, size: u64, image: ImageId) -> BackendResult<MemoryId> {
        let external = self.shared.context.external_memory_fd().ok_or_else(|| {
            BackendError::Unsupported("VK_KHR_external_memory_fd".to_string())
        })?;
        let device = self.shared.context.device();
        let (image_handle, disjoint) = {
            let tables = self.shared.tables();
            let record = tables
                .images
                .get(image)
                .ok_or(BackendError::StaleHandle { kind: "image" })?;
            (record.image, record.disjoint)
        };

        let fd_properties = unsafe {
            external
                .get_memory_fd_properties(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT, fd)
                .map_err(BackendError::Api)?
        };
        let memory_type = self
            .shared
            .context
            .find_memory_type(fd_properties.memory_type_bits, vk::MemoryPropertyFlags::empty())?;

        let mut import_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(fd);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image_handle);
        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .push_next(&mut import_info)
            .allocation_size(size)
            .memory_type_index(memory_type);
        // Dedicated allocations cover the whole image, which disjoint planes
        // by definition do not.
        if !disjoint {
            alloc_info = alloc_info.push_next(&mut dedicated_info);
        }
        let memory =
            unsafe { device.allocate_memory(&alloc_info, None).map_err(BackendError::Api)? };
        Ok(self.shared.tables().memories.insert(memory))
    }

    fn bind_image_planes(&self, image: ImageId, planes: &[(MemoryId, u64)]) -> BackendResult<()> {
        if planes.is_empty() {
            return Err(BackendError::invalid("no planes to bind"));
        }
        let device = self.shared.context.device();
        let tables = self.shared.tables();
        let mut memories = Vec::with_capacity(planes.len());
        for (memory, offset) in planes {
            memories.push((
                *tables
                    .memories
                    .get(*memory)
                    .ok_or(BackendError::StaleHandle { kind: "memory" })?,
                *offset,
            ));
        }
        let record = tables
            .images
            .get(image)
            .ok_or(BackendError::StaleHandle { kind: "image" })?;
        if !record.external {
            return Err(BackendError::invalid("plane binding on a non-external image"));
        }

        if record.disjoint {
            if memories.len() > 3 {
                return Err(BackendError::invalid("more than three memory planes"));
            }
            let mut plane_infos: Vec<vk::BindImagePlaneMemoryInfo> = (0..memories.len())
                .map(|index| {
                    vk::BindImagePlaneMemoryInfo::builder()
                        .plane_aspect(plane_aspect(index))
                        .build()
                })
                .collect();
            let mut bind_infos = Vec::with_capacity(memories.len());
            for (index, (memory, offset)) in memories.iter().enumerate() {
                bind_infos.push(
                    vk::BindImageMemoryInfo::builder()
                        .image(record.image)
                        .memory(*memory)
                        .memory_offset(*offset)
                        .push_next(&mut plane_infos[index])
                        .build(),
                );
            }
            unsafe { device.bind_image_memory2(&bind_infos).map_err(BackendError::Api)? };
        } else {
            let (memory, offset) = memories[0];
            unsafe {
                device
                    .bind_image_memory(record.image, memory, offset)
                    .map_err(BackendError::Api)?;
            }
        }
        Ok(())
    }

    fn ycbcr_support(&self, format: Format) -> BackendResult<YcbcrSupport> {
        if !format.is_ycbcr() {
            return Err(BackendError::invalid(format!(
                "ycbcr support queried for single-plane format {format:?}"
            )));
        }
        if !self.shared.context.support().ycbcr_conversion {
            return Ok(YcbcrSupport::default());
        }
        let properties = unsafe {
            self.shared.context.instance().get_physical_device_format_properties(
                self.shared.context.physical_device(),
                convert::format(format),
            )
        };
        let features = properties.optimal_tiling_features;
        Ok(YcbcrSupport {
            cosited_chroma: features.contains(vk::FormatFeatureFlags::COSITED_CHROMA_SAMPLES),
            midpoint_chroma: features.contains(vk::FormatFeatureFlags::MIDPOINT_CHROMA_SAMPLES),
            linear_filter: features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_YCBCR_CONVERSION_LINEAR_FILTER),
        })
    }

    fn create_ycbcr_conversion(&self, desc: &YcbcrConversionDesc) -> BackendResult<ConversionId> {
        if !self.shared.context.support().ycbcr_conversion {
            return Err(BackendError::Unsupported("sampler ycbcr conversion".to_string()));
        }
        if !desc.format.is_ycbcr() {
            return Err(BackendError::invalid(format!(
                "conversion requested for single-plane format {:?}",
                desc.format
            )));
        }
        let device = self.shared.context.device();
        let create_info = vk::SamplerYcbcrConversionCreateInfo::builder()
            .format(convert::format(desc.format))
            .ycbcr_model(convert::ycbcr_model(desc.model))
            .ycbcr_range(convert::ycbcr_range(desc.range))
            .components(vk::ComponentMapping::default())
            .x_chroma_offset(convert::chroma_location(desc.x_chroma_offset))
            .y_chroma_offset(convert::chroma_location(desc.y_chroma_offset))
            .chroma_filter(convert::filter(desc.chroma_filter))
            .force_explicit_reconstruction(false);
        let conversion = unsafe {
            device
                .create_sampler_ycbcr_conversion(&create_info, None)
                .map_err(BackendError::Api)?
        };
        Ok(self.shared.tables().conversions.insert(conversion))
    }

    fn destroy_ycbcr_conversion(&self, conversion: ConversionId) {
        if let Some(handle) = self.shared.tables().conversions.remove(conversion) {
            unsafe {
                self.shared
                    .context
                    .device()
                    .destroy_sampler_ycbcr_conversion(handle, None);
            }
        }
    }

    fn free_memory(&self, memory: MemoryId) {
        if let Some(handle) = self.shared.tables().memories.remove(memory) {
            unsafe { self.shared.context.device().free_memory(handle, None) };
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> BackendResult<BufferId> {
        let device = self.shared.context.device();
        let create_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(convert::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer =
            unsafe { device.create_buffer(&create_info, None).map_err(BackendError::Api)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let properties = if desc.cpu_accessible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let memory = match self.allocate_memory(&requirements, properties) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };
        if let Err(err) =
            unsafe { device.bind_buffer_memory(buffer, memory, 0).map_err(BackendError::Api) }
        {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(err);
        }

        Ok(self.shared.tables().buffers.insert(BufferRecord {
            buffer,
            memory,
            cpu_accessible: desc.cpu_accessible,
            mapped: std::ptr::null_mut(),
        }))
    }

    fn buffer_memory_requirements(&self, buffer: BufferId) -> BackendResult<MemoryRequirements> {
        let device = self.shared.context.device();
        let buffer = self.shared.buffer_handle(buffer)?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        Ok(MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
        })
    }

    fn map_buffer(&self, buffer: BufferId) -> BackendResult<*mut u8> {
        let device = self.shared.context.device();
        let mut tables = self.shared.tables();
        let record = tables
            .buffers
            .get_mut(buffer)
            .ok_or(BackendError::StaleHandle { kind: "buffer" })?;
        if !record.cpu_accessible {
            return Err(BackendError::invalid("mapping a buffer without host access"));
        }
        if record.mapped.is_null() {
            let pointer = unsafe {
                device
                    .map_memory(record.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(BackendError::Api)?
            };
            record.mapped = pointer.cast();
        }
        Ok(record.mapped)
    }

    fn unmap_buffer(&self, _buffer: BufferId) {
        // Mappings are persistent; the memory unmaps when the buffer dies.
    }

    fn flush_mapped_buffer(&self, buffer: BufferId, _offset: u64, _size: u64) -> BackendResult<()> {
        // Host-visible allocations are coherent, so writes need no flush.
        self.shared.buffer_handle(buffer)?;
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        if let Some(record) = self.shared.tables().buffers.remove(buffer) {
            let device = self.shared.context.device();
            unsafe {
                device.destroy_buffer(record.buffer, None);
                device.free_memory(record.memory, None);
            }
        }
    }

    fn map_image(&self, image: ImageId) -> BackendResult<*mut u8> {
        let device = self.shared.context.device();
        let mut tables = self.shared.tables();
        let record = tables
            .images
            .get_mut(image)
            .ok_or(BackendError::StaleHandle { kind: "image" })?;
        if !record.cpu_accessible || record.memory == vk::DeviceMemory::null() {
            return Err(BackendError::invalid("mapping a non-linear image"));
        }
        if record.mapped.is_null() {
            let pointer = unsafe {
                device
                    .map_memory(record.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(BackendError::Api)?
            };
            record.mapped = pointer.cast();
        }
        Ok(record.mapped)
    }

    fn unmap_image(&self, _image: ImageId) {}

    fn image_row_pitch(&self, image: ImageId, mip_level: u32) -> BackendResult<u64> {
        let device = self.shared.context.device();
        let tables = self.shared.tables();
        let record = tables
            .images
            .get(image)
            .ok_or(BackendError::StaleHandle { kind: "image" })?;
        let aspect = if record.aspect.contains(vk::ImageAspectFlags::COLOR) {
            vk::ImageAspectFlags::COLOR
        } else {
            vk::ImageAspectFlags::DEPTH
        };
        let layout = unsafe {
            device.get_image_subresource_layout(
                record.image,
                vk::ImageSubresource {
                    aspect_mask: aspect,
                    mip_level,
                    array_layer: 0,
                },
            )
        };
        Ok(layout.row_pitch)
    }

    fn create_sampler(&self, desc: &SamplerCreateInfo) -> BackendResult<SamplerId> {
        let sampler = self.build_sampler(desc, None)?;
        Ok(self.shared.tables().samplers.insert(sampler))
    }

    fn create_sampler_with_conversion(
        &self,
        desc: &SamplerCreateInfo,
        conversion: ConversionId,
    ) -> BackendResult<SamplerId> {
        let handle = self.shared.conversion_handle(conversion)?;
        let sampler = self.build_sampler(desc, Some(handle))?;
        Ok(self.shared.tables().samplers.insert(sampler))
    }

    fn destroy_sampler(&self, sampler: SamplerId) {
        if let Some(handle) = self.shared.tables().samplers.remove(sampler) {
            unsafe { self.shared.context.device().destroy_sampler(handle, None) };
        }
    }

    fn create_shader_module(&self, spirv: &[u8]) -> BackendResult<ShaderId> {
        let device = self.shared.context.device();
        let words = ash::util::read_spv(&mut Cursor::new(spirv))?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module =
            unsafe { device.create_shader_module(&create_info, None).map_err(BackendError::Api)? };
        Ok(self.shared.tables().shaders.insert(module))
    }

    fn destroy_shader_module(&self, shader: ShaderId) {
        if let Some(handle) = self.shared.tables().shaders.remove(shader) {
            unsafe { self.shared.context.device().destroy_shader_module(handle, None) };
        }
    }

    fn create_render_pass(&self, desc: &RenderPassCreateInfo) -> BackendResult<RenderPassId> {
        let device = self.shared.context.device();
        let mut attachments = Vec::with_capacity(desc.attachments.len());
        let mut color_refs = Vec::new();
        let mut depth_ref = None;
        for (index, attachment) in desc.attachments.iter().enumerate() {
            let is_depth = attachment.format.has_depth();
            let attachment_layout = if is_depth {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };
            // Color results end up sampled by later passes; a loading pass
            // therefore finds its contents in that same layout.
            let rest_layout = if is_depth {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            };
            let initial_layout = if attachment.load_op == AttachmentLoadOp::Load {
                rest_layout
            } else {
                vk::ImageLayout::UNDEFINED
            };
            attachments.push(vk::AttachmentDescription {
                flags: vk::AttachmentDescriptionFlags::empty(),
                format: convert::format(attachment.format),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: convert::load_op(attachment.load_op),
                store_op: convert::store_op(attachment.store_op),
                stencil_load_op: convert::load_op(attachment.stencil_load_op),
                stencil_store_op: convert::store_op(attachment.stencil_store_op),
                initial_layout,
                final_layout: rest_layout,
            });
            let reference = vk::AttachmentReference {
                attachment: index as u32,
                layout: attachment_layout,
            };
            if is_depth {
                depth_ref = Some(reference);
            } else {
                color_refs.push(reference);
            }
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(ref depth) = depth_ref {
            subpass = subpass.depth_stencil_attachment(depth);
        }
        let subpasses = [subpass.build()];

        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                src_access_mask: vk::AccessFlags::SHADER_READ,
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
        ];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass =
            unsafe { device.create_render_pass(&create_info, None).map_err(BackendError::Api)? };
        Ok(self.shared.tables().render_passes.insert(render_pass))
    }

    fn destroy_render_pass(&self, render_pass: RenderPassId) {
        if let Some(handle) = self.shared.tables().render_passes.remove(render_pass) {
            unsafe { self.shared.context.device().destroy_render_pass(handle, None) };
        }
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> BackendResult<FramebufferId> {
        let device = self.shared.context.device();
        let mut tables = self.shared.tables();
        let render_pass = *tables
            .render_passes
            .get(desc.render_pass)
            .ok_or(BackendError::StaleHandle { kind: "render pass" })?;
        let mut views = Vec::with_capacity(desc.attachments.len());
        for attachment in &desc.attachments {
            views.push(
                *tables
                    .views
                    .get(*attachment)
                    .ok_or(BackendError::StaleHandle { kind: "image view" })?,
            );
        }
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&views)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        let framebuffer =
            unsafe { device.create_framebuffer(&create_info, None).map_err(BackendError::Api)? };
        Ok(tables.framebuffers.insert(framebuffer))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) {
        if let Some(handle) = self.shared.tables().framebuffers.remove(framebuffer) {
            unsafe { self.shared.context.device().destroy_framebuffer(handle, None) };
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> BackendResult<PipelineId> {
        let device = self.shared.context.device();
        let support = self.shared.context.support();

        let (render_pass, stage_modules) = {
            let tables = self.shared.tables();
            let render_pass = *tables
                .render_passes
                .get(desc.render_pass)
                .ok_or(BackendError::StaleHandle { kind: "render pass" })?;
            let mut modules = Vec::with_capacity(desc.stages.len());
            for stage in &desc.stages {
                modules.push(
                    *tables
                        .shaders
                        .get(stage.module)
                        .ok_or(BackendError::StaleHandle { kind: "shader" })?,
                );
            }
            (render_pass, modules)
        };

        let entry_points: Vec<CString> = desc
            .stages
            .iter()
            .map(|stage| CString::new(stage.entry_point.as_str()))
            .collect::<Result<_, _>>()
            .map_err(|_| BackendError::invalid("entry point contains a nul byte"))?;
        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .zip(&stage_modules)
            .zip(&entry_points)
            .map(|((stage, module), entry_point)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(match stage.stage {
                        PipelineStage::Vertex => vk::ShaderStageFlags::VERTEX,
                        PipelineStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
                    })
                    .module(*module)
                    .name(entry_point)
                    .build()
            })
            .collect();

        let bindings: Vec<vk::VertexInputBindingDescription> = desc
            .vertex_input
            .buffer_bindings
            .iter()
            .enumerate()
            .map(|(index, binding)| vk::VertexInputBindingDescription {
                binding: index as u32,
                stride: binding.stride,
                input_rate: match binding.input_rate {
                    VertexInputRate::PerVertex => vk::VertexInputRate::VERTEX,
                    VertexInputRate::PerInstance => vk::VertexInputRate::INSTANCE,
                },
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_input
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: convert::vertex_format(attribute.format),
                offset: attribute.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(convert::topology(desc.input_assembly.topology))
            .primitive_restart_enable(desc.input_assembly.primitive_restart_enable);

        let static_viewport = desc
            .viewport
            .as_ref()
            .map(|state| ([convert::viewport(state.viewport)], [convert::rect(state.scissor)]));
        let mut viewport_state =
            vk::PipelineViewportStateCreateInfo::builder().viewport_count(1).scissor_count(1);
        if let Some((viewports, scissors)) = &static_viewport {
            viewport_state = viewport_state.viewports(viewports).scissors(scissors);
        }

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(convert::polygon_mode(desc.rasterization.polygon_mode))
            .cull_mode(convert::cull_mode(desc.rasterization.cull_mode))
            .front_face(convert::front_face(desc.rasterization.front_face))
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(sample_count(desc.multisample.sample_count));

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_stencil.depth_test_enable)
            .depth_write_enable(desc.depth_stencil.depth_write_enable)
            .depth_compare_op(convert::compare_op(desc.depth_stencil.depth_compare_op))
            .depth_bounds_test_enable(desc.depth_stencil.depth_bounds_test_enable)
            .min_depth_bounds(desc.depth_stencil.min_depth_bounds)
            .max_depth_bounds(desc.depth_stencil.max_depth_bounds)
            .stencil_test_enable(desc.depth_stencil.stencil_test_enable)
            .front(stencil_op_state(&desc.depth_stencil.front))
            .back(stencil_op_state(&desc.depth_stencil.back));

        let blend = &desc.color_blend;
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(blend.blend_enable)
            .src_color_blend_factor(convert::blend_factor(blend.src_color_blend_factor))
            .dst_color_blend_factor(convert::blend_factor(blend.dst_color_blend_factor))
            .color_blend_op(convert::blend_op(blend.color_blend_op))
            .src_alpha_blend_factor(convert::blend_factor(blend.src_alpha_blend_factor))
            .dst_alpha_blend_factor(convert::blend_factor(blend.dst_alpha_blend_factor))
            .alpha_blend_op(convert::blend_op(blend.alpha_blend_op))
            .color_write_mask(convert::color_components(blend.color_component_write_bits))
            .build()];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(blend.logic_op_enable)
            .logic_op(convert::logic_op(blend.logic_op))
            .attachments(&blend_attachments)
            .blend_constants(blend.blend_constants);

        let mut dynamic_states = vec![
            vk::DynamicState::STENCIL_COMPARE_MASK,
            vk::DynamicState::STENCIL_WRITE_MASK,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        if desc.viewport.is_none() {
            dynamic_states.push(vk::DynamicState::VIEWPORT);
            dynamic_states.push(vk::DynamicState::SCISSOR);
        }
        if support.extended_dynamic_state {
            dynamic_states.extend([
                vk::DynamicState::DEPTH_TEST_ENABLE_EXT,
                vk::DynamicState::DEPTH_WRITE_ENABLE_EXT,
                vk::DynamicState::DEPTH_COMPARE_OP_EXT,
                vk::DynamicState::STENCIL_TEST_ENABLE_EXT,
                vk::DynamicState::STENCIL_OP_EXT,
            ]);
        }
        if support.extended_dynamic_state3 {
            dynamic_states.extend([
                vk::DynamicState::COLOR_BLEND_ENABLE_EXT,
                vk::DynamicState::COLOR_BLEND_EQUATION_EXT,
                vk::DynamicState::COLOR_WRITE_MASK_EXT,
            ]);
            if support.advanced_blend {
                dynamic_states.push(vk::DynamicState::COLOR_BLEND_ADVANCED_EXT);
            }
        }
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(self.shared.pipeline_layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let cache = self.shared.pipeline_cache();
        let pipelines = unsafe {
            device
                .create_graphics_pipelines(*cache, &[create_info], None)
                .map_err(|(_, err)| BackendError::Api(err))?
        };
        drop(cache);
        Ok(self.shared.tables().pipelines.insert(pipelines[0]))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        if let Some(handle) = self.shared.tables().pipelines.remove(pipeline) {
            unsafe { self.shared.context.device().destroy_pipeline(handle, None) };
        }
    }

    fn pipeline_cache_data(&self) -> BackendResult<Vec<u8>> {
        let device = self.shared.context.device();
        let cache = self.shared.pipeline_cache();
        unsafe { device.get_pipeline_cache_data(*cache).map_err(BackendError::Api) }
    }

    fn seed_pipeline_cache(&self, data: &[u8]) -> BackendResult<()> {
        let device = self.shared.context.device();
        let create_info = vk::PipelineCacheCreateInfo::builder().initial_data(data);
        let seeded =
            unsafe { device.create_pipeline_cache(&create_info, None).map_err(BackendError::Api)? };
        let mut cache = self.shared.pipeline_cache();
        unsafe { device.destroy_pipeline_cache(*cache, None) };
        *cache = seeded;
        Ok(())
    }

    fn register_surface(&self, desc: &SurfaceDesc) -> BackendResult<SurfaceId> {
        let device = self.shared.context.device();
        let buffer_count = desc.buffer_count.max(1);
        let mut buffers: Vec<SurfaceBuffer> = Vec::with_capacity(buffer_count as usize);
        let format = convert::format(desc.format);

        let destroy_partial = |buffers: &mut Vec<SurfaceBuffer>| {
            for buffer in buffers.drain(..) {
                unsafe {
                    device.destroy_image_view(buffer.view, None);
                    device.destroy_image(buffer.image, None);
                    device.free_memory(buffer.memory, None);
                }
            }
        };

        for _ in 0..buffer_count {
            let image_info = vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .format(format)
                .extent(vk::Extent3D {
                    width: desc.extent.width,
                    height: desc.extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::SAMPLED
                        | vk::ImageUsageFlags::TRANSFER_SRC,
                )
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            let image = match unsafe { device.create_image(&image_info, None) } {
                Ok(image) => image,
                Err(err) => {
                    destroy_partial(&mut buffers);
                    return Err(BackendError::Api(err));
                }
            };
            let memory = match self.allocate_bound_image_memory(image, false) {
                Ok(memory) => memory,
                Err(err) => {
                    unsafe { device.destroy_image(image, None) };
                    destroy_partial(&mut buffers);
                    return Err(err);
                }
            };
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = match unsafe { device.create_image_view(&view_info, None) } {
                Ok(view) => view,
                Err(err) => {
                    unsafe {
                        device.destroy_image(image, None);
                        device.free_memory(memory, None);
                    }
                    destroy_partial(&mut buffers);
                    return Err(BackendError::Api(err));
                }
            };
            buffers.push(SurfaceBuffer {
                image,
                memory,
                view,
                framebuffer: None,
            });
        }

        Ok(self.shared.tables().surfaces.insert(SurfaceRecord {
            extent: convert::extent(desc.extent),
            buffers,
            current: 0,
        }))
    }

    fn unregister_surface(&self, surface: SurfaceId) {
        let mut tables = self.shared.tables();
        if let Some(record) = tables.surfaces.remove(surface) {
            self.shared.destroy_surface_buffers(&mut tables, record.buffers);
        }
    }

    fn surface_framebuffer(
        &self,
        surface: SurfaceId,
        render_pass: RenderPassId,
    ) -> BackendResult<FramebufferId> {
        let device = self.shared.context.device();
        let mut tables = self.shared.tables();
        let pass_handle = *tables
            .render_passes
            .get(render_pass)
            .ok_or(BackendError::StaleHandle { kind: "render pass" })?;

        let record = tables
            .surfaces
            .get(surface)
            .ok_or(BackendError::StaleHandle { kind: "surface" })?;
        let current = record.current;
        let extent = record.extent;
        let buffer = &record.buffers[current];
        if let Some((pass, framebuffer)) = buffer.framebuffer {
            if pass == render_pass {
                return Ok(framebuffer);
            }
        }
        let stale = buffer.framebuffer;
        let view = buffer.view;

        if let Some((_, framebuffer)) = stale {
            if let Some(handle) = tables.framebuffers.remove(framebuffer) {
                unsafe { device.destroy_framebuffer(handle, None) };
            }
        }

        let views = [view];
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(pass_handle)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer =
            unsafe { device.create_framebuffer(&create_info, None).map_err(BackendError::Api)? };
        let id = tables.framebuffers.insert(framebuffer);
        if let Some(record) = tables.surfaces.get_mut(surface) {
            record.buffers[current].framebuffer = Some((render_pass, id));
        }
        Ok(id)
    }

    fn advance_surface(&self, surface: SurfaceId) -> BackendResult<()> {
        let mut tables = self.shared.tables();
        let record = tables
            .surfaces
            .get_mut(surface)
            .ok_or(BackendError::StaleHandle { kind: "surface" })?;
        record.current = (record.current + 1) % record.buffers.len().max(1);
        Ok(())
    }

    fn create_encoder(&self) -> BackendResult<Box<dyn CommandEncoder>> {
        self.shared.reclaim_completed();
        let device = self.shared.context.device();
        let pool = self.shared.command_pool();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers =
            unsafe { device.allocate_command_buffers(&alloc_info).map_err(BackendError::Api)? };
        drop(pool);
        Ok(Box::new(encoder::VulkanEncoder::new(Arc::clone(&self.shared), buffers[0])))
    }

    fn submit(&self, commands: Vec<EncodedCommands>, signal: Option<FenceId>) -> BackendResult<()> {
        self.shared.reclaim_completed();
        let device = self.shared.context.device();
        let queue = self.shared.context.queue();
        let user_fence = match signal {
            Some(fence) => Some(self.shared.fence_handle(fence)?),
            None => None,
        };

        let mut submissions = self.shared.submissions();
        let mut buffers = Vec::with_capacity(commands.len());
        for encoding in commands {
            let command_buffer = submissions
                .finished
                .remove(&encoding.0)
                .ok_or_else(|| BackendError::invalid("submitted an unknown encoding"))?;
            buffers.push(command_buffer);
        }

        if !buffers.is_empty() {
            let fence_info = vk::FenceCreateInfo::builder();
            let reclaim_fence =
                unsafe { device.create_fence(&fence_info, None).map_err(BackendError::Api)? };
            let submit_info = vk::SubmitInfo::builder().command_buffers(&buffers).build();
            if let Err(err) =
                unsafe { device.queue_submit(queue, &[submit_info], reclaim_fence) }
            {
                unsafe { device.destroy_fence(reclaim_fence, None) };
                return Err(BackendError::Api(err));
            }
            submissions.in_flight.push(InFlight { fence: reclaim_fence, buffers });
        }

        // The signal fence rides an empty batch so it lands after every
        // command buffer submitted above.
        if let Some(fence) = user_fence {
            unsafe { device.queue_submit(queue, &[], fence).map_err(BackendError::Api)? };
        }
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceId> {
        let device = self.shared.context.device();
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence =
            unsafe { device.create_fence(&create_info, None).map_err(BackendError::Api)? };
        Ok(self.shared.tables().fences.insert(fence))
    }

    fn wait_for_fence(&self, fence: FenceId, timeout_ns: u64) -> BackendResult<bool> {
        let device = self.shared.context.device();
        let fence = self.shared.fence_handle(fence)?;
        match unsafe { device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(BackendError::Api(err)),
        }
    }

    fn reset_fence(&self, fence: FenceId) -> BackendResult<()> {
        let device = self.shared.context.device();
        let fence = self.shared.fence_handle(fence)?;
        unsafe { device.reset_fences(&[fence]).map_err(BackendError::Api) }
    }

    fn destroy_fence(&self, fence: FenceId) {
        if let Some(handle) = self.shared.tables().fences.remove(fence) {
            unsafe { self.shared.context.device().destroy_fence(handle, None) };
        }
    }

    fn wait_idle(&self) -> BackendResult<()> {
        {
            let _submissions = self.shared.submissions();
            self.shared.context.wait_idle()?;
        }
        self.shared.reclaim_completed();
        Ok(())
    }
}
