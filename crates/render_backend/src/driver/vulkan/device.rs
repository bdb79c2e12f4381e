//! Vulkan instance and logical device bring-up.
//!
//! The backend renders into its own buffered images, so no presentation
//! surface or swapchain is created here. A Vulkan 1.1 loader is required;
//! sampler YCbCr conversion and `vkBindImageMemory2` come from core 1.1.

use ash::{Device, Entry, Instance};
#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::extensions::ext::{ExtendedDynamicState, ExtendedDynamicState3};
use ash::extensions::khr::{ExternalMemoryFd, PushDescriptor};
use ash::vk;
use std::ffi::{CStr, CString};

use crate::error::{BackendError, BackendResult};

/// Optional device capabilities discovered at startup.
///
/// Core rendering works without any of these. Missing capabilities cause the
/// corresponding driver operations to fail with [`BackendError::Unsupported`]
/// rather than preventing device creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionSupport {
    /// VK_KHR_push_descriptor, used for all resource binding.
    pub push_descriptor: bool,
    /// VK_EXT_extended_dynamic_state, depth/stencil toggles without pipeline
    /// variants.
    pub extended_dynamic_state: bool,
    /// VK_EXT_extended_dynamic_state3, dynamic color blend state.
    pub extended_dynamic_state3: bool,
    /// VK_EXT_blend_operation_advanced, the compositing blend equations.
    pub advanced_blend: bool,
    /// VK_KHR_external_memory_fd + VK_EXT_external_memory_dma_buf.
    pub external_memory: bool,
    /// Sampler YCbCr conversion feature (core 1.1, driver dependent).
    pub ycbcr_conversion: bool,
}

/// Owns the instance, logical device and extension loaders.
///
/// Dropped last inside the driver so every other Vulkan object is destroyed
/// while the device is still alive.
pub struct DeviceContext {
    /// Keeps the loaded Vulkan library alive for the instance's lifetime.
    #[allow(dead_code)]
    entry: Entry,
    instance: Instance,
    #[cfg(debug_assertions)]
    debug_utils: Option<DebugUtils>,
    #[cfg(debug_assertions)]
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: Device,
    queue_family: u32,
    queue: vk::Queue,
    support: ExtensionSupport,
    push_descriptor: Option<PushDescriptor>,
    dynamic_state: Option<ExtendedDynamicState>,
    dynamic_state3: Option<ExtendedDynamicState3>,
    external_memory_fd: Option<ExternalMemoryFd>,
}

impl DeviceContext {
    /// Create the instance, select a GPU and create the logical device.
    pub fn new(enable_validation: bool) -> BackendResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            BackendError::InitializationFailed(format!("failed to load Vulkan: {:?}", e))
        })?;

        let instance = Self::create_instance(&entry, enable_validation)?;

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let debug_messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(debug_messenger))
        } else {
            (None, None)
        };

        let (physical_device, queue_family) = Self::pick_physical_device(&instance)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!("Selected GPU: {}", unsafe {
            CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy()
        });

        let mut support = Self::probe_extensions(&instance, physical_device)?;
        support.ycbcr_conversion = Self::probe_ycbcr_feature(&instance, physical_device);

        let device = Self::create_device(&instance, physical_device, queue_family, &support)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let push_descriptor =
            support.push_descriptor.then(|| PushDescriptor::new(&instance, &device));
        let dynamic_state = support
            .extended_dynamic_state
            .then(|| ExtendedDynamicState::new(&instance, &device));
        let dynamic_state3 = support
            .extended_dynamic_state3
            .then(|| ExtendedDynamicState3::new(&instance, &device));
        let external_memory_fd =
            support.external_memory.then(|| ExternalMemoryFd::new(&instance, &device));

        log::info!(
            "Device capabilities: push_descriptor={} dynamic_state={} dynamic_state3={} \
             advanced_blend={} external_memory={} ycbcr={}",
            support.push_descriptor,
            support.extended_dynamic_state,
            support.extended_dynamic_state3,
            support.advanced_blend,
            support.external_memory,
            support.ycbcr_conversion,
        );

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
            physical_device,
            properties,
            memory_properties,
            device,
            queue_family,
            queue,
            support,
            push_descriptor,
            dynamic_state,
            dynamic_state3,
            external_memory_fd,
        })
    }

    fn create_instance(entry: &Entry, enable_validation: bool) -> BackendResult<Instance> {
        let app_name = CString::new("render_backend").map_err(|_| {
            BackendError::InitializationFailed("invalid application name".to_string())
        })?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&app_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        #[allow(unused_mut)]
        let mut extensions: Vec<*const i8> = Vec::new();

        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if cfg!(debug_assertions) && enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").map_err(|_| {
                BackendError::InitializationFailed("invalid layer name".to_string())
            })?]
        } else {
            vec![]
        };
        let layer_names_ptrs: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        unsafe { entry.create_instance(&create_info, None).map_err(BackendError::Api) }
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(
        debug_utils: &DebugUtils,
    ) -> BackendResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(BackendError::Api)
        }
    }

    /// Prefer a discrete GPU, fall back to anything with a graphics queue.
    fn pick_physical_device(instance: &Instance) -> BackendResult<(vk::PhysicalDevice, u32)> {
        let devices =
            unsafe { instance.enumerate_physical_devices().map_err(BackendError::Api)? };

        let mut best: Option<(vk::PhysicalDevice, u32, u32)> = None;
        for device in devices {
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let graphics_family = queue_families
                .iter()
                .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS));
            let Some(graphics_family) = graphics_family else {
                continue;
            };

            let properties = unsafe { instance.get_physical_device_properties(device) };
            let score = match properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 2,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                _ => 0,
            };

            if best.map_or(true, |(_, _, best_score)| score > best_score) {
                best = Some((device, graphics_family as u32, score));
            }
        }

        best.map(|(device, family, _)| (device, family)).ok_or_else(|| {
            BackendError::InitializationFailed("no GPU with a graphics queue found".to_string())
        })
    }

    fn probe_extensions(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> BackendResult<ExtensionSupport> {
        let available = unsafe {
            instance
                .enumerate_device_extension_properties(physical_device)
                .map_err(BackendError::Api)?
        };
        let has = |name: &CStr| {
            available.iter().any(|ext| {
                let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                ext_name == name
            })
        };

        Ok(ExtensionSupport {
            push_descriptor: has(PushDescriptor::name()),
            extended_dynamic_state: has(ExtendedDynamicState::name()),
            extended_dynamic_state3: has(ExtendedDynamicState3::name()),
            advanced_blend: has(vk::ExtBlendOperationAdvancedFn::name()),
            external_memory: has(ExternalMemoryFd::name())
                && has(vk::ExtExternalMemoryDmaBufFn::name()),
            ycbcr_conversion: false,
        })
    }

    fn probe_ycbcr_feature(instance: &Instance, physical_device: vk::PhysicalDevice) -> bool {
        let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder().push_next(&mut ycbcr);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
        ycbcr.sampler_ycbcr_conversion == vk::TRUE
    }

    fn create_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        support: &ExtensionSupport,
    ) -> BackendResult<Device> {
        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];

        let mut extensions: Vec<*const i8> = Vec::new();
        if support.push_descriptor {
            extensions.push(PushDescriptor::name().as_ptr());
        }
        if support.extended_dynamic_state {
            extensions.push(ExtendedDynamicState::name().as_ptr());
        }
        if support.extended_dynamic_state3 {
            extensions.push(ExtendedDynamicState3::name().as_ptr());
        }
        if support.advanced_blend {
            extensions.push(vk::ExtBlendOperationAdvancedFn::name().as_ptr());
        }
        if support.external_memory {
            extensions.push(ExternalMemoryFd::name().as_ptr());
            extensions.push(vk::ExtExternalMemoryDmaBufFn::name().as_ptr());
        }

        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE)
            .build();

        let mut ycbcr_features = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::builder()
            .sampler_ycbcr_conversion(true);
        let mut dynamic_state_features =
            vk::PhysicalDeviceExtendedDynamicStateFeaturesEXT::builder()
                .extended_dynamic_state(true);
        let mut dynamic_state3_features =
            vk::PhysicalDeviceExtendedDynamicState3FeaturesEXT::builder()
                .extended_dynamic_state3_color_blend_enable(true)
                .extended_dynamic_state3_color_blend_equation(true)
                .extended_dynamic_state3_color_write_mask(true)
                .extended_dynamic_state3_color_blend_advanced(support.advanced_blend);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&device_features);
        if support.ycbcr_conversion {
            create_info = create_info.push_next(&mut ycbcr_features);
        }
        if support.extended_dynamic_state {
            create_info = create_info.push_next(&mut dynamic_state_features);
        }
        if support.extended_dynamic_state3 {
            create_info = create_info.push_next(&mut dynamic_state3_features);
        }

        unsafe {
            instance
                .create_device(physical_device, &create_info, None)
                .map_err(BackendError::Api)
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Queue handle. Submission order is serialized by the caller.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn support(&self) -> ExtensionSupport {
        self.support
    }

    pub fn push_descriptor(&self) -> Option<&PushDescriptor> {
        self.push_descriptor.as_ref()
    }

    pub fn dynamic_state(&self) -> Option<&ExtendedDynamicState> {
        self.dynamic_state.as_ref()
    }

    pub fn dynamic_state3(&self) -> Option<&ExtendedDynamicState3> {
        self.dynamic_state3.as_ref()
    }

    pub fn external_memory_fd(&self) -> Option<&ExternalMemoryFd> {
        self.external_memory_fd.as_ref()
    }

    /// Find a memory type matching both the requirement bits and the
    /// requested properties.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> BackendResult<u32> {
        for i in 0..self.memory_properties.memory_type_count {
            let type_matches = type_bits & (1 << i) != 0;
            let property_matches = self.memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required);
            if type_matches && property_matches {
                return Ok(i);
            }
        }
        Err(BackendError::invalid(format!(
            "no memory type matching bits {:#x} with {:?}",
            type_bits, required
        )))
    }

    pub fn wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle().map_err(BackendError::Api) }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);

            #[cfg(debug_assertions)]
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, &self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Routes validation layer output into the logging framework.
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}
