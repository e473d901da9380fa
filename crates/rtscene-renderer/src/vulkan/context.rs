//! Vulkan context: instance, surface, physical device, logical device, and queues.

use ash::{vk, Entry, Instance, Device};
use ash::khr::{surface, swapchain};
use ash::khr::{acceleration_structure, ray_tracing_pipeline, deferred_host_operations};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::os::raw::c_char;

use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};
use crate::error::{RenderError, RenderResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions the renderer cannot run without.
const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 6] = [
    swapchain::NAME,
    acceleration_structure::NAME,
    ray_tracing_pipeline::NAME,
    deferred_host_operations::NAME,
    vk::KHR_BUFFER_DEVICE_ADDRESS_NAME,
    vk::EXT_DESCRIPTOR_INDEXING_NAME,
];

/// Ray tracing limits of the selected physical device.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub min_scratch_offset_alignment: u32,
}

/// Ray tracing entry points, resolved once when the device is created.
///
/// Builders and the pipeline receive a clone of this instead of looking up
/// extension functions themselves.
#[derive(Clone)]
pub struct RtLoaders {
    pub acceleration_structure: acceleration_structure::Device,
    pub pipeline: ray_tracing_pipeline::Device,
    pub properties: RtProperties,
}

/// Device features the renderer and its shaders rely on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSupport {
    pub acceleration_structure: bool,
    pub ray_tracing_pipeline: bool,
    pub buffer_device_address: bool,
    pub descriptor_indexing: bool,
    pub runtime_descriptor_array: bool,
    // Vertex and index fetch in the closest-hit shader uses scalar layout
    pub scalar_block_layout: bool,
    pub shader_int64: bool,
    pub storage_image_write_without_format: bool,
}

impl FeatureSupport {
    /// Names of the required features the device lacks.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            ("accelerationStructure", self.acceleration_structure),
            ("rayTracingPipeline", self.ray_tracing_pipeline),
            ("bufferDeviceAddress", self.buffer_device_address),
            ("descriptorIndexing", self.descriptor_indexing),
            ("runtimeDescriptorArray", self.runtime_descriptor_array),
            ("scalarBlockLayout", self.scalar_block_layout),
            ("shaderInt64", self.shader_int64),
            ("shaderStorageImageWriteWithoutFormat", self.storage_image_write_without_format),
        ]
        .into_iter()
        .filter(|&(_, supported)| !supported)
        .map(|(name, _)| name)
        .collect()
    }
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.graphics.into_iter().collect();
        if let Some(present) = self.present {
            if !families.contains(&present) {
                families.push(present);
            }
        }
        families
    }
}

/// Main Vulkan context holding all core Vulkan objects.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_families: QueueFamilyIndices,

    // Queues
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    // Extension loaders
    pub surface_loader: surface::Instance,
    pub swapchain_loader: swapchain::Device,
    pub rt: RtLoaders,

    pub device_properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanContext {
    /// Create a new Vulkan context bound to a window surface.
    ///
    /// # Safety
    /// The window handles must be valid and outlive the context.
    pub unsafe fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        enable_validation: bool,
    ) -> RenderResult<Self> {
        let entry = Entry::linked();

        let api_version = entry.try_enumerate_instance_version()
            .map_err(|e| RenderError::creation("instance version query", e))?
            .unwrap_or(vk::API_VERSION_1_0);

        if api_version < REQUIRED_VK_VERSION {
            return Err(RenderError::Unsupported(format!(
                "Vulkan 1.2 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let instance = Self::create_instance(&entry, display_handle, enable_validation)?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug_utils) => Some(debug_utils),
                Err(e) => {
                    Self::destroy_instance(&instance, None);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = match ash_window::create_surface(&entry, &instance, display_handle, window_handle, None) {
            Ok(surface) => surface,
            Err(e) => {
                Self::destroy_instance(&instance, debug_utils);
                return Err(RenderError::creation("window surface", e));
            }
        };

        let selected = Self::pick_physical_device(&instance, &surface_loader, surface)
            .and_then(|(physical_device, queue_families)| {
                let graphics_family = queue_families.graphics
                    .ok_or_else(|| RenderError::Unsupported("no graphics queue family".into()))?;
                let device = Self::create_logical_device(&instance, physical_device, &queue_families)?;
                Ok((physical_device, queue_families, graphics_family, device))
            });
        let (physical_device, queue_families, graphics_family, device) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                surface_loader.destroy_surface(surface, None);
                Self::destroy_instance(&instance, debug_utils);
                return Err(e);
            }
        };

        let device_properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let properties = Self::query_rt_properties(&instance, physical_device);

        let present_family = queue_families.present.unwrap_or(graphics_family);
        let graphics_queue = device.get_device_queue(graphics_family, 0);
        let present_queue = device.get_device_queue(present_family, 0);

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let rt = RtLoaders {
            acceleration_structure: acceleration_structure::Device::new(&instance, &device),
            pipeline: ray_tracing_pipeline::Device::new(&instance, &device),
            properties,
        };

        log::info!(
            "Ray tracing: handle size {}, handle alignment {}, base alignment {}, max recursion {}",
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            properties.shader_group_base_alignment,
            properties.max_ray_recursion_depth
        );

        Ok(Self {
            entry,
            instance,
            surface,
            physical_device,
            device,
            queue_families,
            graphics_queue,
            present_queue,
            surface_loader,
            swapchain_loader,
            rt,
            device_properties,
            memory_properties,
            debug_utils,
        })
    }

    /// Create Vulkan instance with the window system's surface extensions.
    unsafe fn create_instance(
        entry: &Entry,
        display_handle: RawDisplayHandle,
        enable_validation: bool,
    ) -> RenderResult<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|e| RenderError::creation("surface extension list", e))?
            .to_vec();

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<*const c_char> = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        entry.create_instance(&create_info, None)
            .map_err(|e| RenderError::creation("Vulkan instance", e))
    }

    /// Route validation layer output into the log.
    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> RenderResult<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR |
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING |
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL |
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION |
                vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| RenderError::creation("debug messenger", e))?;

        Ok((debug_utils, messenger))
    }

    /// Select the best ray tracing capable physical device.
    unsafe fn pick_physical_device(
        instance: &Instance,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> RenderResult<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = instance.enumerate_physical_devices()
            .map_err(|e| RenderError::creation("physical device list", e))?;

        if devices.is_empty() {
            return Err(RenderError::Unsupported("no Vulkan-capable GPU found".into()));
        }

        let mut scored_devices: Vec<_> = devices.iter()
            .filter_map(|&device| {
                let score = Self::rate_device(instance, device, surface_loader, surface);
                (score > 0).then_some((device, score))
            })
            .collect();

        scored_devices.sort_by(|a, b| b.1.cmp(&a.1));

        let Some(&(physical_device, _)) = scored_devices.first() else {
            return Err(RenderError::Unsupported(
                "no GPU supports hardware ray tracing and presentation".into(),
            ));
        };

        let queue_families = Self::find_queue_families(instance, physical_device, surface_loader, surface);

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        log::info!("Selected GPU: {} ({:?})", name, props.device_type);

        Ok((physical_device, queue_families))
    }

    /// Rate a physical device (higher is better, zero means unusable).
    unsafe fn rate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> u32 {
        let props = instance.get_physical_device_properties(device);

        if props.api_version < REQUIRED_VK_VERSION {
            return 0;
        }

        if !Self::supports_extensions(instance, device) {
            return 0;
        }

        let missing = Self::query_features(instance, device).missing();
        if !missing.is_empty() {
            let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
            log::debug!("Skipping {}: missing {}", name, missing.join(", "));
            return 0;
        }

        if !Self::find_queue_families(instance, device, surface_loader, surface).is_complete() {
            return 0;
        }

        let mut score = 1u32;

        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        // MB of VRAM
        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score = score.saturating_add((heap.size / (1024 * 1024)) as u32);
            }
        }

        score
    }

    unsafe fn supports_extensions(instance: &Instance, device: vk::PhysicalDevice) -> bool {
        let Ok(available) = instance.enumerate_device_extension_properties(device) else {
            return false;
        };

        REQUIRED_DEVICE_EXTENSIONS.iter().all(|required| {
            available.iter().any(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr()) == *required
            })
        })
    }

    unsafe fn query_features(instance: &Instance, device: vk::PhysicalDevice) -> FeatureSupport {
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut rt_features)
            .push_next(&mut vulkan_12_features);

        instance.get_physical_device_features2(device, &mut features2);
        let core = features2.features;

        FeatureSupport {
            acceleration_structure: accel_features.acceleration_structure == vk::TRUE,
            ray_tracing_pipeline: rt_features.ray_tracing_pipeline == vk::TRUE,
            buffer_device_address: vulkan_12_features.buffer_device_address == vk::TRUE,
            descriptor_indexing: vulkan_12_features.descriptor_indexing == vk::TRUE,
            runtime_descriptor_array: vulkan_12_features.runtime_descriptor_array == vk::TRUE,
            scalar_block_layout: vulkan_12_features.scalar_block_layout == vk::TRUE,
            shader_int64: core.shader_int64 == vk::TRUE,
            storage_image_write_without_format: core.shader_storage_image_write_without_format == vk::TRUE,
        }
    }

    /// Find queue family indices, preferring one family for both roles.
    unsafe fn find_queue_families(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> QueueFamilyIndices {
        let families = instance.get_physical_device_queue_family_properties(device);
        let mut indices = QueueFamilyIndices::default();

        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = surface_loader
                .get_physical_device_surface_support(device, i, surface)
                .unwrap_or(false);

            if graphics && present {
                indices.graphics = Some(i);
                indices.present = Some(i);
                break;
            }
            if graphics && indices.graphics.is_none() {
                indices.graphics = Some(i);
            }
            if present && indices.present.is_none() {
                indices.present = Some(i);
            }
        }

        indices
    }

    unsafe fn query_rt_properties(instance: &Instance, device: vk::PhysicalDevice) -> RtProperties {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut accel_props);

        instance.get_physical_device_properties2(device, &mut props2);

        RtProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            min_scratch_offset_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
        }
    }

    /// Create logical device with ray tracing features and extensions.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
    ) -> RenderResult<Device> {
        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<_> = queue_families.unique().into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions: Vec<*const c_char> = REQUIRED_DEVICE_EXTENSIONS.iter()
            .map(|name| name.as_ptr())
            .collect();

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .scalar_block_layout(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);

        // The output image is written without a format qualifier so it can
        // match whatever format the swapchain uses
        let device_features = vk::PhysicalDeviceFeatures::default()
            .shader_int64(true)
            .shader_storage_image_write_without_format(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(device_features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        instance.create_device(physical_device, &create_info, None)
            .map_err(|e| RenderError::creation("logical device", e))
    }

    /// Destroy the debug messenger, if any, then the instance.
    unsafe fn destroy_instance(
        instance: &Instance,
        debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    ) {
        if let Some((loader, messenger)) = debug_utils {
            loader.destroy_debug_utils_messenger(messenger, None);
        }
        instance.destroy_instance(None);
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe {
            self.device.device_wait_idle()
                .map_err(|e| RenderError::device_lost("device wait idle", e))
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            Self::destroy_instance(&self.instance, self.debug_utils.take());
        }
    }
}

/// Debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!(target: "vulkan", "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!(target: "vulkan", "{}", message);
    } else {
        log::debug!(target: "vulkan", "{}", message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_families_shared() {
        let families = QueueFamilyIndices { graphics: Some(0), present: Some(0) };
        assert!(families.is_complete());
        assert_eq!(families.unique(), vec![0]);
    }

    #[test]
    fn test_unique_families_split() {
        let families = QueueFamilyIndices { graphics: Some(0), present: Some(2) };
        assert_eq!(families.unique(), vec![0, 2]);
    }

    #[test]
    fn test_incomplete_without_present() {
        let families = QueueFamilyIndices { graphics: Some(1), present: None };
        assert!(!families.is_complete());
    }

    fn all_features() -> FeatureSupport {
        FeatureSupport {
            acceleration_structure: true,
            ray_tracing_pipeline: true,
            buffer_device_address: true,
            descriptor_indexing: true,
            runtime_descriptor_array: true,
            scalar_block_layout: true,
            shader_int64: true,
            storage_image_write_without_format: true,
        }
    }

    #[test]
    fn test_full_feature_set_has_nothing_missing() {
        assert!(all_features().missing().is_empty());
    }

    #[test]
    fn test_scalar_block_layout_required() {
        let features = FeatureSupport { scalar_block_layout: false, ..all_features() };
        assert_eq!(features.missing(), vec!["scalarBlockLayout"]);
    }

    #[test]
    fn test_shader_features_required() {
        let features = FeatureSupport {
            shader_int64: false,
            storage_image_write_without_format: false,
            ..all_features()
        };
        assert_eq!(features.missing(), vec!["shaderInt64", "shaderStorageImageWriteWithoutFormat"]);
    }

    #[test]
    fn test_no_features_lists_everything() {
        assert_eq!(FeatureSupport::default().missing().len(), 8);
    }

    #[test]
    fn test_required_extensions_include_ray_tracing() {
        assert!(REQUIRED_DEVICE_EXTENSIONS.contains(&acceleration_structure::NAME));
        assert!(REQUIRED_DEVICE_EXTENSIONS.contains(&ray_tracing_pipeline::NAME));
        assert!(REQUIRED_DEVICE_EXTENSIONS.contains(&swapchain::NAME));
    }
}
