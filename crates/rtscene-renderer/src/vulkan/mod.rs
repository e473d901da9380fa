//! Vulkan 1.2 backend with KHR ray tracing.
//!
//! Device setup, presentation, memory, command submission and the ray
//! tracing objects (acceleration structures, pipeline, shader binding table).

pub mod context;
pub mod surface;
pub mod swapchain;
pub mod memory;
pub mod commands;
pub mod descriptors;
pub mod geometry;
pub mod pipeline;
pub mod raytracing;

pub use context::{RtLoaders, VulkanContext};
pub use surface::VulkanSurface;
pub use swapchain::Swapchain;
pub use memory::{Buffer, Image, MemoryManager};
pub use commands::CommandManager;
pub use descriptors::ResourceBinder;
pub use geometry::{GeometryStore, ObjectGpuResources};
pub use pipeline::RayTracingPipeline;

use ash::vk;
use std::ffi::CStr;

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"Ray Traced Scene";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"rtscene";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);

/// Required Vulkan API version.
pub const REQUIRED_VK_VERSION: u32 = vk::API_VERSION_1_2;

/// Full subresource range of a single-mip, single-layer color image.
pub const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};
