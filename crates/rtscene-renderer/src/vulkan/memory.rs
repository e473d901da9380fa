//! GPU memory management using gpu-allocator.
//!
//! Every resource gets its own dedicated allocation. The memory type is picked
//! here (first type in the resource's mask that carries all requested property
//! flags) and handed to gpu-allocator as a single-bit mask, so the allocator
//! never substitutes a different type.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc, Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use super::{VulkanContext, COLOR_SUBRESOURCE_RANGE};
use crate::error::{RenderError, RenderResult};

/// Property set for buffers the CPU writes directly.
pub const HOST_VISIBLE_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// GPU buffer with associated memory.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl Buffer {
    /// Host pointer of a mapped (host-visible) buffer.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr()).map(|p| p.as_ptr() as *mut u8)
    }

    /// GPU address, present when the buffer was created address-capable.
    pub fn address(&self) -> RenderResult<vk::DeviceAddress> {
        self.device_address.ok_or_else(|| RenderError::HostWrite {
            reason: "buffer was created without SHADER_DEVICE_ADDRESS usage".into(),
        })
    }

    /// Copy bytes into the mapped buffer at `offset`.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> RenderResult<()> {
        let end = offset.checked_add(bytes.len()).unwrap_or(usize::MAX);
        if end as vk::DeviceSize > self.size {
            return Err(RenderError::HostWrite {
                reason: format!(
                    "{} bytes at offset {} exceed buffer size {}",
                    bytes.len(), offset, self.size
                ),
            });
        }

        let ptr = self.mapped_ptr().ok_or_else(|| RenderError::HostWrite {
            reason: "buffer memory is not host visible".into(),
        })?;

        // SAFETY: the range was checked against the buffer size and the
        // mapping stays valid for the lifetime of the allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Write a slice of plain data at the start of the buffer.
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> RenderResult<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }
}

/// GPU image with associated memory and a full-resource view.
pub struct Image {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Pick the first memory type allowed by `type_bits` whose flags contain `required`.
pub fn find_memory_type_index(
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    properties: &vk::PhysicalDeviceMemoryProperties,
) -> RenderResult<u32> {
    properties.memory_types[..properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(i, memory_type)| {
            type_bits & (1 << i) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
        .ok_or(RenderError::UnsupportedMemoryType {
            type_bits,
            properties: required,
        })
}

/// gpu-allocator location whose fallback flags are satisfied by `required`.
fn location_for(required: vk::MemoryPropertyFlags) -> MemoryLocation {
    if required.contains(HOST_VISIBLE_COHERENT) {
        MemoryLocation::CpuToGpu
    } else if required.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        && !required.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    {
        MemoryLocation::GpuOnly
    } else {
        MemoryLocation::Unknown
    }
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Mutex<Allocator>,
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl MemoryManager {
    /// Create a new memory manager.
    pub unsafe fn new(ctx: &VulkanContext) -> RenderResult<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        }).map_err(|e| RenderError::creation("memory allocator", e))?;

        Ok(Self {
            allocator: Mutex::new(allocator),
            device: ctx.device.clone(),
            memory_properties: ctx.memory_properties,
        })
    }

    /// Create a buffer and bind it to dedicated memory with `properties`.
    ///
    /// Buffers whose usage includes `SHADER_DEVICE_ADDRESS` come back with
    /// their device address filled in.
    pub unsafe fn allocate(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> RenderResult<Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self.device.create_buffer(&buffer_info, None)
            .map_err(|e| RenderError::creation(format!("buffer '{}'", name), e))?;

        let mut requirements = self.device.get_buffer_memory_requirements(handle);
        let memory_type_index = match find_memory_type_index(
            requirements.memory_type_bits,
            properties,
            &self.memory_properties,
        ) {
            Ok(index) => index,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e);
            }
        };
        requirements.memory_type_bits = 1 << memory_type_index;

        let allocation = self.allocator.lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: location_for(properties),
                linear: true,
                allocation_scheme: AllocationScheme::DedicatedBuffer(handle),
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(RenderError::creation(format!("memory for buffer '{}'", name), e));
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) {
            self.device.destroy_buffer(handle, None);
            let _ = self.allocator.lock().free(allocation);
            return Err(RenderError::creation(format!("memory binding for buffer '{}'", name), e));
        }

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        log::trace!("Allocated buffer '{}' ({} bytes, memory type {})", name, size, memory_type_index);

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            device_address,
        })
    }

    /// Create a host-visible buffer and fill it with `data`.
    pub unsafe fn allocate_with_data<T: bytemuck::Pod>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> RenderResult<Buffer> {
        let size = std::mem::size_of_val(data).max(1) as vk::DeviceSize;
        let buffer = self.allocate(size, usage, HOST_VISIBLE_COHERENT, name)?;
        if let Err(e) = buffer.write(data) {
            self.free(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Create a 2D single-mip color image plus its view.
    pub unsafe fn allocate_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> RenderResult<Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = self.device.create_image(&image_info, None)
            .map_err(|e| RenderError::creation(format!("image '{}'", name), e))?;

        let mut requirements = self.device.get_image_memory_requirements(handle);
        let memory_type_index = match find_memory_type_index(
            requirements.memory_type_bits,
            properties,
            &self.memory_properties,
        ) {
            Ok(index) => index,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(e);
            }
        };
        requirements.memory_type_bits = 1 << memory_type_index;

        let allocation = self.allocator.lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: location_for(properties),
                linear: false,
                allocation_scheme: AllocationScheme::DedicatedImage(handle),
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(RenderError::creation(format!("memory for image '{}'", name), e));
            }
        };

        if let Err(e) = self.device.bind_image_memory(handle, allocation.memory(), allocation.offset()) {
            self.device.destroy_image(handle, None);
            let _ = self.allocator.lock().free(allocation);
            return Err(RenderError::creation(format!("memory binding for image '{}'", name), e));
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(COLOR_SUBRESOURCE_RANGE);

        let view = match self.device.create_image_view(&view_info, None) {
            Ok(view) => view,
            Err(e) => {
                self.device.destroy_image(handle, None);
                let _ = self.allocator.lock().free(allocation);
                return Err(RenderError::creation(format!("view of image '{}'", name), e));
            }
        };

        Ok(Image {
            handle,
            view,
            allocation: Some(allocation),
            format,
            extent,
        })
    }

    /// Destroy a buffer and release its memory.
    pub unsafe fn free(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {:?}", e);
            }
        }
    }

    /// Destroy an image, its view, and release its memory.
    pub unsafe fn free_image(&self, image: Image) {
        self.device.destroy_image_view(image.view, None);
        self.device.destroy_image(image.handle, None);
        if let Some(allocation) = image.allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free image memory: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props
    }

    // ============================================================
    // Memory type selection
    // ============================================================

    #[test]
    fn test_first_matching_type_wins() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            HOST_VISIBLE_COHERENT,
            HOST_VISIBLE_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        let index = find_memory_type_index(0b111, HOST_VISIBLE_COHERENT, &props).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn test_superset_flags_accepted() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL | HOST_VISIBLE_COHERENT,
        ]);
        let index = find_memory_type_index(0b1, vk::MemoryPropertyFlags::DEVICE_LOCAL, &props).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn test_type_mask_excludes_candidates() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let index = find_memory_type_index(0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL, &props).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn test_no_compatible_type_is_an_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type_index(0b1, HOST_VISIBLE_COHERENT, &props).unwrap_err();
        assert!(matches!(
            err,
            RenderError::UnsupportedMemoryType { type_bits: 0b1, .. }
        ));
    }

    #[test]
    fn test_types_beyond_count_ignored() {
        let mut props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        props.memory_types[1].property_flags = HOST_VISIBLE_COHERENT;
        assert!(find_memory_type_index(0b11, HOST_VISIBLE_COHERENT, &props).is_err());
    }

    // ============================================================
    // Allocator location mapping
    // ============================================================

    #[test]
    fn test_location_for_host_visible() {
        assert_eq!(location_for(HOST_VISIBLE_COHERENT), MemoryLocation::CpuToGpu);
    }

    #[test]
    fn test_location_for_device_local() {
        assert_eq!(location_for(vk::MemoryPropertyFlags::DEVICE_LOCAL), MemoryLocation::GpuOnly);
    }

    #[test]
    fn test_location_for_other() {
        assert_eq!(location_for(vk::MemoryPropertyFlags::HOST_VISIBLE), MemoryLocation::Unknown);
        assert_eq!(location_for(vk::MemoryPropertyFlags::empty()), MemoryLocation::Unknown);
    }

    // ============================================================
    // Host writes
    // ============================================================

    #[test]
    fn test_write_rejects_unmapped_buffer() {
        let buffer = Buffer {
            handle: vk::Buffer::null(),
            allocation: None,
            size: 64,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            device_address: None,
        };
        assert!(buffer.write_bytes(0, &[0u8; 16]).is_err());
    }

    #[test]
    fn test_write_rejects_overflow() {
        let buffer = Buffer {
            handle: vk::Buffer::null(),
            allocation: None,
            size: 8,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            device_address: None,
        };
        let err = buffer.write_bytes(4, &[0u8; 8]).unwrap_err();
        assert!(err.to_string().contains("exceed"));
    }

    #[test]
    fn test_address_requires_device_address_usage() {
        let buffer = Buffer {
            handle: vk::Buffer::null(),
            allocation: None,
            size: 8,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            device_address: None,
        };
        assert!(buffer.address().is_err());
    }
}
