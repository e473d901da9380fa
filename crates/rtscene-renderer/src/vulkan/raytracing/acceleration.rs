//! Bottom- and top-level acceleration structure builders.
//!
//! Structures are built once at startup with an immediate (queue-idle) command
//! and never updated or compacted.

use ash::vk;
use ash::khr::acceleration_structure;

use super::align_up;
use crate::error::{RenderError, RenderResult};
use crate::mesh::Vertex;
use crate::scene::ObjectInstance;
use crate::vulkan::geometry::GeometryBuffers;
use crate::vulkan::{Buffer, CommandManager, MemoryManager, RtLoaders, VulkanContext};

/// Built acceleration structure and the buffer backing it.
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    pub device_address: vk::DeviceAddress,
    /// Triangles for a bottom-level structure, instances for a top-level one.
    pub primitive_count: u32,
}

/// Wire layout of `VkAccelerationStructureInstanceKHR` (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl InstanceRecord {
    /// Instance of `blas_address` placed by `transform`, visible to every ray
    /// mask, using hit group 0 and no back-face culling.
    pub fn new(transform: glam::Mat4, custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        let rows = transform.transpose().to_cols_array_2d();
        Self {
            transform: [rows[0], rows[1], rows[2]],
            instance_custom_index_and_mask: (0xFF << 24) | (custom_index & 0xFFFFFF),
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: blas_address,
        }
        .with_sbt_offset(0, vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE)
    }

    /// Set the SBT offset and flags.
    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.instance_shader_binding_table_record_offset_and_flags =
            (flags.as_raw() << 24) | (offset & 0xFFFFFF);
        self
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & 0xFFFFFF
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & 0xFFFFFF
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.instance_shader_binding_table_record_offset_and_flags >> 24)
    }
}

/// One instance per object, in list order, each pointing at its own BLAS.
pub fn instance_records(
    objects: &[ObjectInstance],
    blas_addresses: &[vk::DeviceAddress],
) -> RenderResult<Vec<InstanceRecord>> {
    if objects.len() != blas_addresses.len() {
        return Err(RenderError::creation(
            "instance array",
            format!("{} objects but {} bottom-level structures", objects.len(), blas_addresses.len()),
        ));
    }

    Ok(objects.iter()
        .zip(blas_addresses)
        .enumerate()
        .map(|(i, (object, &address))| InstanceRecord::new(object.transform(), i as u32, address))
        .collect())
}

/// Builds acceleration structures with the injected extension loader.
pub struct AccelerationStructureBuilder {
    loader: acceleration_structure::Device,
    scratch_alignment: vk::DeviceSize,
}

impl AccelerationStructureBuilder {
    pub fn new(rt: &RtLoaders) -> Self {
        Self {
            loader: rt.acceleration_structure.clone(),
            scratch_alignment: rt.properties.min_scratch_offset_alignment.max(1) as vk::DeviceSize,
        }
    }

    /// Build a bottom-level structure over one object's triangles.
    pub unsafe fn build_bottom_level(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        geometry: &GeometryBuffers,
    ) -> RenderResult<AccelerationStructure> {
        let triangle_count = geometry.index_count / 3;

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: geometry.vertex_buffer.address()?,
            })
            .vertex_stride(std::mem::size_of::<Vertex>() as vk::DeviceSize)
            .max_vertex(geometry.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: geometry.index_buffer.address()?,
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE);

        self.build(
            ctx,
            memory,
            commands,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            geometry,
            triangle_count,
            "blas",
        )
    }

    /// Upload `instances` and build the single top-level structure over them.
    pub unsafe fn build_top_level(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        instances: &[InstanceRecord],
    ) -> RenderResult<AccelerationStructure> {
        let instance_buffer = memory.allocate_with_data(
            instances,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR |
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "tlas_instances",
        )?;

        let result = instance_buffer.address().and_then(|instance_address| {
            let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR { device_address: instance_address });

            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data });

            self.build(
                ctx,
                memory,
                commands,
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                geometry,
                instances.len() as u32,
                "tlas",
            )
        });

        // The instance array is only read during the build
        memory.free(instance_buffer);
        result
    }

    /// Size query, storage allocation, creation, and a blocking build.
    #[allow(clippy::too_many_arguments)]
    unsafe fn build(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        ty: vk::AccelerationStructureTypeKHR,
        geometry: vk::AccelerationStructureGeometryKHR<'_>,
        primitive_count: u32,
        name: &str,
    ) -> RenderResult<AccelerationStructure> {
        let geometries = [geometry];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let primitive_counts = [primitive_count];
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &primitive_counts,
            &mut size_info,
        );

        let storage = memory.allocate(
            size_info.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR |
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            &format!("{}_storage", name),
        )?;

        let as_create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.handle)
            .size(size_info.acceleration_structure_size)
            .ty(ty);

        let handle = match self.loader.create_acceleration_structure(&as_create_info, None) {
            Ok(handle) => handle,
            Err(e) => {
                memory.free(storage);
                return Err(RenderError::creation(name, e));
            }
        };

        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(handle);
        let device_address = self.loader.get_acceleration_structure_device_address(&addr_info);

        let built = self.record_build(ctx, memory, commands, &build_info, handle, size_info.build_scratch_size, primitive_count, name);
        if let Err(e) = built {
            self.loader.destroy_acceleration_structure(handle, None);
            memory.free(storage);
            return Err(e);
        }

        log::debug!(
            "Built {} ({} primitives, {} bytes, scratch {} bytes)",
            name,
            primitive_count,
            size_info.acceleration_structure_size,
            size_info.build_scratch_size
        );

        Ok(AccelerationStructure {
            handle,
            buffer: storage,
            device_address,
            primitive_count,
        })
    }

    /// Allocate scratch space, run the build, and release the scratch buffer.
    #[allow(clippy::too_many_arguments)]
    unsafe fn record_build(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        dst: vk::AccelerationStructureKHR,
        scratch_size: vk::DeviceSize,
        primitive_count: u32,
        name: &str,
    ) -> RenderResult<()> {
        let scratch = memory.allocate(
            scratch_size + self.scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            &format!("{}_scratch", name),
        )?;

        let result = scratch.address().and_then(|address| {
            let scratch_address = align_up(address, self.scratch_alignment)?;

            let build_info = (*build_info)
                .dst_acceleration_structure(dst)
                .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address });

            let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(primitive_count)
                .primitive_offset(0)
                .first_vertex(0)
                .transform_offset(0);
            let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[build_range];

            commands.immediate(ctx, |cmd| {
                self.loader.cmd_build_acceleration_structures(cmd, &[build_info], &[build_ranges]);
            })
        });

        memory.free(scratch);
        result
    }

    /// Destroy a structure and its backing buffer.
    pub unsafe fn destroy(&self, memory: &MemoryManager, structure: AccelerationStructure) {
        self.loader.destroy_acceleration_structure(structure.handle, None);
        memory.free(structure.buffer);
    }
}
