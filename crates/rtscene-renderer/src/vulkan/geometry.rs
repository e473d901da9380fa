//! Per-object GPU geometry and the two storage tables shaders index by
//! instance custom index.

use ash::vk;
use glam::Vec3;

use crate::error::RenderResult;
use crate::mesh::{MeshData, MeshSource};
use crate::scene::ObjectInstance;
use crate::vulkan::raytracing::{AccelerationStructure, AccelerationStructureBuilder};
use crate::vulkan::{Buffer, CommandManager, MemoryManager, VulkanContext};

/// Vertex and index buffers of one object, readable by the structure build
/// and by shaders through their device addresses.
pub struct GeometryBuffers {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl GeometryBuffers {
    const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw() |
        vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw() |
        vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
    );

    pub unsafe fn upload(memory: &MemoryManager, mesh: &MeshData, name: &str) -> RenderResult<Self> {
        let vertex_buffer = memory.allocate_with_data(&mesh.vertices, Self::USAGE, &format!("{}_vertices", name))?;
        let index_buffer = match memory.allocate_with_data(&mesh.indices, Self::USAGE, &format!("{}_indices", name)) {
            Ok(buffer) => buffer,
            Err(e) => {
                memory.free(vertex_buffer);
                return Err(e);
            }
        };

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_count: mesh.vertices.len() as u32,
            index_count: mesh.indices.len() as u32,
        })
    }

    pub fn addresses(&self) -> RenderResult<ObjectAddresses> {
        Ok(ObjectAddresses {
            vertex_address: self.vertex_buffer.address()?,
            index_address: self.index_buffer.address()?,
        })
    }

    pub unsafe fn destroy(self, memory: &MemoryManager) {
        memory.free(self.vertex_buffer);
        memory.free(self.index_buffer);
    }
}

/// Entry of the geometry address table (binding 4).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ObjectAddresses {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
}

/// Everything the GPU holds for one object.
pub struct ObjectGpuResources {
    pub geometry: GeometryBuffers,
    pub blas: AccelerationStructure,
    pub color: Vec3,
}

/// Flat color table (binding 3): one vec4 per object, alpha 1.
pub fn color_table(colors: impl IntoIterator<Item = Vec3>) -> Vec<[f32; 4]> {
    colors.into_iter().map(|c| c.extend(1.0).to_array()).collect()
}

/// Per-object resources in scene order plus the two shader tables.
pub struct GeometryStore {
    pub objects: Vec<ObjectGpuResources>,
    pub color_table: Buffer,
    pub address_table: Buffer,
}

impl GeometryStore {
    /// Load, upload and build a bottom-level structure for every object.
    pub unsafe fn new(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        builder: &AccelerationStructureBuilder,
        objects: &[ObjectInstance],
        meshes: &dyn MeshSource,
    ) -> RenderResult<Self> {
        let mut resources: Vec<ObjectGpuResources> = Vec::with_capacity(objects.len());

        for (i, object) in objects.iter().enumerate() {
            let loaded = Self::load_object(ctx, memory, commands, builder, i, object, meshes);
            match loaded {
                Ok(object) => resources.push(object),
                Err(e) => {
                    Self::destroy_objects(memory, builder, resources);
                    return Err(e);
                }
            }
        }

        let tables = Self::create_tables(memory, &resources);
        let (color_table, address_table) = match tables {
            Ok(tables) => tables,
            Err(e) => {
                Self::destroy_objects(memory, builder, resources);
                return Err(e);
            }
        };

        log::info!("Built {} bottom-level acceleration structures", resources.len());

        Ok(Self {
            objects: resources,
            color_table,
            address_table,
        })
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn load_object(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        builder: &AccelerationStructureBuilder,
        index: usize,
        object: &ObjectInstance,
        meshes: &dyn MeshSource,
    ) -> RenderResult<ObjectGpuResources> {
        let mesh = meshes.load(&object.mesh, object.scale)?;
        let geometry = GeometryBuffers::upload(memory, &mesh, &format!("object{}", index))?;

        match builder.build_bottom_level(ctx, memory, commands, &geometry) {
            Ok(blas) => {
                log::debug!(
                    "Object {} ({}): {} triangles",
                    index,
                    object.mesh.display(),
                    blas.primitive_count
                );
                Ok(ObjectGpuResources { geometry, blas, color: object.color })
            }
            Err(e) => {
                geometry.destroy(memory);
                Err(e)
            }
        }
    }

    unsafe fn create_tables(
        memory: &MemoryManager,
        objects: &[ObjectGpuResources],
    ) -> RenderResult<(Buffer, Buffer)> {
        let colors = color_table(objects.iter().map(|o| o.color));
        let addresses = objects.iter()
            .map(|o| o.geometry.addresses())
            .collect::<RenderResult<Vec<_>>>()?;

        let color_buffer = memory.allocate_with_data(
            &colors,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "instance_colors",
        )?;
        let address_buffer = match memory.allocate_with_data(
            &addresses,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "object_addresses",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                memory.free(color_buffer);
                return Err(e);
            }
        };

        Ok((color_buffer, address_buffer))
    }

    /// Bottom-level structure addresses in scene order.
    pub fn blas_addresses(&self) -> Vec<vk::DeviceAddress> {
        self.objects.iter().map(|o| o.blas.device_address).collect()
    }

    unsafe fn destroy_objects(
        memory: &MemoryManager,
        builder: &AccelerationStructureBuilder,
        objects: Vec<ObjectGpuResources>,
    ) {
        for object in objects {
            builder.destroy(memory, object.blas);
            object.geometry.destroy(memory);
        }
    }

    pub unsafe fn destroy(self, memory: &MemoryManager, builder: &AccelerationStructureBuilder) {
        Self::destroy_objects(memory, builder, self.objects);
        memory.free(self.color_table);
        memory.free(self.address_table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_entry_layout() {
        // Matches the shader's { uint64_t vertexAddress; uint64_t indexAddress; }
        assert_eq!(std::mem::size_of::<ObjectAddresses>(), 16);
        let entry = ObjectAddresses { vertex_address: 0x1000, index_address: 0x2000 };
        let words: &[u64] = bytemuck::cast_slice(std::slice::from_ref(&entry));
        assert_eq!(words, &[0x1000, 0x2000]);
    }

    #[test]
    fn test_color_table_one_vec4_per_object() {
        let table = color_table([Vec3::new(0.8, 0.1, 0.1), Vec3::new(0.1, 0.8, 0.1)]);
        assert_eq!(table.len(), 2);
        assert_eq!(table[0], [0.8, 0.1, 0.1, 1.0]);
        assert_eq!(table[1], [0.1, 0.8, 0.1, 1.0]);
        assert_eq!(std::mem::size_of_val(table.as_slice()), 32);
    }

    #[test]
    fn test_geometry_usage_flags() {
        let usage = GeometryBuffers::USAGE;
        assert!(usage.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR));
        assert!(usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }
}
