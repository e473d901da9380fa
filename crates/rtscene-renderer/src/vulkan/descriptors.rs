//! Descriptor layout and per-slot descriptor sets for the ray tracing pipeline.
//!
//! Binding map:
//! 0. top-level acceleration structure (raygen, closest hit)
//! 1. output storage image (raygen)
//! 2. frame uniforms (raygen, closest hit)
//! 3. per-instance color table (raygen, closest hit)
//! 4. per-object geometry address table (closest hit)

use ash::vk;

use crate::error::{RenderError, RenderResult};

/// Resources referenced by one slot's descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBindings {
    pub tlas: vk::AccelerationStructureKHR,
    pub output_view: vk::ImageView,
    pub uniform_buffer: vk::Buffer,
    pub color_table: vk::Buffer,
    pub address_table: vk::Buffer,
}

/// Resources shared by every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedBindings {
    pub tlas: vk::AccelerationStructureKHR,
    pub output_view: vk::ImageView,
    pub color_table: vk::Buffer,
    pub address_table: vk::Buffer,
}

/// What every slot's set references.
///
/// Kept beside the sets so a resize can rewrite binding 1 alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
    slots: Vec<SlotBindings>,
}

impl BindingTable {
    /// One entry per uniform buffer, in slot order. There must be exactly
    /// one uniform buffer per set.
    pub fn plan(shared: &SharedBindings, uniform_buffers: &[vk::Buffer], set_count: usize) -> RenderResult<Self> {
        if uniform_buffers.len() != set_count {
            return Err(RenderError::creation(
                "descriptor bindings",
                format!("{} uniform buffers for {} sets", uniform_buffers.len(), set_count),
            ));
        }

        let slots = uniform_buffers.iter()
            .map(|&uniform_buffer| SlotBindings {
                tlas: shared.tlas,
                output_view: shared.output_view,
                uniform_buffer,
                color_table: shared.color_table,
                address_table: shared.address_table,
            })
            .collect();

        Ok(Self { slots })
    }

    /// Swap the output image view in every slot, leaving the rest untouched.
    pub fn replace_output_view(&mut self, output_view: vk::ImageView) -> RenderResult<()> {
        if self.is_empty() {
            return Err(RenderError::creation("output image binding", "descriptor sets were never bound"));
        }

        for slot in &mut self.slots {
            slot.output_view = output_view;
        }
        Ok(())
    }

    pub fn slot(&self, slot: usize) -> Option<&SlotBindings> {
        self.slots.get(slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 5] {
    let rgen = vk::ShaderStageFlags::RAYGEN_KHR;
    let chit = vk::ShaderStageFlags::CLOSEST_HIT_KHR;

    let binding = |index: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags| {
        vk::DescriptorSetLayoutBinding::default()
            .binding(index)
            .descriptor_type(ty)
            .descriptor_count(1)
            .stage_flags(stages)
    };

    [
        binding(0, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, rgen | chit),
        binding(1, vk::DescriptorType::STORAGE_IMAGE, rgen),
        binding(2, vk::DescriptorType::UNIFORM_BUFFER, rgen | chit),
        binding(3, vk::DescriptorType::STORAGE_BUFFER, rgen | chit),
        binding(4, vk::DescriptorType::STORAGE_BUFFER, chit),
    ]
}

/// Pool sizes for exactly `set_count` sets of the layout above.
pub fn pool_sizes(set_count: u32) -> [vk::DescriptorPoolSize; 4] {
    let size = |ty, per_set: u32| vk::DescriptorPoolSize {
        ty,
        descriptor_count: per_set * set_count,
    };

    [
        size(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1),
        size(vk::DescriptorType::STORAGE_IMAGE, 1),
        size(vk::DescriptorType::UNIFORM_BUFFER, 1),
        size(vk::DescriptorType::STORAGE_BUFFER, 2),
    ]
}

/// Owns the set layout, the pool, and one descriptor set per frame slot.
pub struct ResourceBinder {
    pub layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    table: BindingTable,
    device: ash::Device,
}

impl ResourceBinder {
    /// Create the layout and allocate `slot_count` sets (left unwritten).
    pub unsafe fn new(device: &ash::Device, slot_count: usize) -> RenderResult<Self> {
        let bindings = layout_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)
            .map_err(|e| RenderError::creation("descriptor set layout", e))?;

        let sizes = pool_sizes(slot_count as u32);
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&sizes)
            .max_sets(slot_count as u32);

        let pool = match device.create_descriptor_pool(&pool_info, None) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_descriptor_set_layout(layout, None);
                return Err(RenderError::creation("descriptor pool", e));
            }
        };

        let layouts = vec![layout; slot_count];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = match device.allocate_descriptor_sets(&alloc_info) {
            Ok(sets) => sets,
            Err(e) => {
                device.destroy_descriptor_pool(pool, None);
                device.destroy_descriptor_set_layout(layout, None);
                return Err(RenderError::creation("descriptor sets", e));
            }
        };

        Ok(Self {
            layout,
            pool,
            sets,
            table: BindingTable::default(),
            device: device.clone(),
        })
    }

    /// Write all five bindings of every slot's set.
    pub unsafe fn bind_all(&mut self, shared: &SharedBindings, uniform_buffers: &[vk::Buffer]) -> RenderResult<()> {
        self.table = BindingTable::plan(shared, uniform_buffers, self.sets.len())?;
        self.write_all();
        log::debug!("Bound {} descriptor sets", self.table.len());
        Ok(())
    }

    /// Point every set at a recreated output image, rewriting the sets in
    /// place. The other bindings keep their resources. Fails if
    /// [`bind_all`](Self::bind_all) never ran.
    pub unsafe fn rebind_output_image(&mut self, output_view: vk::ImageView) -> RenderResult<()> {
        self.table.replace_output_view(output_view)?;
        self.write_all();
        Ok(())
    }

    unsafe fn write_all(&self) {
        for (slot, &set) in self.sets.iter().enumerate() {
            if let Some(bindings) = self.table.slot(slot) {
                self.write(set, bindings);
            }
        }
    }

    unsafe fn write(&self, set: vk::DescriptorSet, bindings: &SlotBindings) {
        let structures = [bindings.tlas];
        let mut structure_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&structures);

        let image_info = [vk::DescriptorImageInfo::default()
            .image_view(bindings.output_view)
            .image_layout(vk::ImageLayout::GENERAL)];

        let buffer_info = |buffer: vk::Buffer| [vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)];
        let uniform_info = buffer_info(bindings.uniform_buffer);
        let color_info = buffer_info(bindings.color_table);
        let address_info = buffer_info(bindings.address_table);

        let mut structure_write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut structure_info);
        structure_write.descriptor_count = 1;

        let writes = [
            structure_write,
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&image_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(2)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&uniform_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(3)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&color_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(4)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&address_info),
        ];

        self.device.update_descriptor_sets(&writes, &[]);
    }

    pub fn set(&self, slot: usize) -> vk::DescriptorSet {
        self.sets[slot]
    }

    /// Destroy the pool (freeing the sets) and the layout.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_descriptor_pool(self.pool, None);
        self.device.destroy_descriptor_set_layout(self.layout, None);
        self.sets.clear();
        self.table = BindingTable::default();
    }
}
