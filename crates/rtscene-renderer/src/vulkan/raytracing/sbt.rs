//! Shader binding table (SBT) for the ray tracing pipeline.
//!
//! Group order is fixed by the pipeline: raygen, primary miss, shadow miss,
//! closest hit. Each region lives in its own host-visible buffer.

use ash::vk;
use ash::khr::ray_tracing_pipeline;

use super::align_up;
use crate::error::{RenderError, RenderResult};
use crate::vulkan::context::RtProperties;
use crate::vulkan::pipeline::{HIT_GROUP_COUNT, MISS_GROUP_COUNT, RAYGEN_GROUP_COUNT, SHADER_GROUP_COUNT};
use crate::vulkan::memory::HOST_VISIBLE_COHERENT;
use crate::vulkan::{Buffer, MemoryManager, RtLoaders, RayTracingPipeline};

/// Handle size, per-record stride and region alignment derived from the
/// device properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub stride: u64,
    pub base_alignment: u64,
}

/// Region contents ready to be copied into their buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbtHostData {
    pub raygen: Vec<u8>,
    pub miss: Vec<u8>,
    pub hit: Vec<u8>,
}

impl SbtLayout {
    pub fn new(properties: &RtProperties) -> RenderResult<Self> {
        Ok(Self {
            handle_size: properties.shader_group_handle_size,
            stride: align_up(
                properties.shader_group_handle_size as u64,
                properties.shader_group_handle_alignment as u64,
            )?,
            base_alignment: properties.shader_group_base_alignment as u64,
        })
    }

    /// Total bytes of the handle array returned by the driver.
    pub fn handle_data_size(&self) -> usize {
        self.handle_size as usize * SHADER_GROUP_COUNT as usize
    }

    /// Split the flat handle array into stride-spaced region records.
    ///
    /// Handle `k` is read from `k * handle_size`; the gap after each handle
    /// up to the stride is zero.
    pub fn pack(&self, handles: &[u8]) -> RenderResult<SbtHostData> {
        if handles.len() < self.handle_data_size() {
            return Err(RenderError::creation(
                "shader binding table",
                format!("expected {} handle bytes, got {}", self.handle_data_size(), handles.len()),
            ));
        }

        let mut group = 0;
        let mut region = |count: u32| {
            let mut bytes = vec![0u8; self.stride as usize * count as usize];
            for record in 0..count as usize {
                let src = group * self.handle_size as usize;
                let dst = record * self.stride as usize;
                bytes[dst..dst + self.handle_size as usize]
                    .copy_from_slice(&handles[src..src + self.handle_size as usize]);
                group += 1;
            }
            bytes
        };

        let raygen = region(RAYGEN_GROUP_COUNT);
        let miss = region(MISS_GROUP_COUNT);
        let hit = region(HIT_GROUP_COUNT);
        Ok(SbtHostData { raygen, miss, hit })
    }

    /// Buffer size that fits `len` record bytes starting at a base-aligned
    /// address anywhere inside it.
    fn padded_size(&self, len: usize) -> vk::DeviceSize {
        len.max(1) as vk::DeviceSize + self.base_alignment
    }

    /// Region of `count` records starting at `address`, which must be a
    /// multiple of the shader group base alignment.
    fn region(&self, address: vk::DeviceAddress, count: u32) -> RenderResult<vk::StridedDeviceAddressRegionKHR> {
        if self.base_alignment != 0 && address % self.base_alignment != 0 {
            return Err(RenderError::creation(
                "shader binding table region",
                format!("address {:#x} is not aligned to {}", address, self.base_alignment),
            ));
        }

        Ok(vk::StridedDeviceAddressRegionKHR {
            device_address: address,
            stride: self.stride,
            size: self.stride * count as u64,
        })
    }
}

/// Shader binding table for the scene pipeline.
pub struct ShaderBindingTable {
    pub raygen_buffer: Buffer,
    pub miss_buffer: Buffer,
    pub hit_buffer: Buffer,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
    loader: ray_tracing_pipeline::Device,
}

impl ShaderBindingTable {
    /// Query the pipeline's group handles and lay them out in three buffers.
    pub unsafe fn new(
        memory: &MemoryManager,
        rt: &RtLoaders,
        pipeline: &RayTracingPipeline,
    ) -> RenderResult<Self> {
        let layout = SbtLayout::new(&rt.properties)?;

        let handles = rt.pipeline
            .get_ray_tracing_shader_group_handles(
                pipeline.pipeline,
                0,
                SHADER_GROUP_COUNT,
                layout.handle_data_size(),
            )
            .map_err(|e| RenderError::creation("shader group handles", e))?;

        let data = layout.pack(&handles)?;

        let (raygen_buffer, raygen_region) =
            Self::upload_region(memory, &layout, &data.raygen, RAYGEN_GROUP_COUNT, "sbt_raygen")?;
        let (miss_buffer, miss_region) =
            match Self::upload_region(memory, &layout, &data.miss, MISS_GROUP_COUNT, "sbt_miss") {
                Ok(uploaded) => uploaded,
                Err(e) => {
                    memory.free(raygen_buffer);
                    return Err(e);
                }
            };
        let (hit_buffer, hit_region) =
            match Self::upload_region(memory, &layout, &data.hit, HIT_GROUP_COUNT, "sbt_hit") {
                Ok(uploaded) => uploaded,
                Err(e) => {
                    memory.free(raygen_buffer);
                    memory.free(miss_buffer);
                    return Err(e);
                }
            };

        log::debug!(
            "Shader binding table: handle {} bytes, stride {} bytes",
            layout.handle_size,
            layout.stride
        );

        Ok(Self {
            raygen_buffer,
            miss_buffer,
            hit_buffer,
            raygen_region,
            miss_region,
            hit_region,
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
            loader: rt.pipeline.clone(),
        })
    }

    /// Copy one region's records into a fresh host-visible buffer, starting
    /// at the first base-aligned address inside it.
    unsafe fn upload_region(
        memory: &MemoryManager,
        layout: &SbtLayout,
        records: &[u8],
        count: u32,
        name: &str,
    ) -> RenderResult<(Buffer, vk::StridedDeviceAddressRegionKHR)> {
        let usage = vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR |
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let buffer = memory.allocate(layout.padded_size(records.len()), usage, HOST_VISIBLE_COHERENT, name)?;

        let region = buffer.address().and_then(|address| {
            let aligned = align_up(address, layout.base_alignment)?;
            buffer.write_bytes((aligned - address) as usize, records)?;
            layout.region(aligned, count)
        });

        match region {
            Ok(region) => Ok((buffer, region)),
            Err(e) => {
                memory.free(buffer);
                Err(e)
            }
        }
    }

    /// Record one ray generation invocation per pixel of `extent`.
    pub unsafe fn trace_rays(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        self.loader.cmd_trace_rays(
            cmd,
            &self.raygen_region,
            &self.miss_region,
            &self.hit_region,
            &self.callable_region,
            extent.width,
            extent.height,
            1,
        );
    }

    pub unsafe fn destroy(self, memory: &MemoryManager) {
        memory.free(self.raygen_buffer);
        memory.free(self.miss_buffer);
        memory.free(self.hit_buffer);
    }
}
