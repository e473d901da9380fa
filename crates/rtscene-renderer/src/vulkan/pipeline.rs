//! Ray tracing pipeline: four shader stages in four groups.

use ash::vk;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::{RenderError, RenderResult};
use crate::vulkan::RtLoaders;

pub const RAYGEN_GROUP_COUNT: u32 = 1;
/// Primary miss followed by the shadow miss.
pub const MISS_GROUP_COUNT: u32 = 2;
pub const HIT_GROUP_COUNT: u32 = 1;
pub const SHADER_GROUP_COUNT: u32 = RAYGEN_GROUP_COUNT + MISS_GROUP_COUNT + HIT_GROUP_COUNT;

/// Primary rays plus one level of shadow rays.
pub const MAX_RECURSION_DEPTH: u32 = 2;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read a SPIR-V binary, rejecting files that are not word-aligned or lack
/// the SPIR-V magic number.
pub fn load_spirv(path: &Path) -> RenderResult<Vec<u32>> {
    let shader_error = |reason: String| RenderError::ShaderLoad {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = std::fs::read(path).map_err(|e| shader_error(e.to_string()))?;
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| shader_error(e.to_string()))?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&word) => Err(shader_error(format!("bad magic number {:#010x}", word))),
        None => Err(shader_error("empty file".into())),
    }
}

/// SPIR-V for the four ray tracing stages.
pub struct ShaderSet {
    pub raygen: Vec<u32>,
    pub miss: Vec<u32>,
    pub shadow_miss: Vec<u32>,
    pub closest_hit: Vec<u32>,
}

impl ShaderSet {
    pub const RAYGEN_FILE: &'static str = "raygen.rgen.spv";
    pub const MISS_FILE: &'static str = "miss.rmiss.spv";
    pub const SHADOW_MISS_FILE: &'static str = "shadow.rmiss.spv";
    pub const CLOSEST_HIT_FILE: &'static str = "closesthit.rchit.spv";

    /// Load all four binaries from `dir`.
    pub fn load(dir: &Path) -> RenderResult<Self> {
        let load = |name: &str| {
            let path: PathBuf = dir.join(name);
            load_spirv(&path)
        };

        Ok(Self {
            raygen: load(Self::RAYGEN_FILE)?,
            miss: load(Self::MISS_FILE)?,
            shadow_miss: load(Self::SHADOW_MISS_FILE)?,
            closest_hit: load(Self::CLOSEST_HIT_FILE)?,
        })
    }

    /// Stage flags and code in pipeline stage order.
    fn stages(&self) -> [(vk::ShaderStageFlags, &[u32]); 4] {
        [
            (vk::ShaderStageFlags::RAYGEN_KHR, self.raygen.as_slice()),
            (vk::ShaderStageFlags::MISS_KHR, self.miss.as_slice()),
            (vk::ShaderStageFlags::MISS_KHR, self.shadow_miss.as_slice()),
            (vk::ShaderStageFlags::CLOSEST_HIT_KHR, self.closest_hit.as_slice()),
        ]
    }
}

/// Shader groups in binding-table order: raygen, miss, shadow miss, hit.
pub fn shader_groups() -> [vk::RayTracingShaderGroupCreateInfoKHR<'static>; SHADER_GROUP_COUNT as usize] {
    let general = |stage: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(stage)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
    };

    let hit = vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(3)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR);

    [general(0), general(1), general(2), hit]
}

/// Recursion depth requested from the driver, never above its limit.
pub fn recursion_depth(device_max: u32) -> u32 {
    MAX_RECURSION_DEPTH.min(device_max)
}

pub struct RayTracingPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl RayTracingPipeline {
    /// Create the pipeline over a single descriptor set layout.
    pub unsafe fn new(
        device: &ash::Device,
        rt: &RtLoaders,
        set_layout: vk::DescriptorSetLayout,
        shaders: &ShaderSet,
    ) -> RenderResult<Self> {
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts);

        let layout = device.create_pipeline_layout(&layout_info, None)
            .map_err(|e| RenderError::creation("ray tracing pipeline layout", e))?;

        let mut modules = Vec::with_capacity(4);
        for (_, code) in shaders.stages() {
            let create_info = vk::ShaderModuleCreateInfo::default().code(code);
            match device.create_shader_module(&create_info, None) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        device.destroy_shader_module(module, None);
                    }
                    device.destroy_pipeline_layout(layout, None);
                    return Err(RenderError::creation("shader module", e));
                }
            }
        }

        let stages: Vec<_> = shaders.stages().iter()
            .zip(&modules)
            .map(|((stage, _), &module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(*stage)
                    .module(module)
                    .name(c"main")
            })
            .collect();

        let groups = shader_groups();
        let depth = recursion_depth(rt.properties.max_ray_recursion_depth);

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(depth)
            .layout(layout);

        let result = rt.pipeline.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        );

        // Modules are only needed during creation
        for module in modules {
            device.destroy_shader_module(module, None);
        }

        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(RenderError::creation("ray tracing pipeline", e));
            }
        };

        log::info!("Ray tracing pipeline created (recursion depth {})", depth);

        Ok(Self { pipeline, layout })
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}
