//! Render context and the public renderer entry point.
//!
//! Startup runs once in a fixed order: geometry and bottom-level structures,
//! the top-level structure, descriptor sets, pipeline, then the shader
//! binding table. After that only the frame loop and surface recreation
//! touch the GPU.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::time::Duration;
use winit::window::Window;

use crate::config::RendererConfig;
use crate::error::{RenderError, RenderResult};
use crate::frame::{AcquireOutcome, FrameDriver, FrameOutcome, FrameScheduler, FrameSlot, PresentOutcome, MAX_FRAMES_IN_FLIGHT};
use crate::mesh::MeshSource;
use crate::scene::{Light, Scene};
use crate::uniforms::{CameraPose, FrameUniforms};
use crate::vulkan::commands::{FrameBarriers, ImageTransition};
use crate::vulkan::descriptors::SharedBindings;
use crate::vulkan::pipeline::ShaderSet;
use crate::vulkan::raytracing::acceleration::instance_records;
use crate::vulkan::raytracing::{AccelerationStructure, AccelerationStructureBuilder, ShaderBindingTable};
use crate::vulkan::{
    CommandManager, GeometryStore, Image, MemoryManager, RayTracingPipeline, ResourceBinder, Swapchain,
    VulkanContext, VulkanSurface,
};

/// How often a zero-sized surface is polled before recreation is deferred.
const RECREATE_POLL_ATTEMPTS: u32 = 10;
const RECREATE_POLL_INTERVAL: Duration = Duration::from_millis(16);

/// Build-once scene resources.
struct SceneResources {
    geometry: GeometryStore,
    tlas: AccelerationStructure,
    sbt: ShaderBindingTable,
}

/// Every GPU object the renderer owns.
///
/// Field order matters for drop: the allocator in `memory` must go before
/// the device in `ctx`.
pub struct RenderContext {
    slots: Vec<FrameSlot>,
    scene: Option<SceneResources>,
    pipeline: RayTracingPipeline,
    binder: ResourceBinder,
    builder: AccelerationStructureBuilder,
    output: Option<Image>,
    swapchain: Swapchain,
    surface: VulkanSurface,
    commands: CommandManager,
    memory: MemoryManager,
    ctx: VulkanContext,

    camera: CameraPose,
    lights: Vec<Light>,
    lighting_enabled: bool,
    /// Latest window size reported by the windowing layer.
    window_extent: vk::Extent2D,
}

impl RenderContext {
    unsafe fn new(
        window: &Window,
        scene: &Scene,
        config: &RendererConfig,
        meshes: &dyn MeshSource,
    ) -> RenderResult<Self> {
        let display_handle = window.display_handle()
            .map_err(|e| RenderError::creation("display handle", e))?
            .as_raw();
        let window_handle = window.window_handle()
            .map_err(|e| RenderError::creation("window handle", e))?
            .as_raw();

        let ctx = VulkanContext::new(display_handle, window_handle, config.enable_validation)?;
        let memory = MemoryManager::new(&ctx)?;
        let commands = CommandManager::new(&ctx, MAX_FRAMES_IN_FLIGHT)?;

        let size = window.inner_size();
        let window_extent = vk::Extent2D { width: size.width, height: size.height };
        let surface = VulkanSurface::new(&ctx, config.vsync)?;
        let swapchain = Swapchain::new(&ctx, &surface, size.width, size.height, None)?;
        let output = create_output_image(&ctx, &memory, &commands, &swapchain)?;

        log::info!(
            "Building scene: {} objects, {} lights",
            scene.objects.len(),
            scene.lights.len()
        );

        let builder = AccelerationStructureBuilder::new(&ctx.rt);
        let geometry = GeometryStore::new(&ctx, &memory, &commands, &builder, &scene.objects, meshes)?;

        let instances = instance_records(&scene.objects, &geometry.blas_addresses())?;
        let tlas = builder.build_top_level(&ctx, &memory, &commands, &instances)?;
        log::info!("Built top-level acceleration structure with {} instances", tlas.primitive_count);

        let slots = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|i| FrameSlot::new(&ctx, &memory, i))
            .collect::<RenderResult<Vec<_>>>()?;

        let mut binder = ResourceBinder::new(&ctx.device, MAX_FRAMES_IN_FLIGHT)?;
        let uniform_buffers: Vec<_> = slots.iter().map(|s| s.uniform_buffer.handle).collect();
        binder.bind_all(
            &SharedBindings {
                tlas: tlas.handle,
                output_view: output.view,
                color_table: geometry.color_table.handle,
                address_table: geometry.address_table.handle,
            },
            &uniform_buffers,
        )?;

        let shaders = ShaderSet::load(&config.shader_dir)?;
        let pipeline = RayTracingPipeline::new(&ctx.device, &ctx.rt, binder.layout, &shaders)?;
        let sbt = ShaderBindingTable::new(&memory, &ctx.rt, &pipeline)?;

        Ok(Self {
            slots,
            scene: Some(SceneResources { geometry, tlas, sbt }),
            pipeline,
            binder,
            builder,
            output: Some(output),
            swapchain,
            surface,
            commands,
            memory,
            ctx,
            camera: CameraPose::default(),
            lights: scene.lights.clone(),
            lighting_enabled: true,
            window_extent,
        })
    }

    fn output(&self) -> RenderResult<&Image> {
        self.output.as_ref()
            .ok_or_else(|| RenderError::creation("output image", "not allocated"))
    }

    fn scene(&self) -> RenderResult<&SceneResources> {
        self.scene.as_ref()
            .ok_or_else(|| RenderError::creation("scene resources", "not built"))
    }

    fn aspect(&self) -> f32 {
        let extent = self.swapchain.extent;
        extent.width.max(1) as f32 / extent.height.max(1) as f32
    }

    /// Poll until the surface reports a nonzero size, giving up after a
    /// bounded number of attempts.
    unsafe fn wait_for_surface_extent(&mut self) -> RenderResult<Option<vk::Extent2D>> {
        for attempt in 0..RECREATE_POLL_ATTEMPTS {
            self.surface.refresh_capabilities(&self.ctx)?;
            let extent = self.surface.get_extent(self.window_extent.width, self.window_extent.height);
            if extent.width > 0 && extent.height > 0 {
                return Ok(Some(extent));
            }
            if attempt + 1 < RECREATE_POLL_ATTEMPTS {
                std::thread::sleep(RECREATE_POLL_INTERVAL);
            }
        }
        Ok(None)
    }
}

/// Storage image the ray generation shader writes, left in GENERAL layout.
unsafe fn create_output_image(
    ctx: &VulkanContext,
    memory: &MemoryManager,
    commands: &CommandManager,
    swapchain: &Swapchain,
) -> RenderResult<Image> {
    let image = memory.allocate_image(
        swapchain.extent,
        swapchain.format,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        "output_image",
    )?;

    let transition = ImageTransition::new(image.handle, vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL);
    if let Err(e) = commands.immediate(ctx, |cmd| transition.record(&ctx.device, cmd)) {
        memory.free_image(image);
        return Err(e);
    }

    Ok(image)
}

impl FrameDriver for RenderContext {
    fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()> {
        unsafe { self.slots[slot].wait(&self.ctx.device) }
    }

    fn acquire_image(&mut self, slot: usize) -> RenderResult<AcquireOutcome> {
        unsafe { self.swapchain.acquire_next_image(&self.ctx, self.slots[slot].image_available) }
    }

    fn write_uniforms(&mut self, slot: usize) -> RenderResult<()> {
        let uniforms = FrameUniforms::new(&self.camera, self.aspect(), &self.lights, self.lighting_enabled);
        self.slots[slot].uniform_buffer.write(std::slice::from_ref(&uniforms))
    }

    fn reset_slot(&mut self, slot: usize) -> RenderResult<()> {
        unsafe { self.slots[slot].reset(&self.ctx.device) }
    }

    fn record_commands(&mut self, slot: usize, image_index: u32) -> RenderResult<()> {
        let device = &self.ctx.device;
        let output = self.output()?;
        let scene = self.scene()?;
        let extent = self.swapchain.extent;

        unsafe {
            let cmd = self.commands.begin_frame(slot)?;

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline.layout,
                0,
                &[self.binder.set(slot)],
                &[],
            );
            scene.sbt.trace_rays(cmd, extent);

            FrameBarriers::new(output.handle, self.swapchain.image(image_index))
                .record_copy(device, cmd, extent);

            self.commands.end_frame(slot)
        }
    }

    fn submit(&mut self, slot: usize) -> RenderResult<()> {
        let frame = &self.slots[slot];
        unsafe {
            self.commands.submit_frame(
                &self.ctx,
                slot,
                frame.image_available,
                frame.render_finished,
                frame.in_flight,
            )
        }
    }

    fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
        unsafe { self.swapchain.present(&self.ctx, image_index, self.slots[slot].render_finished) }
    }

    fn recreate_surface(&mut self) -> RenderResult<bool> {
        unsafe {
            let extent = match self.wait_for_surface_extent()? {
                Some(extent) => extent,
                None => {
                    log::debug!("Surface has zero extent, deferring recreation");
                    return Ok(false);
                }
            };

            self.ctx.wait_idle()?;

            self.swapchain.recreate(&self.ctx, &self.surface, extent.width, extent.height)?;

            let output = create_output_image(&self.ctx, &self.memory, &self.commands, &self.swapchain)?;
            if let Err(e) = self.binder.rebind_output_image(output.view) {
                self.memory.free_image(output);
                return Err(e);
            }
            if let Some(old) = self.output.replace(output) {
                self.memory.free_image(old);
            }

            log::info!(
                "Surface recreated at {}x{}",
                self.swapchain.extent.width,
                self.swapchain.extent.height
            );
            Ok(true)
        }
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.ctx.wait_idle() {
                log::warn!("Device did not go idle before teardown: {}", e);
            }

            for slot in self.slots.drain(..) {
                slot.destroy(&self.ctx.device, &self.memory);
            }

            if let Some(scene) = self.scene.take() {
                scene.sbt.destroy(&self.memory);
                self.builder.destroy(&self.memory, scene.tlas);
                scene.geometry.destroy(&self.memory, &self.builder);
            }

            self.pipeline.destroy(&self.ctx.device);
            self.binder.destroy();

            if let Some(output) = self.output.take() {
                self.memory.free_image(output);
            }

            self.swapchain.destroy(&self.ctx);
            self.commands.destroy();
        }
    }
}

/// Ray traced renderer for one window and one static scene.
pub struct Renderer {
    context: RenderContext,
    scheduler: FrameScheduler,
}

impl Renderer {
    /// Build every GPU resource for `scene` and prepare the frame loop.
    ///
    /// `window` must outlive the renderer.
    pub fn new(
        window: &Window,
        scene: &Scene,
        config: &RendererConfig,
        meshes: &dyn MeshSource,
    ) -> RenderResult<Self> {
        let context = unsafe { RenderContext::new(window, scene, config, meshes)? };
        Ok(Self {
            context,
            scheduler: FrameScheduler::new(MAX_FRAMES_IN_FLIGHT),
        })
    }

    /// Render and present one frame.
    pub fn draw(&mut self) -> RenderResult<FrameOutcome> {
        self.scheduler.draw_frame(&mut self.context)
    }

    /// Record a new window size; the surface is rebuilt after the next
    /// presentation.
    pub fn set_extent(&mut self, width: u32, height: u32) {
        self.context.window_extent = vk::Extent2D { width, height };
        self.scheduler.request_resize();
    }

    /// Globally enable or disable every light. Takes effect on the next frame.
    pub fn toggle_lighting(&mut self, enabled: bool) {
        self.context.lighting_enabled = enabled;
    }

    pub fn lighting_enabled(&self) -> bool {
        self.context.lighting_enabled
    }

    pub fn update_camera(&mut self, camera: CameraPose) {
        self.context.camera = camera;
    }
}
