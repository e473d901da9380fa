//! Command buffer management and image layout barriers.
//!
//! Two separate submission paths live here. Per-slot frame command buffers
//! are recorded and submitted without blocking; the fence passed to
//! [`CommandManager::submit_frame`] is the only completion signal. The
//! immediate path ([`CommandManager::immediate`]) records into a transient
//! buffer and waits for the queue to drain, and is only meant for startup
//! builds and surface recreation.

use ash::vk;

use super::{VulkanContext, COLOR_SUBRESOURCE_RANGE};
use crate::error::{RenderError, RenderResult};

/// One image layout transition with its access and stage masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl ImageTransition {
    /// Transition between two layouts used by the ray traced frame.
    ///
    /// Unknown pairs fall back to a full ALL_COMMANDS dependency.
    pub fn new(image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        use vk::AccessFlags as A;
        use vk::ImageLayout as L;
        use vk::PipelineStageFlags as S;

        let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
            // Fresh output image before its first dispatch
            (L::UNDEFINED, L::GENERAL) => (
                A::empty(),
                A::SHADER_WRITE,
                S::TOP_OF_PIPE,
                S::RAY_TRACING_SHADER_KHR,
            ),
            // Output image: shader writes finished, copy reads next
            (L::GENERAL, L::TRANSFER_SRC_OPTIMAL) => (
                A::SHADER_WRITE,
                A::TRANSFER_READ,
                S::RAY_TRACING_SHADER_KHR,
                S::TRANSFER,
            ),
            // Swapchain image: contents discarded, copy writes next.
            // The source stage matches the acquire semaphore wait stage.
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (
                A::empty(),
                A::TRANSFER_WRITE,
                S::TRANSFER,
                S::TRANSFER,
            ),
            (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR) => (
                A::TRANSFER_WRITE,
                A::empty(),
                S::TRANSFER,
                S::BOTTOM_OF_PIPE,
            ),
            // Output image back to shader-writable for the next frame
            (L::TRANSFER_SRC_OPTIMAL, L::GENERAL) => (
                A::TRANSFER_READ,
                A::SHADER_WRITE,
                S::TRANSFER,
                S::RAY_TRACING_SHADER_KHR,
            ),
            _ => (
                A::MEMORY_WRITE,
                A::MEMORY_READ | A::MEMORY_WRITE,
                S::ALL_COMMANDS,
                S::ALL_COMMANDS,
            ),
        };

        Self {
            image,
            old_layout,
            new_layout,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        }
    }

    pub fn barrier(&self) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(COLOR_SUBRESOURCE_RANGE)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
    }

    /// Record this transition as a pipeline barrier.
    pub unsafe fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_pipeline_barrier(
            cmd,
            self.src_stage,
            self.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[self.barrier()],
        );
    }
}

/// Barriers around the output-to-swapchain copy, in recording order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBarriers {
    /// Output GENERAL→TRANSFER_SRC, then swapchain UNDEFINED→TRANSFER_DST.
    pub before_copy: [ImageTransition; 2],
    /// Swapchain TRANSFER_DST→PRESENT_SRC, then output TRANSFER_SRC→GENERAL.
    pub after_copy: [ImageTransition; 2],
}

impl FrameBarriers {
    pub fn new(output: vk::Image, target: vk::Image) -> Self {
        Self {
            before_copy: [
                ImageTransition::new(output, vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                ImageTransition::new(target, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            ],
            after_copy: [
                ImageTransition::new(target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR),
                ImageTransition::new(output, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::GENERAL),
            ],
        }
    }

    /// All four transitions in the order they are recorded.
    pub fn sequence(&self) -> [ImageTransition; 4] {
        [self.before_copy[0], self.before_copy[1], self.after_copy[0], self.after_copy[1]]
    }

    /// Record the barriers, the full-extent copy, and the trailing barriers.
    pub unsafe fn record_copy(&self, device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        for transition in &self.before_copy {
            transition.record(device, cmd);
        }

        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageCopy {
            src_subresource: layers,
            src_offset: vk::Offset3D::default(),
            dst_subresource: layers,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
        };
        device.cmd_copy_image(
            cmd,
            self.before_copy[0].image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            self.before_copy[1].image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );

        for transition in &self.after_copy {
            transition.record(device, cmd);
        }
    }
}

/// Command buffer manager with one primary buffer per frame slot.
pub struct CommandManager {
    pool: vk::CommandPool,
    frame_buffers: Vec<vk::CommandBuffer>,
    transient_pool: vk::CommandPool,
    device: ash::Device,
}

impl CommandManager {
    /// Create a new command manager.
    pub unsafe fn new(ctx: &VulkanContext, slot_count: usize) -> RenderResult<Self> {
        let graphics_family = ctx.queue_families.graphics
            .ok_or_else(|| RenderError::Unsupported("no graphics queue family".into()))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = ctx.device.create_command_pool(&pool_info, None)
            .map_err(|e| RenderError::creation("frame command pool", e))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slot_count as u32);

        let frame_buffers = match ctx.device.allocate_command_buffers(&alloc_info) {
            Ok(buffers) => buffers,
            Err(e) => {
                ctx.device.destroy_command_pool(pool, None);
                return Err(RenderError::creation("frame command buffers", e));
            }
        };

        // Transient pool for one-shot commands
        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let transient_pool = match ctx.device.create_command_pool(&transient_info, None) {
            Ok(pool) => pool,
            Err(e) => {
                ctx.device.destroy_command_pool(pool, None);
                return Err(RenderError::creation("transient command pool", e));
            }
        };

        Ok(Self {
            pool,
            frame_buffers,
            transient_pool,
            device: ctx.device.clone(),
        })
    }

    /// Reset a slot's command buffer and begin recording into it.
    pub unsafe fn begin_frame(&self, slot: usize) -> RenderResult<vk::CommandBuffer> {
        let cmd = self.frame_buffers[slot];

        self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .map_err(|e| RenderError::device_lost("command buffer reset", e))?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        self.device.begin_command_buffer(cmd, &begin_info)
            .map_err(|e| RenderError::device_lost("command buffer begin", e))?;

        Ok(cmd)
    }

    /// End recording commands for a slot.
    pub unsafe fn end_frame(&self, slot: usize) -> RenderResult<()> {
        self.device.end_command_buffer(self.frame_buffers[slot])
            .map_err(|e| RenderError::device_lost("command buffer end", e))
    }

    /// Submit a slot's commands without waiting.
    ///
    /// Waits on `wait_semaphore` at the transfer stage (where the swapchain
    /// image is first touched), signals `signal_semaphore` and `fence`.
    pub unsafe fn submit_frame(
        &self,
        ctx: &VulkanContext,
        slot: usize,
        wait_semaphore: vk::Semaphore,
        signal_semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> RenderResult<()> {
        let wait_semaphores = [wait_semaphore];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let signal_semaphores = [signal_semaphore];
        let command_buffers = [self.frame_buffers[slot]];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        ctx.device.queue_submit(ctx.graphics_queue, &[submit_info], fence)
            .map_err(|e| RenderError::device_lost("frame submission", e))
    }

    /// Record `record` into a one-shot command buffer, submit it, and block
    /// until the graphics queue is idle.
    pub unsafe fn immediate<F>(&self, ctx: &VulkanContext, record: F) -> RenderResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let cmd = self.begin_single_time()?;
        record(cmd);
        let result = self.end_single_time(ctx, cmd);
        self.device.free_command_buffers(self.transient_pool, &[cmd]);
        result
    }

    /// Begin a single-use command buffer.
    unsafe fn begin_single_time(&self) -> RenderResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self.device.allocate_command_buffers(&alloc_info)
            .map_err(|e| RenderError::creation("one-shot command buffer", e))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.device.free_command_buffers(self.transient_pool, &[cmd]);
            return Err(RenderError::device_lost("command buffer begin", e));
        }

        Ok(cmd)
    }

    /// End and submit a single-use command buffer, waiting for completion.
    unsafe fn end_single_time(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer) -> RenderResult<()> {
        self.device.end_command_buffer(cmd)
            .map_err(|e| RenderError::device_lost("command buffer end", e))?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers);

        ctx.device.queue_submit(ctx.graphics_queue, &[submit_info], vk::Fence::null())
            .map_err(|e| RenderError::device_lost("one-shot submission", e))?;

        ctx.device.queue_wait_idle(ctx.graphics_queue)
            .map_err(|e| RenderError::device_lost("queue wait idle", e))
    }

    /// Destroy both command pools (and with them every buffer).
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.transient_pool, None);
        self.device.destroy_command_pool(self.pool, None);
        self.frame_buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn images() -> (vk::Image, vk::Image) {
        (vk::Image::from_raw(0x10), vk::Image::from_raw(0x20))
    }

    // ============================================================
    // Per-frame barrier sequence
    // ============================================================

    #[test]
    fn test_frame_barrier_order() {
        let (output, target) = images();
        let sequence = FrameBarriers::new(output, target).sequence();

        let layouts: Vec<_> = sequence.iter()
            .map(|t| (t.image, t.old_layout, t.new_layout))
            .collect();

        assert_eq!(layouts, vec![
            (output, vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
            (target, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR),
            (output, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::GENERAL),
        ]);
    }

    #[test]
    fn test_output_waits_for_shader_writes() {
        let (output, target) = images();
        let first = FrameBarriers::new(output, target).before_copy[0];
        assert_eq!(first.src_access, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(first.dst_access, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(first.src_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
        assert_eq!(first.dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn test_output_returns_to_shader_write() {
        let (output, target) = images();
        let last = FrameBarriers::new(output, target).after_copy[1];
        assert_eq!(last.src_access, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(last.dst_access, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(last.dst_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
    }

    #[test]
    fn test_swapchain_image_ends_presentable() {
        let (output, target) = images();
        let present = FrameBarriers::new(output, target).after_copy[0];
        assert_eq!(present.image, target);
        assert_eq!(present.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(present.dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn test_each_image_layout_chain_is_closed() {
        // The output image must end the frame in the layout it started in.
        let (output, target) = images();
        let sequence = FrameBarriers::new(output, target).sequence();
        let output_steps: Vec<_> = sequence.iter().filter(|t| t.image == output).collect();
        assert_eq!(output_steps.first().unwrap().old_layout, output_steps.last().unwrap().new_layout);
        for pair in output_steps.windows(2) {
            assert_eq!(pair[0].new_layout, pair[1].old_layout);
        }
    }

    // ============================================================
    // Transition table
    // ============================================================

    #[test]
    fn test_initial_output_transition() {
        let t = ImageTransition::new(vk::Image::null(), vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL);
        assert_eq!(t.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(t.dst_access, vk::AccessFlags::SHADER_WRITE);
    }

    #[test]
    fn test_unknown_transition_is_conservative() {
        let t = ImageTransition::new(
            vk::Image::null(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::GENERAL,
        );
        assert_eq!(t.src_stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
    }

    #[test]
    fn test_barrier_carries_layouts() {
        let (output, _) = images();
        let t = ImageTransition::new(output, vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let barrier = t.barrier();
        assert_eq!(barrier.image, output);
        assert_eq!(barrier.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }
}
