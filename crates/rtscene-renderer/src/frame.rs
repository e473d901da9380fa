//! Double-buffered frame loop.
//!
//! [`FrameScheduler`] owns the slot cycle and the recreation decisions; the
//! GPU work behind each step goes through [`FrameDriver`], which the render
//! context implements.

use ash::vk;

use crate::error::{RenderError, RenderResult};
use crate::uniforms::FrameUniforms;
use crate::vulkan::{Buffer, MemoryManager, VulkanContext};

/// Frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Result of asking the swapchain for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    /// The surface changed; nothing was acquired.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the chain no longer matches the surface.
    Stale,
}

/// What one call to [`FrameScheduler::draw_frame`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// The surface was rebuilt; a frame may or may not have been presented.
    Recreated,
    /// Recreation is waiting for a nonzero surface size.
    Skipped,
}

/// GPU-facing steps of one frame, called in order by the scheduler.
pub trait FrameDriver {
    /// Block until `slot`'s previous submission has finished.
    fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()>;
    fn acquire_image(&mut self, slot: usize) -> RenderResult<AcquireOutcome>;
    fn write_uniforms(&mut self, slot: usize) -> RenderResult<()>;
    /// Reset `slot`'s fence. Only called once an image was acquired.
    fn reset_slot(&mut self, slot: usize) -> RenderResult<()>;
    fn record_commands(&mut self, slot: usize, image_index: u32) -> RenderResult<()>;
    fn submit(&mut self, slot: usize) -> RenderResult<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome>;
    /// Rebuild the size-dependent resources.
    ///
    /// Returns `false` when the surface is still zero-sized and the rebuild
    /// has to be retried later.
    fn recreate_surface(&mut self) -> RenderResult<bool>;
}

/// Slot cycling and recreation state.
#[derive(Debug)]
pub struct FrameScheduler {
    current: usize,
    slot_count: usize,
    resize_requested: bool,
    recreate_pending: bool,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new(MAX_FRAMES_IN_FLIGHT)
    }
}

impl FrameScheduler {
    pub fn new(slot_count: usize) -> Self {
        Self {
            current: 0,
            slot_count: slot_count.max(1),
            resize_requested: false,
            recreate_pending: false,
        }
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Flag an external resize; honored after the next presentation.
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn resize_requested(&self) -> bool {
        self.resize_requested
    }

    pub fn recreate_pending(&self) -> bool {
        self.recreate_pending
    }

    /// Run one iteration of the frame loop.
    pub fn draw_frame<D: FrameDriver + ?Sized>(&mut self, driver: &mut D) -> RenderResult<FrameOutcome> {
        if self.recreate_pending && !self.recreate(driver)? {
            return Ok(FrameOutcome::Skipped);
        }

        let slot = self.current;
        driver.wait_for_slot(slot)?;

        let image_index = match driver.acquire_image(slot)? {
            AcquireOutcome::Ready(index) => index,
            AcquireOutcome::Stale => {
                // Fence stays signaled and the slot is reused next time
                return Ok(if self.recreate(driver)? {
                    FrameOutcome::Recreated
                } else {
                    FrameOutcome::Skipped
                });
            }
        };

        driver.write_uniforms(slot)?;
        driver.reset_slot(slot)?;
        driver.record_commands(slot, image_index)?;
        driver.submit(slot)?;

        let presented = driver.present(slot, image_index)?;
        let outcome = if presented == PresentOutcome::Stale || self.resize_requested {
            self.recreate(driver)?;
            FrameOutcome::Recreated
        } else {
            FrameOutcome::Presented
        };

        self.current = (slot + 1) % self.slot_count;
        Ok(outcome)
    }

    fn recreate<D: FrameDriver + ?Sized>(&mut self, driver: &mut D) -> RenderResult<bool> {
        self.resize_requested = false;
        let done = driver.recreate_surface()?;
        self.recreate_pending = !done;
        Ok(done)
    }
}

/// Synchronization objects and uniform buffer of one in-flight frame.
///
/// The command buffer and descriptor set for the slot live in
/// [`CommandManager`](crate::vulkan::CommandManager) and
/// [`ResourceBinder`](crate::vulkan::ResourceBinder) under the same index.
pub struct FrameSlot {
    pub in_flight: vk::Fence,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub uniform_buffer: Buffer,
}

impl FrameSlot {
    pub unsafe fn new(ctx: &VulkanContext, memory: &MemoryManager, index: usize) -> RenderResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::default()
            .flags(vk::FenceCreateFlags::SIGNALED);

        let uniform_buffer = memory.allocate(
            std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            crate::vulkan::memory::HOST_VISIBLE_COHERENT,
            &format!("frame{}_uniforms", index),
        )?;

        let sync = (|| {
            let image_available = ctx.device.create_semaphore(&semaphore_info, None)?;
            let render_finished = match ctx.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    ctx.device.destroy_semaphore(image_available, None);
                    return Err(e);
                }
            };
            match ctx.device.create_fence(&fence_info, None) {
                Ok(fence) => Ok((image_available, render_finished, fence)),
                Err(e) => {
                    ctx.device.destroy_semaphore(image_available, None);
                    ctx.device.destroy_semaphore(render_finished, None);
                    Err(e)
                }
            }
        })();

        match sync {
            Ok((image_available, render_finished, in_flight)) => Ok(Self {
                in_flight,
                image_available,
                render_finished,
                uniform_buffer,
            }),
            Err(e) => {
                memory.free(uniform_buffer);
                Err(RenderError::creation("frame synchronization objects", e))
            }
        }
    }

    pub unsafe fn wait(&self, device: &ash::Device) -> RenderResult<()> {
        device.wait_for_fences(&[self.in_flight], true, u64::MAX)
            .map_err(|e| RenderError::device_lost("frame fence wait", e))
    }

    pub unsafe fn reset(&self, device: &ash::Device) -> RenderResult<()> {
        device.reset_fences(&[self.in_flight])
            .map_err(|e| RenderError::device_lost("frame fence reset", e))
    }

    pub unsafe fn destroy(self, device: &ash::Device, memory: &MemoryManager) {
        device.destroy_fence(self.in_flight, None);
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        memory.free(self.uniform_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Uniforms(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        Recreate,
    }

    /// Driver that logs calls and models each slot's fence.
    struct MockDriver {
        calls: Vec<Call>,
        /// True while the slot has unfinished work on the "GPU".
        in_flight: [bool; MAX_FRAMES_IN_FLIGHT],
        /// Fence state; starts signaled.
        signaled: [bool; MAX_FRAMES_IN_FLIGHT],
        acquire_results: Vec<AcquireOutcome>,
        present_results: Vec<PresentOutcome>,
        recreate_results: Vec<bool>,
        next_image: u32,
        fail_submit: bool,
    }

    impl MockDriver {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                in_flight: [false; MAX_FRAMES_IN_FLIGHT],
                signaled: [true; MAX_FRAMES_IN_FLIGHT],
                acquire_results: Vec::new(),
                present_results: Vec::new(),
                recreate_results: Vec::new(),
                next_image: 0,
                fail_submit: false,
            }
        }

        fn waited_slots(&self) -> Vec<usize> {
            self.calls.iter()
                .filter_map(|c| match c {
                    Call::Wait(slot) => Some(*slot),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, call: Call) -> usize {
            self.calls.iter().filter(|&&c| c == call).count()
        }
    }

    impl FrameDriver for MockDriver {
        fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()> {
            self.calls.push(Call::Wait(slot));
            // Waiting completes the slot's outstanding work
            self.in_flight[slot] = false;
            self.signaled[slot] = true;
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> RenderResult<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            if !self.acquire_results.is_empty() {
                return Ok(self.acquire_results.remove(0));
            }
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % 3;
            Ok(AcquireOutcome::Ready(image))
        }

        fn write_uniforms(&mut self, slot: usize) -> RenderResult<()> {
            assert!(!self.in_flight[slot], "uniforms of slot {} written while in flight", slot);
            self.calls.push(Call::Uniforms(slot));
            Ok(())
        }

        fn reset_slot(&mut self, slot: usize) -> RenderResult<()> {
            assert!(self.signaled[slot], "slot {} fence reset before it signaled", slot);
            self.calls.push(Call::Reset(slot));
            self.signaled[slot] = false;
            Ok(())
        }

        fn record_commands(&mut self, slot: usize, image_index: u32) -> RenderResult<()> {
            assert!(!self.in_flight[slot], "slot {} re-recorded while in flight", slot);
            self.calls.push(Call::Record(slot, image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> RenderResult<()> {
            self.calls.push(Call::Submit(slot));
            if self.fail_submit {
                return Err(RenderError::device_lost("frame submission", vk::Result::ERROR_DEVICE_LOST));
            }
            self.in_flight[slot] = true;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            if !self.present_results.is_empty() {
                return Ok(self.present_results.remove(0));
            }
            Ok(PresentOutcome::Presented)
        }

        fn recreate_surface(&mut self) -> RenderResult<bool> {
            self.calls.push(Call::Recreate);
            if !self.recreate_results.is_empty() {
                return Ok(self.recreate_results.remove(0));
            }
            Ok(true)
        }
    }

    // ============================================================
    // Slot cycling
    // ============================================================

    #[test]
    fn test_slots_cycle_zero_one() {
        let mut scheduler = FrameScheduler::default();
        let mut driver = MockDriver::new();

        for _ in 0..6 {
            assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Presented);
        }

        assert_eq!(driver.waited_slots(), vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(scheduler.current_slot(), 0);
    }

    #[test]
    fn test_step_order_within_frame() {
        let mut scheduler = FrameScheduler::default();
        let mut driver = MockDriver::new();
        scheduler.draw_frame(&mut driver).unwrap();

        assert_eq!(driver.calls, vec![
            Call::Wait(0),
            Call::Acquire(0),
            Call::Uniforms(0),
            Call::Reset(0),
            Call::Record(0, 0),
            Call::Submit(0),
            Call::Present(0, 0),
        ]);
    }

    #[test]
    fn test_slot_waited_before_reuse() {
        let mut scheduler = FrameScheduler::default();
        let mut driver = MockDriver::new();

        for _ in 0..5 {
            scheduler.draw_frame(&mut driver).unwrap();
        }

        // Every reset of a slot is preceded by a wait on it since its last submit
        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            let mut pending_submit = false;
            for call in &driver.calls {
                match *call {
                    Call::Submit(s) if s == slot => pending_submit = true,
                    Call::Wait(s) if s == slot => pending_submit = false,
                    Call::Reset(s) if s == slot => assert!(!pending_submit),
                    _ => {}
                }
            }
        }
    }

    // ============================================================
    // Stale surface handling
    // ============================================================

    #[test]
    fn test_stale_acquire_recreates_without_reset() {
        let mut scheduler = FrameScheduler::default();
        let mut driver = MockDriver::new();
        driver.acquire_results.push(AcquireOutcome::Stale);

        assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Recreated);
        assert_eq!(driver.calls, vec![Call::Wait(0), Call::Acquire(0), Call::Recreate]);
        assert_eq!(driver.count(Call::Reset(0)), 0);
        assert!(driver.signaled[0]);

        // The same slot is used again
        assert_eq!(scheduler.current_slot(), 0);
        assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Presented);
        assert_eq!(driver.waited_slots(), vec![0, 0]);
    }

    #[test]
    fn test_stale_present_recreates_and_advances() {
        let mut scheduler = FrameScheduler::default();
        let mut driver = MockDriver::new();
        driver.present_results.push(PresentOutcome::Stale);

        assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Recreated);
        assert_eq!(driver.calls.last(), Some(&Call::Recreate));
        assert_eq!(scheduler.current_slot(), 1);
    }

    #[test]
    fn test_resize_flag_recreates_after_present() {
        let mut scheduler = FrameScheduler::default();
        let mut driver = MockDriver::new();

        scheduler.request_resize();
        assert!(scheduler.resize_requested());
        assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Recreated);
        assert!(!scheduler.resize_requested());

        let present = driver.calls.iter().position(|c| matches!(c, Call::Present(..))).unwrap();
        let recreate = driver.calls.iter().position(|c| *c == Call::Recreate).unwrap();
        assert!(present < recreate);

        assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Presented);
        assert_eq!(driver.count(Call::Recreate), 1);
    }

    #[test]
    fn test_zero_extent_defers_frames() {
        let mut scheduler = FrameScheduler::default();
        let mut driver = MockDriver::new();
        driver.acquire_results.push(AcquireOutcome::Stale);
        driver.recreate_results.extend([false, false, true]);

        assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Skipped);
        assert!(scheduler.recreate_pending());

        // Still minimized: no slot work at all
        let before = driver.calls.len();
        assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Skipped);
        assert_eq!(&driver.calls[before..], &[Call::Recreate]);

        // Restored: recreation succeeds and the frame proceeds
        assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Presented);
        assert!(!scheduler.recreate_pending());
        assert_eq!(driver.count(Call::Submit(0)), 1);
    }

    // ============================================================
    // Errors
    // ============================================================

    #[test]
    fn test_submit_failure_propagates_without_advancing() {
        let mut scheduler = FrameScheduler::default();
        let mut driver = MockDriver::new();
        driver.fail_submit = true;

        let err = scheduler.draw_frame(&mut driver).unwrap_err();
        assert!(matches!(err, RenderError::DeviceLost { .. }));
        assert!(!err.is_recoverable());
        assert_eq!(scheduler.current_slot(), 0);
        assert_eq!(driver.count(Call::Present(0, 0)), 0);
    }
}
