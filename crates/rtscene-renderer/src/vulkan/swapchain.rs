//! Vulkan swapchain management.

use ash::vk;

use super::{VulkanContext, VulkanSurface, COLOR_SUBRESOURCE_RANGE};
use crate::error::{RenderError, RenderResult};
use crate::frame::{AcquireOutcome, PresentOutcome};

/// Presentable image chain. Synchronization lives in the frame slots.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain, retiring `old_swapchain` if given.
    pub unsafe fn new(
        ctx: &VulkanContext,
        surface: &VulkanSurface,
        width: u32,
        height: u32,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> RenderResult<Self> {
        let extent = surface.get_extent(width, height);

        let min_images = surface.capabilities.min_image_count;
        let max_images = if surface.capabilities.max_image_count == 0 {
            u32::MAX
        } else {
            surface.capabilities.max_image_count
        };
        let image_count = (min_images + 1).min(max_images);

        let family_indices = ctx.queue_families.unique();
        let concurrent = family_indices.len() > 1;
        let sharing_mode = if concurrent {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        let shared_families: &[u32] = if concurrent { &family_indices } else { &[] };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(surface.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(surface.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let handle = ctx.swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| RenderError::creation("swapchain", e))?;

        if let Some(old) = old_swapchain {
            ctx.swapchain_loader.destroy_swapchain(old, None);
        }

        let images = ctx.swapchain_loader
            .get_swapchain_images(handle)
            .map_err(|e| RenderError::creation("swapchain images", e))?;

        let image_views = Self::create_image_views(ctx, &images, surface.format.format)?;

        log::debug!("Swapchain: {} images at {}x{}", images.len(), extent.width, extent.height);

        Ok(Self {
            handle,
            images,
            image_views,
            format: surface.format.format,
            extent,
        })
    }

    /// Create image views for swapchain images.
    unsafe fn create_image_views(
        ctx: &VulkanContext,
        images: &[vk::Image],
        format: vk::Format,
    ) -> RenderResult<Vec<vk::ImageView>> {
        images.iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(COLOR_SUBRESOURCE_RANGE);

                ctx.device.create_image_view(&create_info, None)
                    .map_err(|e| RenderError::creation("swapchain image view", e))
            })
            .collect()
    }

    /// Acquire the next image, signalling `image_available` when it is ready.
    ///
    /// A suboptimal acquire still hands out an image (and its semaphore will
    /// be signalled), so the frame proceeds and presentation reports the
    /// stale surface afterwards.
    pub unsafe fn acquire_next_image(
        &self,
        ctx: &VulkanContext,
        image_available: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let result = ctx.swapchain_loader.acquire_next_image(
            self.handle,
            u64::MAX,
            image_available,
            vk::Fence::null(),
        );

        // A suboptimal image is still rendered; presentation reports it
        match result {
            Ok((index, _suboptimal)) => Ok(AcquireOutcome::Ready(index)),
            Err(e) => match RenderError::presentation("swapchain image acquisition", e) {
                err if err.is_recoverable() => Ok(AcquireOutcome::Stale),
                err => Err(err),
            },
        }
    }

    /// Present `image_index` once `render_finished` is signalled.
    pub unsafe fn present(
        &self,
        ctx: &VulkanContext,
        image_index: u32,
        render_finished: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let wait_semaphores = [render_finished];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = match ctx.swapchain_loader.queue_present(ctx.present_queue, &present_info) {
            Ok(false) => return Ok(PresentOutcome::Presented),
            Ok(true) => vk::Result::SUBOPTIMAL_KHR,
            Err(e) => e,
        };

        match RenderError::presentation("presentation", result) {
            err if err.is_recoverable() => Ok(PresentOutcome::Stale),
            err => Err(err),
        }
    }

    /// Rebuild the chain for a new surface size, retiring the current one.
    pub unsafe fn recreate(
        &mut self,
        ctx: &VulkanContext,
        surface: &VulkanSurface,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        for view in self.image_views.drain(..) {
            ctx.device.destroy_image_view(view, None);
        }

        *self = Self::new(ctx, surface, width, height, Some(self.handle))?;
        Ok(())
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    /// Destroy the swapchain and its image views.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        for view in self.image_views.drain(..) {
            ctx.device.destroy_image_view(view, None);
        }

        ctx.swapchain_loader.destroy_swapchain(self.handle, None);
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }
}
