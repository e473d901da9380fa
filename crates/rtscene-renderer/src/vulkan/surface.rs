//! Surface format, present mode and extent negotiation.

use ash::vk;

use super::VulkanContext;
use crate::error::{RenderError, RenderResult};

/// Presentation properties of the context's window surface.
pub struct VulkanSurface {
    pub handle: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
}

impl VulkanSurface {
    /// Query the surface owned by `ctx` and pick format and present mode.
    pub unsafe fn new(ctx: &VulkanContext, vsync: bool) -> RenderResult<Self> {
        let handle = ctx.surface;

        let capabilities = ctx.surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, handle)
            .map_err(|e| RenderError::creation("surface capabilities", e))?;

        let formats = ctx.surface_loader
            .get_physical_device_surface_formats(ctx.physical_device, handle)
            .map_err(|e| RenderError::creation("surface formats", e))?;

        let format = Self::choose_surface_format(&formats);

        let present_modes = ctx.surface_loader
            .get_physical_device_surface_present_modes(ctx.physical_device, handle)
            .map_err(|e| RenderError::creation("present modes", e))?;

        let present_mode = Self::choose_present_mode(&present_modes, vsync);

        log::info!("Surface format {:?} / {:?}, present mode {:?}", format.format, format.color_space, present_mode);

        Ok(Self {
            handle,
            format,
            present_mode,
            capabilities,
        })
    }

    /// Choose the surface format.
    ///
    /// The output image shares this format and is written as a storage image,
    /// so UNORM is preferred over SRGB.
    fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
        formats.iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM &&
                f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .unwrap_or(vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            })
    }

    /// Choose the present mode: MAILBOX when available, FIFO otherwise.
    fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
        if !vsync && modes.contains(&vk::PresentModeKHR::MAILBOX) {
            return vk::PresentModeKHR::MAILBOX;
        }

        // FIFO is guaranteed to be available
        vk::PresentModeKHR::FIFO
    }

    /// Refresh surface capabilities (e.g., after window resize).
    pub unsafe fn refresh_capabilities(&mut self, ctx: &VulkanContext) -> RenderResult<()> {
        self.capabilities = ctx.surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, self.handle)
            .map_err(|e| RenderError::creation("surface capabilities", e))?;
        Ok(())
    }

    /// Get the current extent, clamped to surface capabilities.
    pub fn get_extent(&self, desired_width: u32, desired_height: u32) -> vk::Extent2D {
        clamp_extent(&self.capabilities, desired_width, desired_height)
    }
}

/// Extent the swapchain should use for a window of the desired size.
pub fn clamp_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        // The surface size is defined
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn test_prefers_unorm_bgra() {
        let formats = [
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = VulkanSurface::choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn test_falls_back_to_first_format() {
        let formats = [format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let chosen = VulkanSurface::choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_mailbox_when_available() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(VulkanSurface::choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(VulkanSurface::choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_fifo_fallback() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(VulkanSurface::choose_present_mode(&modes, false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_defined_extent_wins() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 800, height: 600 },
            ..Default::default()
        };
        assert_eq!(clamp_extent(&caps, 1280, 720), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_undefined_extent_is_clamped() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 1024, height: 1024 },
            ..Default::default()
        };
        assert_eq!(clamp_extent(&caps, 4096, 300), vk::Extent2D { width: 1024, height: 300 });
    }
}
