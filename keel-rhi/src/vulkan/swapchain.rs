//! Window surface and swapchain.

use std::sync::Arc;

use ash::vk;
use keel_core::log;
use keel_rhi_derive::DeviceObject;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use crate::vulkan::core::VulkanCore;
use crate::vulkan::device::{DeviceObject, LogicalDevice};
use crate::vulkan::texture::create_view;
use crate::{RhiError, RhiResult};

/// Presentation surface of one window.
pub struct SurfaceWindow {
    /// Keeps the window alive for as long as the surface exists.
    _window: Arc<Window>,
    loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl SurfaceWindow {
    pub fn new(window: &Arc<Window>, core: &VulkanCore) -> RhiResult<Self> {
        let display_handle = window
            .display_handle()
            .map_err(|err| RhiError::Surface(err.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|err| RhiError::Surface(err.to_string()))?
            .as_raw();

        let loader = ash::khr::surface::Instance::new(core.entry(), core.instance());
        let surface = unsafe {
            ash_window::create_surface(core.entry(), core.instance(), display_handle, window_handle, None)?
        };

        Ok(Self {
            _window: window.clone(),
            loader,
            surface,
        })
    }

    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }

    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> RhiResult<vk::SurfaceCapabilitiesKHR> {
        Ok(unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)?
        })
    }
}

impl Drop for SurfaceWindow {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// Swapchain configuration parameters.
#[derive(Clone, Debug)]
pub struct SwapchainConfig {
    pub preferred_format: vk::Format,
    pub preferred_color_space: vk::ColorSpaceKHR,
    pub preferred_present_mode: vk::PresentModeKHR,
    pub num_back_buffers: u32,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            preferred_format: vk::Format::B8G8R8A8_SRGB,
            preferred_color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            preferred_present_mode: vk::PresentModeKHR::MAILBOX,
            num_back_buffers: 3,
        }
    }
}

/// Swapchain with one view per image.
#[DeviceObject]
pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain for `surface`, retiring `old` if given. The caller waits for the
    /// device to be idle before replacing a swapchain.
    #[profiling::function]
    pub fn new(
        core: &VulkanCore,
        device: &LogicalDevice,
        physical_device: vk::PhysicalDevice,
        surface: &SurfaceWindow,
        config: &SwapchainConfig,
        extent: vk::Extent2D,
        old: Option<Swapchain>,
    ) -> RhiResult<Self> {
        let capabilities = surface.capabilities(physical_device)?;
        let formats = unsafe {
            surface
                .loader()
                .get_physical_device_surface_formats(physical_device, surface.handle())?
        };
        let format = choose_surface_format(&formats, config)
            .ok_or_else(|| RhiError::Swapchain("surface reports no formats".to_owned()))?;
        let present_modes = unsafe {
            surface
                .loader()
                .get_physical_device_surface_present_modes(physical_device, surface.handle())?
        };
        let present_mode = choose_present_mode(&present_modes, config);
        let extent = get_swapchain_extent(&capabilities, extent);

        let loader = match &old {
            Some(old) => old.loader.clone(),
            None => ash::khr::swapchain::Device::new(core.instance(), device.handle()),
        };
        let old_handle = old.as_ref().map_or(vk::SwapchainKHR::null(), |old| old.swapchain);

        let swapchain = create_or_recreate(
            &loader,
            surface.handle(),
            capabilities,
            format,
            present_mode,
            config.num_back_buffers,
            extent,
            old_handle,
        );
        // The retired swapchain is destroyed whether or not the new one could be created.
        drop(old);
        let swapchain = swapchain?;

        let raw = device.handle();
        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(err.into());
            }
        };
        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            match create_view(
                raw,
                image,
                format.format,
                vk::ImageAspectFlags::COLOR,
                vk::ImageViewType::TYPE_2D,
                0,
                1,
            ) {
                Ok(view) => views.push(view),
                Err(err) => {
                    unsafe {
                        for view in views {
                            raw.destroy_image_view(view, None);
                        }
                        loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(err.into());
                }
            }
        }
        device.set_debug_name(swapchain, "swapchain");

        Ok(Self {
            loader,
            swapchain,
            images,
            views,
            format,
            present_mode,
            extent,
            device: raw.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn loader(&self) -> &ash::khr::swapchain::Device {
        &self.loader
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image(&self, index: u32) -> Option<(vk::Image, vk::ImageView)> {
        let index = index as usize;
        Some((*self.images.get(index)?, *self.views.get(index)?))
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.views {
                self.device().destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_or_recreate(
    loader: &ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    capabilities: vk::SurfaceCapabilitiesKHR,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    num_back_buffers: u32,
    extent: vk::Extent2D,
    old_swapchain: vk::SwapchainKHR,
) -> RhiResult<vk::SwapchainKHR> {
    let mut image_count = num_back_buffers.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }

    log::info!(
        "Creating swapchain: {:?} {:?}, {}x{}, {} images, {:?}",
        format.format,
        format.color_space,
        extent.width,
        extent.height,
        image_count,
        present_mode
    );

    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    Ok(unsafe { loader.create_swapchain(&create_info, None)? })
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR], config: &SwapchainConfig) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == config.preferred_format && f.color_space == config.preferred_color_space)
        .or_else(|| formats.first())
        .copied()
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], config: &SwapchainConfig) -> vk::PresentModeKHR {
    if modes.contains(&config.preferred_present_mode) {
        config.preferred_present_mode
    } else if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        // Always available.
        vk::PresentModeKHR::FIFO
    }
}

/// The extent the surface dictates, or `window_extent` clamped to what it allows.
pub(crate) fn get_swapchain_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent
                .width
                .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
            height: window_extent
                .height
                .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn surface_dictated_extent_wins() {
        let caps = capabilities(vk::Extent2D {
            width: 800,
            height: 600,
        });
        let extent = get_swapchain_extent(
            &caps,
            vk::Extent2D {
                width: 1024,
                height: 768,
            },
        );
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn free_extent_is_clamped() {
        let caps = capabilities(vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        });
        let extent = get_swapchain_extent(
            &caps,
            vk::Extent2D {
                width: 9000,
                height: 0,
            },
        );
        assert_eq!((extent.width, extent.height), (4096, 1));
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let config = SwapchainConfig {
            preferred_present_mode: vk::PresentModeKHR::IMMEDIATE,
            ..Default::default()
        };
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], &config),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE], &config),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn surface_format_prefers_config() {
        let config = SwapchainConfig::default();
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats, &config).map(|f| f.format);
        assert_eq!(chosen, Some(vk::Format::B8G8R8A8_SRGB));
        assert!(choose_surface_format(&[], &config).is_none());
    }
}
