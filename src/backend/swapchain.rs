// Swapchain - Window presentation
//
// VulkanSurface owns the VkSurfaceKHR of one winit window and creates,
// acquires from and destroys swapchains on it. Which swapchain is current,
// and when an old one may go, is decided by the presentation manager.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Duration;
use winit::window::Window;

use super::{
    timeout_nanos, Extent, SurfaceCapabilities, SurfaceProvider, SwapchainDesc, SwapchainImages,
    VulkanDevice,
};

pub struct VulkanSurface {
    pub surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    format: vk::SurfaceFormatKHR,
    window: Arc<Window>,
    device: Arc<VulkanDevice>,
}

impl VulkanSurface {
    pub fn new(device: Arc<VulkanDevice>, window: Arc<Window>) -> Result<Self> {
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?;
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?;

        let surface = unsafe {
            ash_window::create_surface(
                &device.entry,
                &device.instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .context("Failed to create surface")?;
        let surface_loader = ash::khr::surface::Instance::new(&device.entry, &device.instance);

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        }?;
        if !supported {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("Graphics queue cannot present to this window");
        }

        // Query supported formats
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }?;

        // Choose surface format (prefer SRGB)
        let format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .context("No suitable surface format")?;

        log::info!("Surface format: {:?} / {:?}", format.format, format.color_space);

        Ok(Self {
            surface,
            surface_loader,
            format,
            window,
            device,
        })
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }
}

impl SurfaceProvider for VulkanSurface {
    fn current_capabilities(&self) -> VkResult<SurfaceCapabilities> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.device.physical_device, self.surface)
        }?;
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.device.physical_device, self.surface)
        }?;

        // u32::MAX means the window size decides
        let current_extent =
            (caps.current_extent.width != u32::MAX).then(|| Extent::from(caps.current_extent));

        Ok(SurfaceCapabilities {
            current_extent,
            min_extent: caps.min_image_extent.into(),
            max_extent: caps.max_image_extent.into(),
            min_image_count: caps.min_image_count,
            max_image_count: caps.max_image_count,
            present_modes,
        })
    }

    fn poll_window_size(&self) -> Extent {
        let size = self.window.inner_size();
        Extent::new(size.width, size.height)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<SwapchainImages> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.device.physical_device, self.surface)
        }?;

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(desc.image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(desc.extent.into())
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain.unwrap_or_default());

        let swapchain = unsafe { self.device.swapchain_loader.create_swapchain(&create_info, None) }?;

        let images = match unsafe { self.device.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.device.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        log::debug!(
            "Created VkSwapchainKHR {:?} with {} images",
            swapchain,
            images.len()
        );

        Ok(SwapchainImages {
            swapchain,
            images,
            format: self.format.format,
        })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Duration,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.device.swapchain_loader.acquire_next_image(
                swapchain,
                timeout_nanos(timeout),
                semaphore,
                fence,
            )
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.device.swapchain_loader.destroy_swapchain(swapchain, None) };
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}
