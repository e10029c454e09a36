// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and the window system extensions
// - Physical device selection (prefer discrete GPU)
// - Logical device + graphics queue creation
// - Present fence support through VK_EXT_swapchain_maintenance1 when available
// - Raw fence/semaphore/queue calls behind DeviceProvider + SyncAllocator

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;
use std::time::Duration;

use super::{timeout_nanos, DeviceProvider, FenceStatus, PresentRequest, Submission, SyncAllocator};

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    pub device: ash::Device,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub(crate) entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    /// VK_EXT_swapchain_maintenance1 enabled: presents can signal a fence
    swapchain_maintenance1: bool,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `display` - Display the surfaces will be created for
    pub fn new(app_name: &str, enable_validation: bool, display: RawDisplayHandle) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let (instance, surface_maintenance1) =
            Self::create_instance(&entry, app_name, enable_validation, display)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;

        // Step 5: Create logical device
        let swapchain_maintenance1 =
            surface_maintenance1 && Self::supports_swapchain_maintenance1(&instance, physical_device)?;
        let (device, graphics_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            swapchain_maintenance1,
        )?;
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        // Step 6: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            properties
                .device_name_as_c_str()
                .unwrap_or(c"<unnamed>")
                .to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Present fences: {}",
            if swapchain_maintenance1 { "VK_EXT_swapchain_maintenance1" } else { "unsupported" }
        );

        Ok(Arc::new(Self {
            device,
            swapchain_loader,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            swapchain_maintenance1,
            properties,
        }))
    }

    /// Returns the instance and whether surface_maintenance1 could be enabled
    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> Result<(ash::Instance, bool)> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("vk-presenter")?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Platform surface extensions
        let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
            .context("Unsupported display for Vulkan surfaces")?
            .to_vec();

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        // Surface side of present fences
        let available = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        let has = |name: &CStr| {
            available
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(name))
        };
        let surface_maintenance1 =
            has(ash::ext::surface_maintenance1::NAME) && has(ash::khr::get_surface_capabilities2::NAME);
        if surface_maintenance1 {
            extensions.push(ash::khr::get_surface_capabilities2::NAME.as_ptr());
            extensions.push(ash::ext::surface_maintenance1::NAME.as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok((instance, surface_maintenance1))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            if !Self::has_device_extension(instance, device, ash::khr::swapchain::NAME)? {
                continue;
            }

            // Find graphics queue family
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32);

            if let Some(graphics_family) = graphics_family {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn has_device_extension(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        name: &CStr,
    ) -> Result<bool> {
        let extensions =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }?;
        Ok(extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(name)))
    }

    fn supports_swapchain_maintenance1(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<bool> {
        if !Self::has_device_extension(instance, physical_device, ash::ext::swapchain_maintenance1::NAME)? {
            return Ok(false);
        }
        let mut maintenance1 = vk::PhysicalDeviceSwapchainMaintenance1FeaturesEXT::default();
        {
            let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut maintenance1);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
        }
        Ok(maintenance1.swapchain_maintenance1 == vk::TRUE)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        swapchain_maintenance1: bool,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities);

        // Required device extensions
        let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];
        if swapchain_maintenance1 {
            extensions.push(ash::ext::swapchain_maintenance1::NAME.as_ptr());
        }

        let mut maintenance1 =
            vk::PhysicalDeviceSwapchainMaintenance1FeaturesEXT::default().swapchain_maintenance1(true);
        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);
        if swapchain_maintenance1 {
            create_info = create_info.push_next(&mut maintenance1);
        }

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }
}

impl DeviceProvider for VulkanDevice {
    fn submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores);

        unsafe {
            self.device
                .queue_submit(queue, std::slice::from_ref(&submit_info), fence)
        }
    }

    fn present(&self, queue: vk::Queue, request: &PresentRequest) -> vk::Result {
        let swapchains = [request.swapchain];
        let image_indices = [request.image_index];
        let fences = [request.fence.unwrap_or_default()];

        let mut fence_info = vk::SwapchainPresentFenceInfoEXT::default().fences(&fences);
        let mut present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&request.wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        if request.fence.is_some() && self.swapchain_maintenance1 {
            present_info = present_info.push_next(&mut fence_info);
        }

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) => vk::Result::SUCCESS,
            Ok(true) => vk::Result::SUBOPTIMAL_KHR,
            Err(e) => e,
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<FenceStatus> {
        let signaled = unsafe { self.device.get_fence_status(fence) }?;
        Ok(if signaled {
            FenceStatus::Signaled
        } else {
            FenceStatus::NotReady
        })
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> VkResult<FenceStatus> {
        match unsafe {
            self.device
                .wait_for_fences(&[fence], true, timeout_nanos(timeout))
        } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::NotReady),
            Err(e) => Err(e),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn supports_present_fence(&self) -> bool {
        self.swapchain_maintenance1
    }
}

impl SyncAllocator for VulkanDevice {
    fn allocate_fence(&self, start_signaled: bool) -> VkResult<vk::Fence> {
        let flags = if start_signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
    }

    fn allocate_semaphore(&self) -> VkResult<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
