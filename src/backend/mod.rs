// Backend module - the collaborators the presentation layer talks to
//
// Design: narrow traits over the device, the queue and the window surface.
// VulkanDevice / VulkanSurface implement them with ash; tests use the mock.

pub mod device;
pub mod queue;
pub mod swapchain;

#[cfg(test)]
pub(crate) mod mock;

pub use device::VulkanDevice;
pub use queue::DeviceQueues;
pub use swapchain::VulkanSurface;

use ash::prelude::VkResult;
use ash::vk;
use std::time::Duration;

/// Host-visible status of a physical fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    NotReady,
}

/// Width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero-sized extent
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<vk::Extent2D> for Extent {
    fn from(e: vk::Extent2D) -> Self {
        Self::new(e.width, e.height)
    }
}

impl From<Extent> for vk::Extent2D {
    fn from(e: Extent) -> Self {
        vk::Extent2D {
            width: e.width,
            height: e.height,
        }
    }
}

/// What the surface can do right now.
#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    /// `None` when the platform lets the swapchain decide (window size must be polled)
    pub current_extent: Option<Extent>,
    pub min_extent: Extent,
    pub max_extent: Extent,
    pub min_image_count: u32,
    /// 0 means no upper limit
    pub max_image_count: u32,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceCapabilities {
    /// Resolve the swapchain extent, clamping the window size when the surface has no fixed extent
    pub fn resolve_extent(&self, window: Extent) -> Extent {
        match self.current_extent {
            Some(extent) => extent,
            // A minimized window stays zero-sized so the caller can skip the frame
            None if window.is_empty() => window,
            None => Extent::new(
                window.width.max(self.min_extent.width).min(self.max_extent.width),
                window.height.max(self.min_extent.height).min(self.max_extent.height),
            ),
        }
    }

    /// Surface minimum plus `extra`, capped by the maximum when there is one
    pub fn image_count(&self, extra: u32) -> u32 {
        let count = self.min_image_count + extra;
        if self.max_image_count > 0 {
            count.min(self.max_image_count)
        } else {
            count
        }
    }

    pub fn supports(&self, mode: vk::PresentModeKHR) -> bool {
        self.present_modes.contains(&mode)
    }
}

/// Parameters for one swapchain generation.
#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    pub extent: Extent,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    /// Previous swapchain, passed to the driver as a recreation hint
    pub old_swapchain: Option<vk::SwapchainKHR>,
}

/// The result of creating a swapchain.
#[derive(Debug, Clone)]
pub struct SwapchainImages {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
}

/// One queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// One presentation request.
#[derive(Debug, Clone)]
pub struct PresentRequest {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// Signaled once the presentation engine is done with the image
    /// (only with the present-fence capability)
    pub fence: Option<vk::Fence>,
}

/// Device + queue operations.
pub trait DeviceProvider: Send + Sync {
    fn submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()>;

    /// Returns the raw result code: SUCCESS, SUBOPTIMAL_KHR or an error
    fn present(&self, queue: vk::Queue, request: &PresentRequest) -> vk::Result;

    fn fence_status(&self, fence: vk::Fence) -> VkResult<FenceStatus>;

    /// `NotReady` means the timeout elapsed
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> VkResult<FenceStatus>;

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    fn wait_idle(&self) -> VkResult<()>;

    /// Whether presents can carry a fence (VK_EXT_swapchain_maintenance1)
    fn supports_present_fence(&self) -> bool;
}

/// Creation and destruction of physical sync objects.
pub trait SyncAllocator: Send + Sync {
    fn allocate_fence(&self, start_signaled: bool) -> VkResult<vk::Fence>;
    fn allocate_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
}

/// Everything the sync banks and fences need from a device.
pub trait GpuDevice: DeviceProvider + SyncAllocator {}

impl<T: DeviceProvider + SyncAllocator> GpuDevice for T {}

/// The presentable surface of one window.
pub trait SurfaceProvider: Send + Sync {
    fn current_capabilities(&self) -> VkResult<SurfaceCapabilities>;

    /// Current inner size of the window
    fn poll_window_size(&self) -> Extent;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<SwapchainImages>;

    /// Ok((index, suboptimal)) or the driver error (ERROR_OUT_OF_DATE_KHR included)
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Duration,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
}

/// Vulkan timeouts are in nanoseconds
pub(crate) fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
