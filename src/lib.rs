// =============================================================================
// VK-PRESENTER - Swapchain presentation and sync object recycling for Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  PresentationManager  (acquire / present / garbage collection)  │
// │    └── SwapBufferChain  (one swapchain generation)              │
// │          └── SyncBanks  (fence + semaphore recycling)           │
// │                └── LogicalFence  (fence + submission timeline)  │
// │                      └── backend traits  (device, surface)      │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. manager.acquire()  -> maybe recreate the chain, hand out an image
// 2. renderer submits work waiting on the acquire semaphore
// 3. manager.present()  -> queue the present, track what keeps old chains alive
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod present;
pub mod sync;

pub use backend::{DeviceQueues, Extent, GpuDevice, Submission, SurfaceProvider, VulkanDevice, VulkanSurface};
pub use config::Config;
pub use error::{ErrorKind, PresentError, PresentResult};
pub use present::{FrameImage, PresentationManager, PresentationStats, SwapBufferChain};
pub use sync::{FenceBank, LogicalFence, SemaphoreBank, SubmissionToken, SyncBanks};
