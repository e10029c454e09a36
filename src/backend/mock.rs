// In-memory GPU for tests
//
// Implements every collaborator trait without a driver. Fences only become
// signaled when a test says so (signal_fence / complete_all / wait_idle) or
// when auto_complete is on.

use super::*;
use ash::vk::Handle;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy)]
struct MockFence {
    signaled: bool,
    submitted: bool,
}

struct MockSwapchain {
    images: Vec<vk::Image>,
    next_image: u32,
}

struct MockState {
    next_handle: u64,
    fences: HashMap<vk::Fence, MockFence>,
    semaphores: HashSet<vk::Semaphore>,
    fences_allocated: usize,
    semaphores_allocated: usize,
    auto_complete: bool,
    present_fence: bool,
    idle_waits: usize,
    submissions: usize,
    wait_delay: Duration,

    window: Extent,
    fixed_extent: bool,
    min_image_count: u32,
    present_modes: Vec<vk::PresentModeKHR>,
    swapchains: HashMap<vk::SwapchainKHR, MockSwapchain>,
    swapchains_created: usize,
    old_swapchain_hints: Vec<Option<vk::SwapchainKHR>>,
    swapchains_destroyed: Vec<vk::SwapchainKHR>,
    acquires: usize,
    acquire_script: VecDeque<vk::Result>,
    present_script: VecDeque<vk::Result>,
    presents: Vec<PresentRequest>,
}

impl MockState {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn mark_submitted(&mut self, fence: vk::Fence) {
        if fence == vk::Fence::null() {
            return;
        }
        let auto = self.auto_complete;
        let entry = self
            .fences
            .get_mut(&fence)
            .expect("mock: submitted an unknown fence");
        assert!(
            !entry.signaled,
            "mock: submitted a fence that is still signaled"
        );
        entry.submitted = true;
        entry.signaled = auto;
    }
}

pub struct MockGpu {
    state: Mutex<MockState>,
}

impl MockGpu {
    /// 600x200 window without a fixed extent, 3 images per swapchain, no present fences
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_handle: 0x1000,
                fences: HashMap::new(),
                semaphores: HashSet::new(),
                fences_allocated: 0,
                semaphores_allocated: 0,
                auto_complete: false,
                present_fence: false,
                idle_waits: 0,
                submissions: 0,
                wait_delay: Duration::ZERO,
                window: Extent::new(600, 200),
                fixed_extent: false,
                min_image_count: 2,
                present_modes: vec![
                    vk::PresentModeKHR::FIFO,
                    vk::PresentModeKHR::MAILBOX,
                    vk::PresentModeKHR::IMMEDIATE,
                ],
                swapchains: HashMap::new(),
                swapchains_created: 0,
                old_swapchain_hints: Vec::new(),
                swapchains_destroyed: Vec::new(),
                acquires: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                presents: Vec::new(),
            }),
        })
    }

    pub fn set_present_fence(&self, supported: bool) {
        self.state.lock().present_fence = supported;
    }

    /// Every fence handed to the mock is signaled immediately
    pub fn set_auto_complete(&self, on: bool) {
        self.state.lock().auto_complete = on;
    }

    /// Blocking fence waits on an unsignaled fence sleep this long (capped by the timeout) before giving up
    pub fn set_wait_delay(&self, delay: Duration) {
        self.state.lock().wait_delay = delay;
    }

    pub fn set_window_size(&self, width: u32, height: u32) {
        self.state.lock().window = Extent::new(width, height);
    }

    pub fn set_fixed_extent(&self, fixed: bool) {
        self.state.lock().fixed_extent = fixed;
    }

    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.state.lock().present_modes = modes;
    }

    /// Results returned by the next acquires, in order; SUCCESS and SUBOPTIMAL_KHR still hand out an image
    pub fn script_acquire(&self, results: impl IntoIterator<Item = vk::Result>) {
        self.state.lock().acquire_script.extend(results);
    }

    pub fn script_present(&self, results: impl IntoIterator<Item = vk::Result>) {
        self.state.lock().present_script.extend(results);
    }

    pub fn signal_fence(&self, fence: vk::Fence) {
        let mut st = self.state.lock();
        let entry = st.fences.get_mut(&fence).expect("mock: unknown fence");
        entry.signaled = true;
    }

    /// The GPU finishes everything submitted so far
    pub fn complete_all(&self) {
        let mut st = self.state.lock();
        for fence in st.fences.values_mut() {
            if fence.submitted {
                fence.signaled = true;
            }
        }
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).map_or(false, |f| f.signaled)
    }

    pub fn fences_allocated(&self) -> usize {
        self.state.lock().fences_allocated
    }

    pub fn semaphores_allocated(&self) -> usize {
        self.state.lock().semaphores_allocated
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn idle_waits(&self) -> usize {
        self.state.lock().idle_waits
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    pub fn acquires(&self) -> usize {
        self.state.lock().acquires
    }

    pub fn swapchains_created(&self) -> usize {
        self.state.lock().swapchains_created
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    pub fn swapchains_destroyed(&self) -> Vec<vk::SwapchainKHR> {
        self.state.lock().swapchains_destroyed.clone()
    }

    pub fn old_swapchain_hints(&self) -> Vec<Option<vk::SwapchainKHR>> {
        self.state.lock().old_swapchain_hints.clone()
    }

    pub fn presents(&self) -> Vec<PresentRequest> {
        self.state.lock().presents.clone()
    }
}

impl DeviceProvider for MockGpu {
    fn submit(&self, _queue: vk::Queue, _submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let mut st = self.state.lock();
        st.submissions += 1;
        st.mark_submitted(fence);
        Ok(())
    }

    fn present(&self, _queue: vk::Queue, request: &PresentRequest) -> vk::Result {
        let mut st = self.state.lock();
        let result = st.present_script.pop_front().unwrap_or(vk::Result::SUCCESS);
        if let Some(fence) = request.fence {
            st.mark_submitted(fence);
        }
        st.presents.push(request.clone());
        result
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<FenceStatus> {
        let st = self.state.lock();
        match st.fences.get(&fence) {
            Some(f) if f.signaled => Ok(FenceStatus::Signaled),
            Some(_) => Ok(FenceStatus::NotReady),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> VkResult<FenceStatus> {
        // Without a wait delay an unsignaled fence behaves like an elapsed timeout
        let delay = self.state.lock().wait_delay.min(timeout);
        if !delay.is_zero() && self.fence_status(fence)? == FenceStatus::NotReady {
            std::thread::sleep(delay);
        }
        self.fence_status(fence)
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut st = self.state.lock();
        let entry = st.fences.get_mut(&fence).ok_or(vk::Result::ERROR_UNKNOWN)?;
        *entry = MockFence::default();
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut st = self.state.lock();
        st.idle_waits += 1;
        for fence in st.fences.values_mut() {
            if fence.submitted {
                fence.signaled = true;
            }
        }
        Ok(())
    }

    fn supports_present_fence(&self) -> bool {
        self.state.lock().present_fence
    }
}

impl SyncAllocator for MockGpu {
    fn allocate_fence(&self, start_signaled: bool) -> VkResult<vk::Fence> {
        let mut st = self.state.lock();
        let fence = vk::Fence::from_raw(st.next_raw());
        st.fences.insert(
            fence,
            MockFence {
                signaled: start_signaled,
                submitted: false,
            },
        );
        st.fences_allocated += 1;
        Ok(fence)
    }

    fn allocate_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut st = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(st.next_raw());
        st.semaphores.insert(semaphore);
        st.semaphores_allocated += 1;
        Ok(semaphore)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let removed = self.state.lock().fences.remove(&fence);
        assert!(removed.is_some(), "mock: destroyed an unknown fence");
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let removed = self.state.lock().semaphores.remove(&semaphore);
        assert!(removed, "mock: destroyed an unknown semaphore");
    }
}

impl SurfaceProvider for MockGpu {
    fn current_capabilities(&self) -> VkResult<SurfaceCapabilities> {
        let st = self.state.lock();
        Ok(SurfaceCapabilities {
            current_extent: st.fixed_extent.then_some(st.window),
            min_extent: Extent::new(1, 1),
            max_extent: Extent::new(16384, 16384),
            min_image_count: st.min_image_count,
            max_image_count: 8,
            present_modes: st.present_modes.clone(),
        })
    }

    fn poll_window_size(&self) -> Extent {
        self.state.lock().window
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<SwapchainImages> {
        let mut st = self.state.lock();
        let swapchain = vk::SwapchainKHR::from_raw(st.next_raw());
        let images: Vec<vk::Image> = (0..desc.image_count)
            .map(|_| vk::Image::from_raw(st.next_raw()))
            .collect();
        st.swapchains.insert(
            swapchain,
            MockSwapchain {
                images: images.clone(),
                next_image: 0,
            },
        );
        st.swapchains_created += 1;
        st.old_swapchain_hints.push(desc.old_swapchain);
        Ok(SwapchainImages {
            swapchain,
            images,
            format: vk::Format::B8G8R8A8_SRGB,
        })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: Duration,
        _semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut st = self.state.lock();
        st.acquires += 1;
        let scripted = st.acquire_script.pop_front().unwrap_or(vk::Result::SUCCESS);
        let suboptimal = match scripted {
            vk::Result::SUCCESS => false,
            vk::Result::SUBOPTIMAL_KHR => true,
            err => return Err(err),
        };
        let chain = st
            .swapchains
            .get_mut(&swapchain)
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let index = chain.next_image;
        chain.next_image = (index + 1) % chain.images.len() as u32;
        st.mark_submitted(fence);
        Ok((index, suboptimal))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut st = self.state.lock();
        assert!(
            st.swapchains.remove(&swapchain).is_some(),
            "mock: destroyed an unknown swapchain"
        );
        st.swapchains_destroyed.push(swapchain);
    }
}
