// One generation of the swapchain
//
// A chain owns the swapchain handle, its images and the per-image sync
// objects borrowed from the banks. It never recreates itself: out-of-date and
// suboptimal results only flip flags that the presentation manager reads on
// the next acquire.

use ash::vk;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{DeviceQueues, Extent, PresentRequest, SurfaceProvider, SwapchainDesc};
use crate::error::{PresentError, PresentResult};
use crate::sync::{
    AcquireSemaphorePool, FenceBank, LogicalFence, PresentSemaphorePool, SemaphoreBank,
    SubmissionToken,
};

/// Everything a chain needs from its surroundings, shared by every generation.
pub(crate) struct ChainContext {
    pub surface: Arc<dyn SurfaceProvider>,
    pub queues: Arc<DeviceQueues>,
    pub present_queue: usize,
    pub fences: Arc<FenceBank>,
    pub semaphores: Arc<SemaphoreBank>,
    /// Device supports present fences and the config allows them
    pub present_fences: bool,
    pub timeout: Duration,
    pub extra_images: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Active,
    /// The driver reported out-of-date; nothing more is presented from this chain
    OutOfDate,
    /// Replaced by a newer chain while still usable
    Superseded,
    Destroyed,
}

/// Sync objects of one image slot.
#[derive(Default)]
pub(crate) struct FrameSlot {
    acquire_fence: Option<Arc<LogicalFence>>,
    acquire_token: Option<SubmissionToken>,
    present_fence: Option<Arc<LogicalFence>>,
}

/// A drawable image handed to the renderer.
///
/// Wait on `acquire_semaphore` before writing the image, signal
/// `present_semaphore` from the last submission that touches it.
#[derive(Debug, Clone)]
pub struct FrameImage {
    pub generation: u64,
    pub image_index: u32,
    /// Acquire slot this image came through
    pub slot_index: usize,
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: Extent,
    pub acquire_semaphore: vk::Semaphore,
    pub present_semaphore: vk::Semaphore,
    /// Completion of the acquire itself, when the acquire carried a fence
    pub acquire_token: Option<SubmissionToken>,
    /// The image went through at least one present in this chain before
    pub previously_presented: bool,
}

type DeferredCallback = Box<dyn FnOnce() + Send>;

pub struct SwapBufferChain {
    ctx: Arc<ChainContext>,
    generation: u64,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    slots: Vec<FrameSlot>,
    acquire_semaphores: Option<AcquireSemaphorePool>,
    present_semaphores: Option<PresentSemaphorePool>,
    extent: Extent,
    /// Window size the chain was built for; `None` when the surface reports a fixed extent
    window_size: Option<Extent>,
    present_mode: vk::PresentModeKHR,
    requested_mode: vk::PresentModeKHR,
    acquire_cursor: usize,
    state: ChainState,
    recreate_requested: bool,
    presented: Vec<bool>,
    /// Last drawing submission that touched each image
    image_work: Vec<Option<SubmissionToken>>,
    deferred: Vec<DeferredCallback>,
    acquisitions_since_superseded: usize,
}

impl SwapBufferChain {
    /// Create a chain for the current surface state.
    ///
    /// Returns `Ok(None)` while the surface is zero-sized (minimized window).
    pub(crate) fn create(
        ctx: &Arc<ChainContext>,
        previous: Option<vk::SwapchainKHR>,
        requested_mode: vk::PresentModeKHR,
        generation: u64,
    ) -> PresentResult<Option<Self>> {
        let caps = ctx.surface.current_capabilities()?;
        let window_size = caps
            .current_extent
            .is_none()
            .then(|| ctx.surface.poll_window_size());
        let extent = caps.resolve_extent(window_size.unwrap_or_default());
        if extent.is_empty() {
            log::debug!("Surface is zero-sized, skipping swapchain creation");
            return Ok(None);
        }

        let present_mode = if caps.supports(requested_mode) {
            requested_mode
        } else {
            log::warn!(
                "Present mode {:?} not supported, falling back to FIFO",
                requested_mode
            );
            vk::PresentModeKHR::FIFO
        };

        let created = ctx.surface.create_swapchain(&SwapchainDesc {
            extent,
            image_count: caps.image_count(ctx.extra_images),
            present_mode,
            old_swapchain: previous,
        })?;
        let image_count = created.images.len();

        let mut chain = Self {
            ctx: Arc::clone(ctx),
            generation,
            swapchain: created.swapchain,
            images: created.images,
            format: created.format,
            slots: (0..image_count).map(|_| FrameSlot::default()).collect(),
            acquire_semaphores: None,
            present_semaphores: None,
            extent,
            window_size,
            present_mode,
            requested_mode,
            acquire_cursor: 0,
            state: ChainState::Active,
            recreate_requested: false,
            presented: vec![false; image_count],
            image_work: vec![None; image_count],
            deferred: Vec::new(),
            acquisitions_since_superseded: 0,
        };

        if let Err(e) = chain.borrow_sync_objects() {
            if let Err(cleanup) = chain.destroy() {
                log::error!("Cleanup of half-built swapchain #{} failed: {}", generation, cleanup);
            }
            return Err(e);
        }

        log::info!(
            "Swapchain #{} created: {}x{}, {} images, {:?}",
            generation,
            extent.width,
            extent.height,
            image_count,
            present_mode
        );
        Ok(Some(chain))
    }

    fn borrow_sync_objects(&mut self) -> PresentResult<()> {
        let count = self.images.len();
        self.acquire_semaphores = Some(AcquireSemaphorePool::borrow(
            &self.ctx.semaphores,
            count,
            self.generation,
        )?);
        self.present_semaphores = Some(PresentSemaphorePool::borrow(
            &self.ctx.semaphores,
            count,
            self.generation,
        )?);

        if self.ctx.present_fences {
            // Pre-signaled: waiting before the first present must not block
            for (i, slot) in self.slots.iter_mut().enumerate() {
                let label = format!("swapchain#{} present fence[{}]", self.generation, i);
                slot.present_fence = Some(self.ctx.fences.borrow(true, &label)?);
            }
        }
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Mode the driver is actually using
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Mode the caller asked for (differs after a FIFO fallback)
    pub fn requested_mode(&self) -> vk::PresentModeKHR {
        self.requested_mode
    }

    pub(crate) fn window_size(&self) -> Option<Extent> {
        self.window_size
    }

    /// Out-of-date, or suboptimal since the last recreation
    pub(crate) fn needs_recreation(&self) -> bool {
        self.state == ChainState::OutOfDate || self.recreate_requested
    }

    pub(crate) fn mark_out_of_date(&mut self) {
        if self.state == ChainState::Active {
            self.state = ChainState::OutOfDate;
        }
    }

    /// An out-of-date chain stays out-of-date so its pending presents keep being dropped
    pub(crate) fn supersede(&mut self) {
        if self.state == ChainState::Active {
            self.state = ChainState::Superseded;
        }
        self.acquisitions_since_superseded = 0;
    }

    pub(crate) fn note_acquisition(&mut self) {
        self.acquisitions_since_superseded += 1;
    }

    fn acquire_fence_for(&mut self, slot: usize) -> PresentResult<Arc<LogicalFence>> {
        if let Some(fence) = &self.slots[slot].acquire_fence {
            return Ok(Arc::clone(fence));
        }
        let label = format!("swapchain#{} acquire fence[{}]", self.generation, slot);
        let fence = self.ctx.fences.borrow(false, &label)?;
        self.slots[slot].acquire_fence = Some(Arc::clone(&fence));
        Ok(fence)
    }

    /// Acquire the next image.
    ///
    /// `Ok(None)` means the surface is out of date and the chain must be replaced.
    pub fn acquire(&mut self, use_acquire_fence: bool) -> PresentResult<Option<FrameImage>> {
        match self.state {
            ChainState::Active => {}
            ChainState::OutOfDate => return Ok(None),
            ChainState::Superseded => {
                return Err(PresentError::invalid_state(format!(
                    "acquire from superseded swapchain #{}",
                    self.generation
                )))
            }
            ChainState::Destroyed => return Err(PresentError::ChainDestroyed(self.generation)),
        }

        let slot = self.acquire_cursor;
        let semaphore = self.acquire_pool()?.get(slot)?;

        let armed = if use_acquire_fence {
            let fence = self.acquire_fence_for(slot)?;
            fence.wait_if_pending()?;
            fence.reset()?;
            let token = fence.new_token();
            let handle = fence.submit()?;
            Some((fence, token, handle))
        } else {
            None
        };
        let fence_handle = armed
            .as_ref()
            .map_or(vk::Fence::null(), |(_, _, handle)| *handle);

        let result = self.ctx.surface.acquire_next_image(
            self.swapchain,
            self.ctx.timeout,
            semaphore,
            fence_handle,
        );

        let (index, suboptimal) = match result {
            Ok(acquired) => acquired,
            Err(err) => {
                if let Some((fence, _, _)) = &armed {
                    fence.abandon_submission();
                }
                return match err {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => {
                        log::debug!("Swapchain #{} is out of date", self.generation);
                        self.state = ChainState::OutOfDate;
                        Ok(None)
                    }
                    vk::Result::TIMEOUT | vk::Result::NOT_READY => Err(PresentError::Timeout {
                        timeout: self.ctx.timeout,
                        what: format!("image from swapchain #{}", self.generation),
                    }),
                    err => Err(err.into()),
                };
            }
        };

        let image_index = index as usize;
        let image = *self.images.get(image_index).ok_or_else(|| {
            PresentError::invalid_state(format!(
                "driver returned image {} of {}",
                index,
                self.images.len()
            ))
        })?;

        if suboptimal {
            log::debug!("Swapchain #{} is suboptimal, recreating next frame", self.generation);
            self.recreate_requested = true;
        }

        let acquire_token = armed.map(|(_, token, _)| token);
        self.slots[slot].acquire_token = acquire_token.clone();
        self.acquire_cursor = (slot + 1) % self.slots.len();

        Ok(Some(FrameImage {
            generation: self.generation,
            image_index: index,
            slot_index: slot,
            image,
            format: self.format,
            extent: self.extent,
            acquire_semaphore: semaphore,
            present_semaphore: self.present_pool()?.get(image_index)?,
            acquire_token,
            previously_presented: self.presented[image_index],
        }))
    }

    /// Present an image acquired from this chain.
    ///
    /// Dropped silently while out of date. Returns the present-fence token when
    /// presents are fenced.
    pub fn present(
        &mut self,
        image: &FrameImage,
        drawing: Option<SubmissionToken>,
        before_present: Option<&mut dyn FnMut(&mut PresentRequest)>,
    ) -> PresentResult<Option<SubmissionToken>> {
        match self.state {
            ChainState::Destroyed => return Err(PresentError::ChainDestroyed(self.generation)),
            ChainState::OutOfDate => {
                log::trace!("Dropping present to out-of-date swapchain #{}", self.generation);
                return Ok(None);
            }
            ChainState::Active | ChainState::Superseded => {}
        }
        if image.generation != self.generation {
            return Err(PresentError::invalid_state(format!(
                "image of swapchain #{} presented to #{}",
                image.generation, self.generation
            )));
        }
        let index = image.image_index as usize;
        let semaphore = self.present_pool()?.get(index)?;

        let fenced = match &self.slots[index].present_fence {
            Some(fence) => {
                fence.wait_if_pending()?;
                fence.reset()?;
                let token = fence.new_token();
                let handle = fence.submit()?;
                Some((Arc::clone(fence), token, handle))
            }
            None => None,
        };

        self.image_work[index] = drawing;

        let mut request = PresentRequest {
            swapchain: self.swapchain,
            image_index: image.image_index,
            wait_semaphores: vec![semaphore],
            fence: fenced.as_ref().map(|(_, _, handle)| *handle),
        };
        if let Some(hook) = before_present {
            hook(&mut request);
        }

        let result = match self.ctx.queues.present(self.ctx.present_queue, &request) {
            Ok(result) => result,
            Err(e) => {
                if let Some((fence, _, _)) = &fenced {
                    fence.abandon_submission();
                }
                return Err(e);
            }
        };

        match result {
            vk::Result::SUCCESS => {}
            vk::Result::SUBOPTIMAL_KHR => {
                log::debug!("Present to swapchain #{} suboptimal", self.generation);
                self.recreate_requested = true;
            }
            vk::Result::ERROR_OUT_OF_DATE_KHR => {
                log::debug!("Present to swapchain #{} out of date", self.generation);
                self.mark_out_of_date();
            }
            err => return Err(err.into()),
        }

        self.presented[index] = true;
        Ok(fenced.map(|(_, token, _)| token))
    }

    /// Run `callback` when this chain is destroyed (right away if it already is)
    pub fn defer_destruction(&mut self, callback: impl FnOnce() + Send + 'static) {
        if self.state == ChainState::Destroyed {
            callback();
        } else {
            self.deferred.push(Box::new(callback));
        }
    }

    /// Non-blocking check whether the driver is provably done with this chain.
    ///
    /// With present fences: every present fence and every recorded drawing
    /// submission has completed. Without: some presentation has finished and the
    /// chain has sat through `2 x image count` acquisitions since it was superseded.
    pub(crate) fn is_collectable(&self, presentation_finished: bool) -> PresentResult<bool> {
        for slot in &self.slots {
            if let Some(token) = &slot.acquire_token {
                if !token.has_completed()? {
                    return Ok(false);
                }
            }
        }
        for work in self.image_work.iter().flatten() {
            if !work.has_completed()? {
                return Ok(false);
            }
        }

        if self.ctx.present_fences {
            for fence in self.slots.iter().filter_map(|s| s.present_fence.as_ref()) {
                if fence.is_pending()? {
                    return Ok(false);
                }
            }
            Ok(true)
        } else {
            Ok(presentation_finished
                && self.acquisitions_since_superseded >= 2 * self.images.len())
        }
    }

    /// Wait for outstanding work, run deferred callbacks once, return every
    /// sync object to its bank and destroy the swapchain. Idempotent.
    pub fn destroy(&mut self) -> PresentResult<()> {
        if self.state == ChainState::Destroyed {
            return Ok(());
        }

        for slot in &self.slots {
            if let Some(token) = &slot.acquire_token {
                token.wait()?;
            }
            if let Some(fence) = &slot.present_fence {
                fence.wait_if_pending()?;
            }
        }
        for work in self.image_work.iter().flatten() {
            work.wait()?;
        }

        let callbacks = std::mem::take(&mut self.deferred);
        self.state = ChainState::Destroyed;
        for callback in callbacks {
            callback();
        }

        for slot in &mut self.slots {
            slot.acquire_token = None;
            if let Some(fence) = slot.acquire_fence.take() {
                self.ctx.fences.give_back(fence)?;
            }
            if let Some(fence) = slot.present_fence.take() {
                self.ctx.fences.give_back(fence)?;
            }
        }
        self.image_work.iter_mut().for_each(|work| *work = None);
        if let Some(pool) = self.acquire_semaphores.take() {
            pool.release(&self.ctx.semaphores)?;
        }
        if let Some(pool) = self.present_semaphores.take() {
            pool.release(&self.ctx.semaphores)?;
        }

        self.ctx.surface.destroy_swapchain(self.swapchain);
        log::debug!("Swapchain #{} destroyed", self.generation);
        Ok(())
    }

    fn acquire_pool(&self) -> PresentResult<&AcquireSemaphorePool> {
        self.acquire_semaphores
            .as_ref()
            .ok_or(PresentError::ChainDestroyed(self.generation))
    }

    fn present_pool(&self) -> PresentResult<&PresentSemaphorePool> {
        self.present_semaphores
            .as_ref()
            .ok_or(PresentError::ChainDestroyed(self.generation))
    }
}

impl fmt::Debug for SwapBufferChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapBufferChain")
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("extent", &self.extent)
            .field("images", &self.images.len())
            .field("present_mode", &self.present_mode)
            .finish()
    }
}
