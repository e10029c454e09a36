// Presentation manager - hands the renderer its next drawable image
//
// Owns the current swapchain generation plus the superseded ones that may
// still be referenced by in-flight work. Recreation happens on acquire: when
// the window size changed, the driver said out-of-date/suboptimal, or the
// caller asked for another present mode. Superseded chains are destroyed once
// they are provably idle, or all at once behind a device idle wait when too
// many pile up.

use ash::vk;
use std::sync::Arc;

use super::chain::{ChainContext, FrameImage, SwapBufferChain};
use crate::backend::{DeviceQueues, PresentRequest, SurfaceProvider};
use crate::config::Config;
use crate::error::{PresentError, PresentResult};
use crate::sync::{PresentationFinishedTracker, SubmissionToken, SyncBanks};

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresentationStats {
    pub chains_created: usize,
    /// Chains created to replace an existing one
    pub recreations: usize,
    /// Collections that needed a full device idle wait
    pub forced_collections: usize,
    /// Superseded chains destroyed once provably idle
    pub opportunistic_collections: usize,
    /// Superseded chains still alive
    pub superseded: usize,
}

pub struct PresentationManager {
    ctx: Arc<ChainContext>,
    current: Option<SwapBufferChain>,
    superseded: Vec<SwapBufferChain>,
    tracker: PresentationFinishedTracker,
    last_generation: u64,
    max_superseded: usize,
    max_retries: u32,
    stats: PresentationStats,
    destroyed: bool,
}

impl PresentationManager {
    pub fn new(
        surface: Arc<dyn SurfaceProvider>,
        queues: Arc<DeviceQueues>,
        present_queue: usize,
        banks: &SyncBanks,
        config: &Config,
    ) -> Self {
        let present_fences =
            config.presentation.use_present_fence && queues.device().supports_present_fence();
        log::info!(
            "Presentation manager: present fences {}",
            if present_fences { "enabled" } else { "unavailable" }
        );

        Self {
            ctx: Arc::new(ChainContext {
                surface,
                queues,
                present_queue,
                fences: Arc::clone(&banks.fences),
                semaphores: Arc::clone(&banks.semaphores),
                present_fences,
                timeout: config.sync.wait_timeout(),
                extra_images: config.presentation.extra_images,
            }),
            current: None,
            superseded: Vec::new(),
            tracker: PresentationFinishedTracker::new(
                config.graphics.frames_in_flight,
                present_fences,
            ),
            last_generation: 0,
            max_superseded: config.presentation.max_superseded_chains,
            max_retries: config.presentation.max_acquire_retries,
            stats: PresentationStats::default(),
            destroyed: false,
        }
    }

    pub fn supports_present_fence(&self) -> bool {
        self.ctx.present_fences
    }

    pub fn current(&self) -> Option<&SwapBufferChain> {
        self.current.as_ref()
    }

    pub fn superseded_count(&self) -> usize {
        self.superseded.len()
    }

    pub fn stats(&self) -> PresentationStats {
        PresentationStats {
            superseded: self.superseded.len(),
            ..self.stats
        }
    }

    fn ensure_alive(&self) -> PresentResult<()> {
        if self.destroyed {
            return Err(PresentError::ChainDestroyed(self.last_generation));
        }
        Ok(())
    }

    /// Acquire the next drawable image.
    ///
    /// `Ok(None)` is a normal outcome while the window is minimized or the
    /// surface keeps reporting out-of-date; skip the frame and try again.
    pub fn acquire(
        &mut self,
        present_mode: vk::PresentModeKHR,
        label: &str,
    ) -> PresentResult<Option<FrameImage>> {
        self.ensure_alive()?;

        let mut retries_left = self.max_retries;
        let image = loop {
            if let Some(chain) = self.current.as_mut() {
                if let Some(size) = chain.window_size() {
                    let window = self.ctx.surface.poll_window_size();
                    if window != size {
                        log::debug!(
                            "{}: window resized {}x{} -> {}x{}",
                            label,
                            size.width,
                            size.height,
                            window.width,
                            window.height
                        );
                        chain.mark_out_of_date();
                    }
                }
            }

            let replace = match &self.current {
                Some(chain) => {
                    chain.needs_recreation() || chain.requested_mode() != present_mode
                }
                None => true,
            };
            if replace && !self.replace_chain(present_mode)? {
                return Ok(None);
            }

            let use_fence = self
                .tracker
                .needs_acquire_fence(!self.superseded.is_empty())?;
            let chain = self
                .current
                .as_mut()
                .ok_or_else(|| PresentError::invalid_state("no current swapchain"))?;

            match chain.acquire(use_fence)? {
                Some(image) => break image,
                None if retries_left > 0 => {
                    retries_left -= 1;
                    log::debug!("{}: swapchain out of date on acquire, retrying", label);
                }
                None => {
                    log::debug!("{}: swapchain still out of date, skipping frame", label);
                    return Ok(None);
                }
            }
        };

        if image.previously_presented {
            if let Some(token) = &image.acquire_token {
                self.tracker.use_acquire_fence(image.slot_index, token.clone());
            }
        }
        for chain in &mut self.superseded {
            chain.note_acquisition();
        }
        self.collect_garbage()?;

        log::trace!(
            "{}: acquired image {} of swapchain #{}",
            label,
            image.image_index,
            image.generation
        );
        Ok(Some(image))
    }

    /// Create a chain, superseding the current one if there is one.
    /// Returns false while the surface is zero-sized; existing state is kept.
    fn replace_chain(&mut self, present_mode: vk::PresentModeKHR) -> PresentResult<bool> {
        let previous = self.current.as_ref().map(SwapBufferChain::handle);
        let generation = self.last_generation + 1;

        let Some(chain) = SwapBufferChain::create(&self.ctx, previous, present_mode, generation)?
        else {
            return Ok(false);
        };
        self.last_generation = generation;
        self.stats.chains_created += 1;

        if let Some(mut old) = self.current.replace(chain) {
            log::debug!(
                "Swapchain #{} superseded by #{}",
                old.generation(),
                generation
            );
            old.supersede();
            self.superseded.push(old);
            self.stats.recreations += 1;
        }
        Ok(true)
    }

    fn collect_garbage(&mut self) -> PresentResult<()> {
        if self.superseded.is_empty() {
            return Ok(());
        }

        if self.superseded.len() > self.max_superseded {
            log::warn!(
                "{} superseded swapchains pending, waiting for device idle",
                self.superseded.len()
            );
            self.ctx.queues.wait_idle()?;
            self.destroy_superseded()?;
            self.stats.forced_collections += 1;
            return Ok(());
        }

        let finished = self.tracker.has_finished_at_least_one_presentation()?;
        let mut i = 0;
        while i < self.superseded.len() {
            if self.superseded[i].is_collectable(finished)? {
                self.superseded[i].destroy()?;
                let chain = self.superseded.remove(i);
                self.stats.opportunistic_collections += 1;
                log::debug!("Collected superseded swapchain #{}", chain.generation());
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Oldest first. A chain leaves the list only once its destroy succeeded,
    /// so a failed pass can be retried.
    fn destroy_superseded(&mut self) -> PresentResult<()> {
        while let Some(chain) = self.superseded.first_mut() {
            chain.destroy()?;
            self.superseded.remove(0);
        }
        Ok(())
    }

    fn chain_mut(&mut self, generation: u64) -> Option<&mut SwapBufferChain> {
        self.current
            .iter_mut()
            .chain(self.superseded.iter_mut())
            .find(|chain| chain.generation() == generation)
    }

    /// Present `image`.
    ///
    /// `drawing` marks the last submission that touched the image; it keeps the
    /// chain alive until that work completes. `before_present` may edit the
    /// request (extra wait semaphores, pNext data) before it is queued.
    pub fn present(
        &mut self,
        image: &FrameImage,
        drawing: Option<SubmissionToken>,
        before_present: Option<&mut dyn FnMut(&mut PresentRequest)>,
    ) -> PresentResult<()> {
        self.ensure_alive()?;
        let has_old_chains = !self.superseded.is_empty();

        let chain = self
            .chain_mut(image.generation)
            .ok_or(PresentError::ChainDestroyed(image.generation))?;
        let token = chain.present(image, drawing, before_present)?;

        if let Some(token) = token {
            let slot = image.image_index as usize;
            if self.tracker.needs_present_fence(slot, has_old_chains)? {
                self.tracker.use_present_fence(slot, token);
            }
        }
        Ok(())
    }

    /// Run `callback` when swapchain `generation` is destroyed.
    /// Runs immediately if that generation is already gone.
    pub fn defer_destruction(&mut self, generation: u64, callback: impl FnOnce() + Send + 'static) {
        match self.chain_mut(generation) {
            Some(chain) => chain.defer_destruction(callback),
            None => callback(),
        }
    }

    /// Wait for the device, then destroy every chain. Afterwards acquire and present fail.
    pub fn destroy(&mut self) -> PresentResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.ctx.queues.wait_idle()?;
        self.destroy_superseded()?;
        if let Some(chain) = self.current.as_mut() {
            chain.destroy()?;
        }
        self.current = None;
        self.destroyed = true;
        log::info!(
            "Presentation manager destroyed ({} swapchains created)",
            self.stats.chains_created
        );
        Ok(())
    }
}

impl Drop for PresentationManager {
    fn drop(&mut self) {
        if !self.destroyed && (self.current.is_some() || !self.superseded.is_empty()) {
            log::error!("PresentationManager dropped without destroy(); swapchains leaked");
        }
    }
}
