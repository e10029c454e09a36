// Synchronization - logical fences, recycling banks, presentation tracking
//
// Each device context owns exactly one SyncBanks; share it by Arc with the
// presentation manager and the renderer, destroy it after both are done.

pub mod bank;
pub mod fence;
pub mod semaphores;
pub mod tracker;

pub use bank::{FenceBank, SemaphoreBank, SyncBank, SyncPrimitive};
pub use fence::{FenceState, LogicalFence, SubmissionToken};
pub use semaphores::{AcquireSemaphorePool, PresentSemaphorePool};
pub use tracker::PresentationFinishedTracker;

use std::sync::Arc;

use crate::backend::GpuDevice;
use crate::config::SyncConfig;
use crate::error::PresentResult;

/// The fence and semaphore banks of one device context.
pub struct SyncBanks {
    pub fences: Arc<FenceBank>,
    pub semaphores: Arc<SemaphoreBank>,
}

impl SyncBanks {
    pub fn new(device: Arc<dyn GpuDevice>, config: &SyncConfig) -> Self {
        let timeout = config.wait_timeout();
        Self {
            fences: Arc::new(FenceBank::new(
                Arc::clone(&device),
                timeout,
                config.fence_capacity(),
            )),
            semaphores: Arc::new(SemaphoreBank::new(
                device,
                timeout,
                config.semaphore_capacity(),
            )),
        }
    }

    /// Destroy both banks. Fences first, since draining them is what proves the
    /// semaphores they guarded are idle.
    pub fn destroy(&self) -> PresentResult<()> {
        self.fences.destroy()?;
        self.semaphores.destroy()?;
        log::info!("Synchronization banks destroyed");
        Ok(())
    }
}
