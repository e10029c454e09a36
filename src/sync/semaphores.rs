// Per-slot semaphores for one swapchain generation
//
// Acquire semaphores are picked by the acquire cursor, present semaphores by the
// acquired image index. Both come from the semaphore bank and go back to it when
// the chain is destroyed.

use ash::vk;
use std::marker::PhantomData;

use super::bank::SemaphoreBank;
use crate::error::{PresentError, PresentResult};

pub trait SemaphoreRole {
    const NAME: &'static str;
}

/// Signaled by the driver when an acquired image is ready to be rendered to
pub struct AcquireRole;

/// Signaled by the renderer's last submission, waited on by the present
pub struct PresentRole;

impl SemaphoreRole for AcquireRole {
    const NAME: &'static str = "acquire";
}

impl SemaphoreRole for PresentRole {
    const NAME: &'static str = "present";
}

pub struct SlotSemaphorePool<R: SemaphoreRole> {
    semaphores: Vec<vk::Semaphore>,
    _role: PhantomData<R>,
}

pub type AcquireSemaphorePool = SlotSemaphorePool<AcquireRole>;
pub type PresentSemaphorePool = SlotSemaphorePool<PresentRole>;

impl<R: SemaphoreRole> SlotSemaphorePool<R> {
    /// Borrow one semaphore per slot, labelled with the chain generation
    pub fn borrow(bank: &SemaphoreBank, slots: usize, generation: u64) -> PresentResult<Self> {
        let label = format!("swapchain#{generation} {}", R::NAME);
        let semaphores = bank.borrow_many(slots, false, &label)?;
        Ok(Self {
            semaphores,
            _role: PhantomData,
        })
    }

    pub fn get(&self, slot: usize) -> PresentResult<vk::Semaphore> {
        self.semaphores.get(slot).copied().ok_or_else(|| {
            PresentError::invalid_state(format!(
                "{} semaphore slot {} out of range ({} slots)",
                R::NAME,
                slot,
                self.semaphores.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }

    /// Hand every semaphore back to the bank
    pub fn release(self, bank: &SemaphoreBank) -> PresentResult<()> {
        bank.give_back_many(self.semaphores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockGpu;
    use std::time::Duration;

    #[test]
    fn one_semaphore_per_slot_released_together() {
        let mock = MockGpu::new();
        let bank = SemaphoreBank::new(mock.clone(), Duration::from_millis(1), None);

        let acquire = AcquireSemaphorePool::borrow(&bank, 3, 7).unwrap();
        let present = PresentSemaphorePool::borrow(&bank, 3, 7).unwrap();
        assert_eq!(acquire.len(), 3);
        assert_eq!(bank.borrowed_count(), 6);
        assert_ne!(acquire.get(0).unwrap(), present.get(0).unwrap());
        assert_eq!(
            bank.label_of(&acquire.get(1).unwrap()).as_deref(),
            Some("swapchain#7 acquire[1]")
        );
        assert!(matches!(acquire.get(3), Err(PresentError::InvalidState(_))));

        acquire.release(&bank).unwrap();
        present.release(&bank).unwrap();
        assert_eq!(bank.borrowed_count(), 0);
        assert_eq!(bank.free_count(), 6);
    }
}
