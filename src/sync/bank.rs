// Synchronization banks - borrow/return pools for fences and semaphores
//
// One generic pool, two specializations. Returned objects are recycled lazily:
// borrow() scans the returned list for an entry the device is done with and
// only allocates when none is found.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::fence::LogicalFence;
use crate::backend::GpuDevice;
use crate::error::{PresentError, PresentResult};

/// How many leaked labels destroy() reports
const MAX_REPORTED_LEAKS: usize = 5;

/// A physical sync object a bank knows how to manage.
pub trait SyncPrimitive: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    /// Identity of the underlying handle
    fn raw(&self) -> u64;

    fn create(device: &Arc<dyn GpuDevice>, start_signaled: bool, timeout: Duration) -> PresentResult<Self>;

    /// Still in use by the device, so not recyclable yet
    fn is_pending(&self) -> PresentResult<bool>;

    /// Bring a returned object back to the requested initial state
    fn recycle(&self, start_signaled: bool) -> PresentResult<()>;

    /// Wait out device work before destruction
    fn drain(&self) -> PresentResult<()>;

    fn destroy(&self, device: &dyn GpuDevice);
}

impl SyncPrimitive for Arc<LogicalFence> {
    const KIND: &'static str = "fence";

    fn raw(&self) -> u64 {
        use ash::vk::Handle;
        self.handle().as_raw()
    }

    fn create(device: &Arc<dyn GpuDevice>, start_signaled: bool, timeout: Duration) -> PresentResult<Self> {
        let handle = device.allocate_fence(start_signaled)?;
        Ok(Arc::new(LogicalFence::new(
            Arc::clone(device),
            handle,
            start_signaled,
            timeout,
        )))
    }

    fn is_pending(&self) -> PresentResult<bool> {
        LogicalFence::is_pending(self)
    }

    fn recycle(&self, start_signaled: bool) -> PresentResult<()> {
        self.reset()?;
        if start_signaled {
            self.signal()?;
        }
        Ok(())
    }

    fn drain(&self) -> PresentResult<()> {
        self.wait_if_pending()
    }

    fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_fence(self.handle());
    }
}

impl SyncPrimitive for vk::Semaphore {
    const KIND: &'static str = "semaphore";

    fn raw(&self) -> u64 {
        use ash::vk::Handle;
        self.as_raw()
    }

    fn create(device: &Arc<dyn GpuDevice>, start_signaled: bool, _timeout: Duration) -> PresentResult<Self> {
        if start_signaled {
            return Err(PresentError::invalid_state(
                "binary semaphores cannot start signaled",
            ));
        }
        Ok(device.allocate_semaphore()?)
    }

    // Semaphores carry no host-visible status; the caller returns them only
    // once the work that waits on them is known to be finished.
    fn is_pending(&self) -> PresentResult<bool> {
        Ok(false)
    }

    fn recycle(&self, start_signaled: bool) -> PresentResult<()> {
        if start_signaled {
            return Err(PresentError::invalid_state(
                "binary semaphores cannot start signaled",
            ));
        }
        Ok(())
    }

    fn drain(&self) -> PresentResult<()> {
        Ok(())
    }

    fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_semaphore(*self);
    }
}

struct Lent<T> {
    item: T,
    label: String,
}

struct BankState<T> {
    returned: Vec<T>,
    borrowed: HashMap<u64, Lent<T>>,
    allocated: usize,
    destroyed: bool,
}

/// Borrow/return pool of one kind of sync object.
///
/// `borrow` and `give_back` may be called from any thread. `destroy` belongs to
/// whoever owns the device context and must not race frame work.
pub struct SyncBank<T: SyncPrimitive> {
    device: Arc<dyn GpuDevice>,
    timeout: Duration,
    capacity: Option<usize>,
    state: Mutex<BankState<T>>,
}

/// Logical fences, drained on destroy
pub type FenceBank = SyncBank<Arc<LogicalFence>>;

/// Binary semaphores
pub type SemaphoreBank = SyncBank<vk::Semaphore>;

impl<T: SyncPrimitive> SyncBank<T> {
    /// `capacity` bounds the number of live objects; `None` means unbounded
    pub fn new(device: Arc<dyn GpuDevice>, timeout: Duration, capacity: Option<usize>) -> Self {
        Self {
            device,
            timeout,
            capacity,
            state: Mutex::new(BankState {
                returned: Vec::new(),
                borrowed: HashMap::new(),
                allocated: 0,
                destroyed: false,
            }),
        }
    }

    pub fn borrow(&self, start_signaled: bool, label: &str) -> PresentResult<T> {
        let mut st = self.state.lock();
        if st.destroyed {
            return Err(PresentError::BankDestroyed(T::KIND));
        }

        let mut recyclable = None;
        for (i, item) in st.returned.iter().enumerate() {
            if !item.is_pending()? {
                recyclable = Some(i);
                break;
            }
        }

        let item = match recyclable {
            Some(i) => {
                let item = st.returned.swap_remove(i);
                if let Err(e) = item.recycle(start_signaled) {
                    st.returned.push(item);
                    return Err(e);
                }
                item
            }
            None => {
                if let Some(capacity) = self.capacity {
                    if st.returned.len() + st.borrowed.len() >= capacity {
                        return Err(PresentError::PoolExhausted {
                            kind: T::KIND,
                            capacity,
                        });
                    }
                }
                let item = T::create(&self.device, start_signaled, self.timeout)?;
                st.allocated += 1;
                log::trace!("Allocated {} #{} for {}", T::KIND, st.allocated, label);
                item
            }
        };

        st.borrowed.insert(
            item.raw(),
            Lent {
                item: item.clone(),
                label: label.to_owned(),
            },
        );
        Ok(item)
    }

    /// Borrow `count` objects labelled `label[i]`; no atomicity across the batch
    pub fn borrow_many(&self, count: usize, start_signaled: bool, label: &str) -> PresentResult<Vec<T>> {
        (0..count)
            .map(|i| self.borrow(start_signaled, &format!("{label}[{i}]")))
            .collect()
    }

    /// Hand an object back. Tokens taken before this stay valid, but no new work may be submitted with it.
    pub fn give_back(&self, item: T) -> PresentResult<()> {
        let mut st = self.state.lock();
        if st.destroyed {
            return Err(PresentError::BankDestroyed(T::KIND));
        }
        let lent = st
            .borrowed
            .remove(&item.raw())
            .ok_or(PresentError::NotBorrowed {
                kind: T::KIND,
                raw: item.raw(),
            })?;
        st.returned.push(lent.item);
        Ok(())
    }

    pub fn give_back_many(&self, items: impl IntoIterator<Item = T>) -> PresentResult<()> {
        items.into_iter().try_for_each(|item| self.give_back(item))
    }

    /// Destroy every object. Fails loudly if anything is still borrowed.
    pub fn destroy(&self) -> PresentResult<()> {
        let mut st = self.state.lock();
        if st.destroyed {
            return Ok(());
        }
        if !st.borrowed.is_empty() {
            let labels: Vec<String> = st
                .borrowed
                .values()
                .take(MAX_REPORTED_LEAKS)
                .map(|lent| lent.label.clone())
                .collect();
            for label in &labels {
                log::error!("{} bank destroyed while '{}' is still borrowed", T::KIND, label);
            }
            return Err(PresentError::LeakedObjects {
                kind: T::KIND,
                count: st.borrowed.len(),
                labels,
            });
        }

        for item in &st.returned {
            item.drain()?;
        }
        for item in st.returned.drain(..) {
            item.destroy(self.device.as_ref());
        }
        st.destroyed = true;
        log::debug!("Destroyed {} bank ({} objects allocated over its lifetime)", T::KIND, st.allocated);
        Ok(())
    }

    pub fn is_borrowed(&self, item: &T) -> bool {
        self.state.lock().borrowed.contains_key(&item.raw())
    }

    pub fn label_of(&self, item: &T) -> Option<String> {
        self.state
            .lock()
            .borrowed
            .get(&item.raw())
            .map(|lent| lent.label.clone())
    }

    pub fn borrowed_count(&self) -> usize {
        self.state.lock().borrowed.len()
    }

    /// Returned objects waiting to be recycled
    pub fn free_count(&self) -> usize {
        self.state.lock().returned.len()
    }

    /// Physical objects created over the bank's lifetime
    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockGpu;
    use crate::backend::{DeviceProvider, Submission};
    use std::collections::HashSet;

    const TIMEOUT: Duration = Duration::from_millis(10);

    fn fence_bank(mock: &Arc<MockGpu>) -> FenceBank {
        FenceBank::new(mock.clone(), TIMEOUT, None)
    }

    fn semaphore_bank(mock: &Arc<MockGpu>) -> SemaphoreBank {
        SemaphoreBank::new(mock.clone(), TIMEOUT, None)
    }

    #[test]
    fn returned_handle_is_reused_without_allocating() {
        let mock = MockGpu::new();
        let bank = semaphore_bank(&mock);

        let first = bank.borrow(false, "x").unwrap();
        assert_eq!(mock.semaphores_allocated(), 1);
        bank.give_back(first).unwrap();

        let second = bank.borrow(false, "x").unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.semaphores_allocated(), 1);
        assert_eq!(bank.allocated_count(), 1);
    }

    #[test]
    fn returned_fence_is_reused_without_allocating() {
        let mock = MockGpu::new();
        let bank = fence_bank(&mock);

        let fence = bank.borrow(false, "x").unwrap();
        let handle = fence.handle();
        bank.give_back(fence).unwrap();

        let again = bank.borrow(false, "x").unwrap();
        assert_eq!(again.handle(), handle);
        assert_eq!(mock.fences_allocated(), 1);
    }

    #[test]
    fn returning_an_unborrowed_handle_fails() {
        let mock = MockGpu::new();
        let bank = semaphore_bank(&mock);
        let semaphore = bank.borrow(false, "x").unwrap();
        bank.give_back(semaphore).unwrap();

        let err = bank.give_back(semaphore).unwrap_err();
        assert!(matches!(err, PresentError::NotBorrowed { kind: "semaphore", .. }));
    }

    #[test]
    fn pending_fence_is_not_recycled() {
        let mock = MockGpu::new();
        let bank = fence_bank(&mock);

        let busy = bank.borrow(false, "busy").unwrap();
        let handle = busy.submit().unwrap();
        mock.submit(vk::Queue::null(), &Submission::default(), handle)
            .unwrap();
        bank.give_back(busy.clone()).unwrap();

        let other = bank.borrow(false, "other").unwrap();
        assert_ne!(other.handle(), busy.handle());
        assert_eq!(mock.fences_allocated(), 2);

        mock.signal_fence(handle);
        bank.give_back(other).unwrap();
        // Both are recyclable now; either is fine but nothing new is allocated
        bank.borrow(false, "a").unwrap();
        bank.borrow(false, "b").unwrap();
        assert_eq!(mock.fences_allocated(), 2);
    }

    #[test]
    fn recycled_fence_matches_requested_start_state() {
        let mock = MockGpu::new();
        let bank = fence_bank(&mock);

        let fence = bank.borrow(false, "f").unwrap();
        let token = fence.new_token();
        fence.signal().unwrap();
        bank.give_back(fence).unwrap();

        let signaled = bank.borrow(true, "f").unwrap();
        assert!(signaled.is_signaled().unwrap());
        // A token from the previous borrower is still answered correctly
        assert!(token.has_completed().unwrap());
        bank.give_back(signaled).unwrap();

        let unsignaled = bank.borrow(false, "f").unwrap();
        assert!(!unsignaled.is_signaled().unwrap());
        assert!(!unsignaled.new_token().has_completed().unwrap());
    }

    #[test]
    fn borrowed_and_free_never_overlap() {
        let mock = MockGpu::new();
        let bank = semaphore_bank(&mock);
        let mut held = Vec::new();

        for step in 0..40usize {
            if step % 3 == 2 && !held.is_empty() {
                let item = held.remove(step % held.len());
                bank.give_back(item).unwrap();
            } else {
                held.push(bank.borrow(false, "s").unwrap());
            }
            for item in &held {
                assert!(bank.is_borrowed(item));
            }
            assert_eq!(bank.borrowed_count(), held.len());
            assert_eq!(
                bank.borrowed_count() + bank.free_count(),
                bank.allocated_count()
            );
        }
    }

    #[test]
    fn borrow_many_labels_each_object() {
        let mock = MockGpu::new();
        let bank = semaphore_bank(&mock);
        let items = bank.borrow_many(3, false, "acquire").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(bank.label_of(&items[2]).as_deref(), Some("acquire[2]"));
        bank.give_back_many(items).unwrap();
        assert_eq!(bank.free_count(), 3);
    }

    #[test]
    fn capacity_limit_is_enforced() {
        let mock = MockGpu::new();
        let bank = SemaphoreBank::new(mock.clone(), TIMEOUT, Some(2));
        let a = bank.borrow(false, "a").unwrap();
        let _b = bank.borrow(false, "b").unwrap();
        assert!(matches!(
            bank.borrow(false, "c"),
            Err(PresentError::PoolExhausted { capacity: 2, .. })
        ));
        bank.give_back(a).unwrap();
        bank.borrow(false, "c").unwrap();
    }

    #[test]
    fn semaphores_cannot_start_signaled() {
        let mock = MockGpu::new();
        let bank = semaphore_bank(&mock);
        assert!(matches!(
            bank.borrow(true, "s"),
            Err(PresentError::InvalidState(_))
        ));
    }

    #[test]
    fn destroy_with_borrowed_objects_reports_labels() {
        let mock = MockGpu::new();
        let bank = fence_bank(&mock);
        let _leaks = bank.borrow_many(7, false, "leak").unwrap();

        match bank.destroy().unwrap_err() {
            PresentError::LeakedObjects { count, labels, .. } => {
                assert_eq!(count, 7);
                assert_eq!(labels.len(), 5);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn destroy_drains_pending_fences_then_frees_everything() {
        let mock = MockGpu::new();
        let bank = fence_bank(&mock);

        let fence = bank.borrow(false, "work").unwrap();
        let handle = fence.submit().unwrap();
        mock.submit(vk::Queue::null(), &Submission::default(), handle)
            .unwrap();
        bank.give_back(fence).unwrap();

        // The device never finishes: draining times out
        assert!(matches!(bank.destroy(), Err(PresentError::Timeout { .. })));

        mock.complete_all();
        bank.destroy().unwrap();
        assert_eq!(mock.live_fences(), 0);
        assert!(matches!(
            bank.borrow(false, "late"),
            Err(PresentError::BankDestroyed("fence"))
        ));
        // Second destroy is a no-op
        bank.destroy().unwrap();
    }

    #[test]
    fn borrow_and_return_from_many_threads() {
        let mock = MockGpu::new();
        let bank = Arc::new(semaphore_bank(&mock));

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let bank = Arc::clone(&bank);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let s = bank.borrow(false, &format!("t{t}-{i}")).unwrap();
                        bank.give_back(s).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(bank.borrowed_count(), 0);
        assert!(bank.allocated_count() <= 4);
        let distinct: HashSet<u64> = bank
            .borrow_many(bank.free_count(), false, "check")
            .unwrap()
            .iter()
            .map(|s| s.raw())
            .collect();
        assert_eq!(distinct.len(), bank.allocated_count());
    }
}
