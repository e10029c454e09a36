// Logical fences - a physical VkFence plus a submission timeline
//
// Physical fences are recycled through the fence bank. Every submission gets a
// new point on the fence's timeline, so a SubmissionToken taken for one
// submission can never be satisfied by a later, unrelated one.

use ash::vk;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{FenceStatus, GpuDevice};
use crate::error::{PresentError, PresentResult};

/// Where the fence is in its submit/complete cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Reset and ready for a submission
    Unsignaled,
    /// Handed to a queue; the device has not reported completion yet
    Pending,
    /// The current timeline point has completed (device or host signal)
    Signaled,
}

#[derive(Debug)]
struct Timeline {
    state: FenceState,
    /// Timeline point of the next/current submission, starts at 1
    current_time: u64,
    /// Highest completed timeline point
    last_completed: u64,
}

impl Timeline {
    fn complete(&mut self) {
        self.last_completed = self.current_time;
        self.state = FenceState::Signaled;
    }
}

pub struct LogicalFence {
    handle: vk::Fence,
    device: Arc<dyn GpuDevice>,
    timeout: Duration,
    timeline: Mutex<Timeline>,
}

impl LogicalFence {
    /// Wrap a freshly allocated physical fence. A fence created signaled starts completed.
    pub(crate) fn new(
        device: Arc<dyn GpuDevice>,
        handle: vk::Fence,
        start_signaled: bool,
        timeout: Duration,
    ) -> Self {
        let mut timeline = Timeline {
            state: FenceState::Unsignaled,
            current_time: 1,
            last_completed: 0,
        };
        if start_signaled {
            timeline.complete();
        }
        Self {
            handle,
            device,
            timeout,
            timeline: Mutex::new(timeline),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Lazily pick up device-side completion of a pending submission
    fn poll(&self, t: &mut Timeline) -> PresentResult<()> {
        if t.state == FenceState::Pending
            && self.device.fence_status(self.handle)? == FenceStatus::Signaled
        {
            t.complete();
        }
        Ok(())
    }

    pub fn state(&self) -> PresentResult<FenceState> {
        let mut t = self.timeline.lock();
        self.poll(&mut t)?;
        Ok(t.state)
    }

    pub fn is_pending(&self) -> PresentResult<bool> {
        Ok(self.state()? == FenceState::Pending)
    }

    pub fn is_signaled(&self) -> PresentResult<bool> {
        Ok(self.state()? == FenceState::Signaled)
    }

    /// Mark the fence as submitted and return the handle for the queue submission.
    ///
    /// Fails while a previous submission is pending or its signal has not been consumed by `reset()`.
    pub fn submit(&self) -> PresentResult<vk::Fence> {
        let mut t = self.timeline.lock();
        self.poll(&mut t)?;
        match t.state {
            FenceState::Unsignaled => {
                t.state = FenceState::Pending;
                Ok(self.handle)
            }
            FenceState::Pending => Err(PresentError::invalid_state(format!(
                "fence {:?} submitted while pending",
                self.handle
            ))),
            FenceState::Signaled => Err(PresentError::invalid_state(format!(
                "fence {:?} submitted while signaled; reset it first",
                self.handle
            ))),
        }
    }

    /// Roll back a `submit()` whose queue operation was rejected by the driver
    pub(crate) fn abandon_submission(&self) {
        let mut t = self.timeline.lock();
        if t.state == FenceState::Pending {
            t.state = FenceState::Unsignaled;
        }
    }

    /// Consume a completed signal. Moves the timeline forward so new tokens
    /// refer to the next submission, not the one that just finished.
    pub fn reset(&self) -> PresentResult<()> {
        let mut t = self.timeline.lock();
        self.poll(&mut t)?;
        match t.state {
            FenceState::Pending => Err(PresentError::invalid_state(format!(
                "fence {:?} reset while pending",
                self.handle
            ))),
            FenceState::Signaled => {
                self.device.reset_fence(self.handle)?;
                t.current_time += 1;
                t.state = FenceState::Unsignaled;
                Ok(())
            }
            FenceState::Unsignaled => Ok(()),
        }
    }

    /// Host-side signal: complete the current timeline point without the device
    pub fn signal(&self) -> PresentResult<()> {
        let mut t = self.timeline.lock();
        self.poll(&mut t)?;
        if t.state == FenceState::Pending {
            return Err(PresentError::invalid_state(format!(
                "fence {:?} host-signaled while pending",
                self.handle
            )));
        }
        t.complete();
        Ok(())
    }

    /// Snapshot the current timeline point
    pub fn new_token(self: &Arc<Self>) -> SubmissionToken {
        let t = self.timeline.lock();
        SubmissionToken {
            fence: Arc::clone(self),
            reference_time: t.current_time,
        }
    }

    pub fn has_completed(&self, reference_time: u64) -> PresentResult<bool> {
        let mut t = self.timeline.lock();
        if reference_time <= t.last_completed {
            return Ok(true);
        }
        self.poll(&mut t)?;
        Ok(reference_time <= t.last_completed)
    }

    /// Block until `reference_time` has completed, or fail after the fence timeout
    pub fn await_time(&self, reference_time: u64) -> PresentResult<()> {
        let submitted = {
            let t = self.timeline.lock();
            if reference_time <= t.last_completed {
                return Ok(());
            }
            if reference_time > t.current_time {
                return Err(PresentError::invalid_state(format!(
                    "fence {:?}: time {} is beyond the current timeline point {}",
                    self.handle, reference_time, t.current_time
                )));
            }
            if t.state != FenceState::Pending {
                return Err(PresentError::invalid_state(format!(
                    "fence {:?}: awaited time {} was never submitted",
                    self.handle, reference_time
                )));
            }
            t.current_time
        };

        // The timeline lock is not held here; pollers must never queue behind a device wait
        let status = self.device.wait_for_fence(self.handle, self.timeout)?;

        let mut t = self.timeline.lock();
        if status == FenceStatus::Signaled
            && t.state == FenceState::Pending
            && t.current_time == submitted
        {
            t.complete();
        }
        if reference_time <= t.last_completed {
            Ok(())
        } else {
            Err(PresentError::Timeout {
                timeout: self.timeout,
                what: format!("fence {:?}", self.handle),
            })
        }
    }

    /// Wait out the in-flight submission, if there is one
    pub fn wait_if_pending(&self) -> PresentResult<()> {
        let current = {
            let mut t = self.timeline.lock();
            self.poll(&mut t)?;
            if t.state != FenceState::Pending {
                return Ok(());
            }
            t.current_time
        };
        self.await_time(current)
    }
}

impl fmt::Debug for LogicalFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.timeline.lock();
        f.debug_struct("LogicalFence")
            .field("handle", &self.handle)
            .field("state", &t.state)
            .field("current_time", &t.current_time)
            .field("last_completed", &t.last_completed)
            .finish()
    }
}

/// An immutable snapshot of a fence's timeline point, taken at submission time.
///
/// Stays valid after the fence is returned to its bank and reused.
#[derive(Clone)]
pub struct SubmissionToken {
    fence: Arc<LogicalFence>,
    reference_time: u64,
}

impl SubmissionToken {
    pub fn fence(&self) -> &Arc<LogicalFence> {
        &self.fence
    }

    pub fn reference_time(&self) -> u64 {
        self.reference_time
    }

    /// Non-blocking; use this instead of `wait()` when the caller needs to stay cancellable
    pub fn has_completed(&self) -> PresentResult<bool> {
        self.fence.has_completed(self.reference_time)
    }

    pub fn wait(&self) -> PresentResult<()> {
        self.fence.await_time(self.reference_time)
    }
}

impl fmt::Debug for SubmissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionToken")
            .field("fence", &self.fence.handle)
            .field("reference_time", &self.reference_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockGpu;
    use crate::backend::{DeviceProvider, Submission, SyncAllocator};
    use std::time::Instant;

    fn fence(mock: &Arc<MockGpu>, signaled: bool) -> Arc<LogicalFence> {
        let handle = mock.allocate_fence(signaled).unwrap();
        Arc::new(LogicalFence::new(
            mock.clone(),
            handle,
            signaled,
            Duration::from_millis(10),
        ))
    }

    fn submit(mock: &MockGpu, fence: &LogicalFence) {
        let handle = fence.submit().unwrap();
        mock.submit(vk::Queue::null(), &Submission::default(), handle)
            .unwrap();
    }

    #[test]
    fn token_completes_once_device_signals() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);

        let token = fence.new_token();
        submit(&mock, &fence);
        assert!(!token.has_completed().unwrap());
        assert!(fence.is_pending().unwrap());

        mock.signal_fence(fence.handle());
        assert!(token.has_completed().unwrap());
        assert!(token.has_completed().unwrap());
        assert_eq!(fence.state().unwrap(), FenceState::Signaled);
    }

    #[test]
    fn submit_while_pending_is_rejected() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);
        submit(&mock, &fence);

        let err = fence.submit().unwrap_err();
        assert!(matches!(err, PresentError::InvalidState(_)));
        assert!(matches!(fence.reset(), Err(PresentError::InvalidState(_))));
        assert!(matches!(fence.signal(), Err(PresentError::InvalidState(_))));
    }

    #[test]
    fn submit_while_signaled_requires_reset() {
        let mock = MockGpu::new();
        let fence = fence(&mock, true);
        assert!(matches!(fence.submit(), Err(PresentError::InvalidState(_))));

        fence.reset().unwrap();
        assert_eq!(fence.submit().unwrap(), fence.handle());
    }

    #[test]
    fn reset_moves_new_tokens_past_the_completed_submission() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);

        let first = fence.new_token();
        submit(&mock, &fence);
        mock.signal_fence(fence.handle());
        assert!(first.has_completed().unwrap());

        fence.reset().unwrap();
        let second = fence.new_token();
        assert!(second.reference_time() > first.reference_time());
        assert!(!second.has_completed().unwrap());
        // The old token stays completed
        assert!(first.has_completed().unwrap());

        submit(&mock, &fence);
        assert!(!second.has_completed().unwrap());
        mock.signal_fence(fence.handle());
        assert!(second.has_completed().unwrap());
    }

    #[test]
    fn recycling_never_completes_a_stale_token_early() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);

        // Several submit -> signal -> reset rounds, with host signals mixed in
        for round in 0..4 {
            fence.reset().unwrap();
            let token = fence.new_token();
            if round % 2 == 0 {
                submit(&mock, &fence);
                assert!(!token.has_completed().unwrap());
                mock.signal_fence(fence.handle());
            } else {
                assert!(!token.has_completed().unwrap());
                fence.signal().unwrap();
            }
            assert!(token.has_completed().unwrap());

            fence.reset().unwrap();
            let next = fence.new_token();
            assert!(!next.has_completed().unwrap());
        }
    }

    #[test]
    fn reset_without_completion_keeps_the_timeline_point() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);
        let before = fence.new_token();
        fence.reset().unwrap();
        let after = fence.new_token();
        assert_eq!(before.reference_time(), after.reference_time());
    }

    #[test]
    fn host_signal_completes_without_device() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);
        let token = fence.new_token();
        fence.signal().unwrap();
        assert!(token.has_completed().unwrap());
        assert!(!mock.is_signaled(fence.handle()));
    }

    #[test]
    fn await_returns_immediately_for_completed_tokens() {
        let mock = MockGpu::new();
        let fence = fence(&mock, true);
        let token = fence.new_token();
        token.wait().unwrap();
    }

    #[test]
    fn await_times_out_when_device_never_signals() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);
        let token = fence.new_token();
        submit(&mock, &fence);

        let err = token.wait().unwrap_err();
        assert!(matches!(err, PresentError::Timeout { .. }));
        assert!(err.is_fatal());

        mock.signal_fence(fence.handle());
        token.wait().unwrap();
    }

    #[test]
    fn polling_is_not_blocked_by_a_waiting_thread() {
        let mock = MockGpu::new();
        mock.set_wait_delay(Duration::from_millis(800));
        let handle = mock.allocate_fence(false).unwrap();
        let fence = Arc::new(LogicalFence::new(
            mock.clone(),
            handle,
            false,
            Duration::from_millis(800),
        ));
        let token = fence.new_token();
        submit(&mock, &fence);

        let waiter = {
            let token = token.clone();
            std::thread::spawn(move || token.wait())
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(!token.has_completed().unwrap());
        assert!(fence.is_pending().unwrap());
        assert!(started.elapsed() < Duration::from_millis(400));

        mock.signal_fence(fence.handle());
        waiter.join().unwrap().unwrap();
        assert!(token.has_completed().unwrap());
        assert_eq!(fence.state().unwrap(), FenceState::Signaled);
    }

    #[test]
    fn awaiting_an_unsubmitted_point_is_a_programmer_error() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);
        let token = fence.new_token();
        assert!(matches!(token.wait(), Err(PresentError::InvalidState(_))));
    }

    #[test]
    fn abandoned_submission_can_be_resubmitted() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);
        fence.submit().unwrap();
        fence.abandon_submission();
        assert_eq!(fence.state().unwrap(), FenceState::Unsignaled);
        fence.submit().unwrap();
    }

    #[test]
    fn wait_if_pending_is_a_no_op_when_idle() {
        let mock = MockGpu::new();
        let fence = fence(&mock, false);
        fence.wait_if_pending().unwrap();

        submit(&mock, &fence);
        mock.complete_all();
        fence.wait_if_pending().unwrap();
        assert!(fence.is_signaled().unwrap());
    }
}
