// Queue access discipline
//
// One mutex per hardware queue serializes submissions to it. A device-wide
// RwLock lets ordinary submissions run side by side (read) while a full idle
// wait (write) holds new submissions back until the device is quiet.

use ash::vk;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use super::{GpuDevice, PresentRequest, Submission};
use crate::error::{PresentError, PresentResult};
use crate::sync::{LogicalFence, SubmissionToken};

struct QueueSlot {
    queue: vk::Queue,
    family: u32,
    lock: Mutex<()>,
}

pub struct DeviceQueues {
    device: Arc<dyn GpuDevice>,
    queues: Vec<QueueSlot>,
    idle: RwLock<()>,
}

impl DeviceQueues {
    /// `queues` are (queue, family index) pairs; index 0 is the graphics/present queue by convention
    pub fn new(device: Arc<dyn GpuDevice>, queues: &[(vk::Queue, u32)]) -> Self {
        Self {
            device,
            queues: queues
                .iter()
                .map(|&(queue, family)| QueueSlot {
                    queue,
                    family,
                    lock: Mutex::new(()),
                })
                .collect(),
            idle: RwLock::new(()),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn family(&self, index: usize) -> PresentResult<u32> {
        Ok(self.slot(index)?.family)
    }

    fn slot(&self, index: usize) -> PresentResult<&QueueSlot> {
        self.queues.get(index).ok_or_else(|| {
            PresentError::invalid_state(format!(
                "queue index {} out of range ({} queues)",
                index,
                self.queues.len()
            ))
        })
    }

    /// Submit with a raw (or null) fence
    pub fn submit(&self, index: usize, submission: &Submission<'_>, fence: vk::Fence) -> PresentResult<()> {
        let slot = self.slot(index)?;
        let _idle = self.idle.read();
        let _queue = slot.lock.lock();
        self.device.submit(slot.queue, submission, fence)?;
        Ok(())
    }

    /// Submit signalling a logical fence; returns the token for this submission.
    /// A rejected submission leaves the fence submittable again.
    pub fn submit_fenced(
        &self,
        index: usize,
        submission: &Submission<'_>,
        fence: &Arc<LogicalFence>,
    ) -> PresentResult<SubmissionToken> {
        let token = fence.new_token();
        let handle = fence.submit()?;
        if let Err(e) = self.submit(index, submission, handle) {
            fence.abandon_submission();
            return Err(e);
        }
        Ok(token)
    }

    /// Present on the given queue, returning the raw result code
    pub fn present(&self, index: usize, request: &PresentRequest) -> PresentResult<vk::Result> {
        let slot = self.slot(index)?;
        let _idle = self.idle.read();
        let _queue = slot.lock.lock();
        Ok(self.device.present(slot.queue, request))
    }

    /// Block new submissions and wait for the whole device to go idle
    pub fn wait_idle(&self) -> PresentResult<()> {
        let _idle = self.idle.write();
        self.device.wait_idle()?;
        Ok(())
    }
}
