// Tracks whether any presentation has provably finished
//
// Without present fences the only proof is an acquire fence: re-acquiring an
// image that was presented before means the presentation engine let go of it.
// With present fences the proof is the fence itself. Either way we only pay for
// a fence while there are superseded chains waiting for that proof.

use super::fence::SubmissionToken;
use crate::error::PresentResult;

pub struct PresentationFinishedTracker {
    frames_in_flight: usize,
    supports_present_fence: bool,
    acquire_tokens: Vec<Option<SubmissionToken>>,
    present_tokens: Vec<Option<SubmissionToken>>,
    finished_once: bool,
}

impl PresentationFinishedTracker {
    pub fn new(frames_in_flight: usize, supports_present_fence: bool) -> Self {
        let frames_in_flight = frames_in_flight.max(1);
        Self {
            frames_in_flight,
            supports_present_fence,
            acquire_tokens: vec![None; frames_in_flight],
            present_tokens: vec![None; frames_in_flight],
            finished_once: false,
        }
    }

    pub fn supports_present_fence(&self) -> bool {
        self.supports_present_fence
    }

    fn slot(&self, index: usize) -> usize {
        index % self.frames_in_flight
    }

    /// Poll recorded tokens, dropping the completed ones
    fn refresh(&mut self) -> PresentResult<bool> {
        for token in self
            .acquire_tokens
            .iter_mut()
            .chain(self.present_tokens.iter_mut())
        {
            let done = match token {
                Some(t) => t.has_completed()?,
                None => false,
            };
            if done {
                *token = None;
                self.finished_once = true;
            }
        }
        Ok(self.finished_once)
    }

    /// Attach a fence to the next acquire only when old chains are waiting for
    /// proof and no earlier acquire fence is already on its way to providing it
    pub fn needs_acquire_fence(&mut self, has_old_chains: bool) -> PresentResult<bool> {
        if self.supports_present_fence || !has_old_chains {
            return Ok(false);
        }
        if self.refresh()? {
            return Ok(false);
        }
        Ok(self.acquire_tokens.iter().all(Option::is_none))
    }

    /// Same idea for present fences; always false without the capability
    pub fn needs_present_fence(&mut self, slot: usize, has_old_chains: bool) -> PresentResult<bool> {
        if !self.supports_present_fence || !has_old_chains {
            return Ok(false);
        }
        if self.refresh()? {
            return Ok(false);
        }
        let slot = self.slot(slot);
        Ok(self.present_tokens[slot].is_none())
    }

    pub fn use_acquire_fence(&mut self, slot: usize, token: SubmissionToken) {
        let slot = self.slot(slot);
        self.acquire_tokens[slot] = Some(token);
    }

    pub fn use_present_fence(&mut self, slot: usize, token: SubmissionToken) {
        let slot = self.slot(slot);
        self.present_tokens[slot] = Some(token);
    }

    pub fn has_finished_at_least_one_presentation(&mut self) -> PresentResult<bool> {
        self.refresh()
    }
}
