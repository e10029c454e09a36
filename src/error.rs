// Error taxonomy for the presentation layer
//
// Programmer errors and fatal device errors are both values of PresentError.
// Out-of-date / suboptimal surfaces are NOT errors: they show up as `Ok(None)`
// from acquire and are absorbed by the presentation manager.

use ash::vk;
use std::time::Duration;
use thiserror::Error;

/// Result type for presentation and synchronization operations.
pub type PresentResult<T> = std::result::Result<T, PresentError>;

/// Broad class of a [`PresentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misuse of the API. Fix the caller.
    Programmer,
    /// The device can no longer be trusted. Stop the frame loop.
    FatalDevice,
}

#[derive(Error, Debug)]
pub enum PresentError {
    /// A sync object was handed back to a bank that did not lend it out
    #[error("{kind} 0x{raw:x} is not currently borrowed from this bank")]
    NotBorrowed { kind: &'static str, raw: u64 },

    /// A fence or chain operation was called in the wrong state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Borrowing beyond the configured bank capacity
    #[error("{kind} bank exhausted (capacity {capacity})")]
    PoolExhausted { kind: &'static str, capacity: usize },

    /// Bank destroyed while objects were still borrowed
    #[error("{kind} bank destroyed with {count} borrowed objects, e.g. {labels:?}")]
    LeakedObjects {
        kind: &'static str,
        count: usize,
        labels: Vec<String>,
    },

    /// Borrow or return on a bank after destroy()
    #[error("{0} bank has already been destroyed")]
    BankDestroyed(&'static str),

    /// Acquire/present on a swapchain generation that no longer exists
    #[error("swapchain generation {0} has been destroyed")]
    ChainDestroyed(u64),

    /// A blocking wait exceeded its timeout
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { timeout: Duration, what: String },

    #[error("device lost")]
    DeviceLost,

    /// Any other unexpected driver result
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl PresentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PresentError::NotBorrowed { .. }
            | PresentError::InvalidState(_)
            | PresentError::PoolExhausted { .. }
            | PresentError::LeakedObjects { .. }
            | PresentError::BankDestroyed(_)
            | PresentError::ChainDestroyed(_) => ErrorKind::Programmer,
            PresentError::Timeout { .. } | PresentError::DeviceLost | PresentError::Vulkan(_) => {
                ErrorKind::FatalDevice
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::FatalDevice
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        PresentError::InvalidState(msg.into())
    }
}

impl From<vk::Result> for PresentError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => PresentError::DeviceLost,
            other => PresentError::Vulkan(other),
        }
    }
}
