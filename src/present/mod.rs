// Presentation - swapchain generations and the manager that rotates them

pub mod chain;
pub mod manager;

pub use chain::{ChainState, FrameImage, SwapBufferChain};
pub use manager::{PresentationManager, PresentationStats};
