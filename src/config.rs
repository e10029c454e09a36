// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Window/graphics/debug settings drive the demo. The presentation and sync
// sections tune the library: wait timeouts, the superseded-chain cap, retry
// budget and bank capacities. Every field has a default.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub presentation: PresentationConfig,
    pub sync: SyncConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Presenter".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            frames_in_flight: 2,
        }
    }
}

/// Swapchain management
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PresentationConfig {
    /// Superseded chains tolerated before a full device idle wait
    pub max_superseded_chains: usize,
    /// Extra recreate-and-acquire attempts when the driver reports out-of-date
    pub max_acquire_retries: u32,
    /// Images requested on top of the surface minimum
    pub extra_images: u32,
    /// Use present fences when the device supports them
    pub use_present_fence: bool,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            max_superseded_chains: 10,
            max_acquire_retries: 1,
            extra_images: 1,
            use_present_fence: true,
        }
    }
}

/// Fence/semaphore banks
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Every blocking wait gives up after this long; a timeout is fatal
    pub wait_timeout_ms: u64,
    /// 0 = unbounded
    pub fence_capacity: usize,
    /// 0 = unbounded
    pub semaphore_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 1000,
            fence_capacity: 0,
            semaphore_capacity: 0,
        }
    }
}

impl SyncConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn fence_capacity(&self) -> Option<usize> {
        (self.fence_capacity > 0).then_some(self.fence_capacity)
    }

    pub fn semaphore_capacity(&self) -> Option<usize> {
        (self.semaphore_capacity > 0).then_some(self.semaphore_capacity)
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        parse_present_mode(&self.graphics.present_mode)
    }
}

/// Map a config string to a present mode, defaulting to FIFO (always supported)
pub fn parse_present_mode(name: &str) -> ash::vk::PresentModeKHR {
    match name.to_lowercase().as_str() {
        "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
        "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
        "fifo" => ash::vk::PresentModeKHR::FIFO,
        "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
        _ => {
            log::warn!("Unknown present mode '{}', defaulting to FIFO", name);
            ash::vk::PresentModeKHR::FIFO
        }
    }
}
