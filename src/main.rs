// =============================================================================
// VK-PRESENTER DEMO - Clear-colour frame loop over PresentationManager
// =============================================================================
//
// FRAME FLOW:
// 1. Acquire an image from the presentation manager (None = skip this frame)
// 2. Wait for the frame slot's previous submission, reset its fence
// 3. Record + submit a clear of the acquired image
// 4. Present, handing over the submission token
//
// Resize, minimise, F11 fullscreen and present-mode edits in config.toml all
// end up as swapchain recreations inside the manager.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use raw_window_handle::HasDisplayHandle;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Instant;
use vk_presenter::{
    Config, DeviceQueues, LogicalFence, PresentResult, PresentationManager, SubmissionToken,
    Submission, SyncBanks, VulkanDevice, VulkanSurface,
};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

const CONFIG_PATH: &str = "config.toml";
const GRAPHICS_QUEUE: usize = 0;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting vk-presenter demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== vk-presenter Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

/// Watch config.toml; every change event sends a unit down the channel
fn watch_config() -> Result<(RecommendedWatcher, Receiver<()>)> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => log::warn!("Config watcher error: {}", e),
        }
    })?;
    watcher
        .watch(Path::new(CONFIG_PATH), RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", CONFIG_PATH))?;
    Ok((watcher, rx))
}

// =============================================================================
// RENDERER - everything that exists once the window does
// =============================================================================

/// Per frame-in-flight resources
struct FrameResources {
    command_buffer: vk::CommandBuffer,
    fence: Arc<LogicalFence>,
    /// Last submission made from this slot
    in_flight: Option<SubmissionToken>,
}

struct Renderer {
    device: Arc<VulkanDevice>,
    queues: Arc<DeviceQueues>,
    banks: SyncBanks,
    presenter: PresentationManager,
    command_pool: vk::CommandPool,
    frames: Vec<FrameResources>,
    current_frame: usize,
    wait_stages: [vk::PipelineStageFlags; 1],
    clear_color: [f32; 4],
}

impl Renderer {
    fn new(config: &Config, window: Arc<Window>) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // Enable validation layers based on config (and debug build)
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let device = VulkanDevice::new(&config.window.title, enable_validation, display)?;

        let surface = Arc::new(VulkanSurface::new(Arc::clone(&device), window)?);
        let queues = Arc::new(DeviceQueues::new(
            device.clone(),
            &[(device.graphics_queue, device.graphics_queue_family)],
        ));
        let banks = SyncBanks::new(device.clone(), &config.sync);
        let presenter =
            PresentationManager::new(surface, Arc::clone(&queues), GRAPHICS_QUEUE, &banks, config);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family)
            // TRANSIENT: Command buffers are short-lived
            // RESET: Allow individual buffer reset
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None)? };

        let frames_in_flight = config.graphics.frames_in_flight.max(1);
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info)? };

        let mut frames = Vec::with_capacity(frames_in_flight);
        for (i, command_buffer) in command_buffers.into_iter().enumerate() {
            frames.push(FrameResources {
                command_buffer,
                fence: banks.fences.borrow(false, &format!("frame[{}]", i))?,
                in_flight: None,
            });
        }

        log::info!("Vulkan initialized ({} frames in flight)", frames_in_flight);
        Ok(Self {
            device,
            queues,
            banks,
            presenter,
            command_pool,
            frames,
            current_frame: 0,
            wait_stages: [vk::PipelineStageFlags::TRANSFER],
            clear_color: config.graphics.clear_color,
        })
    }

    /// Render one frame. Ok(false) = nothing to draw into this time.
    fn render_frame(&mut self, present_mode: vk::PresentModeKHR) -> PresentResult<bool> {
        let Some(image) = self.presenter.acquire(present_mode, "main")? else {
            return Ok(false);
        };

        // Wait for the frame that last used this slot
        let frame = &mut self.frames[self.current_frame];
        if let Some(token) = frame.in_flight.take() {
            token.wait()?;
        }
        frame.fence.reset()?;

        record_clear(
            &self.device.device,
            frame.command_buffer,
            image.image,
            self.clear_color,
        )?;

        let command_buffers = [frame.command_buffer];
        let wait_semaphores = [image.acquire_semaphore];
        let signal_semaphores = [image.present_semaphore];
        let token = self.queues.submit_fenced(
            GRAPHICS_QUEUE,
            &Submission {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_stages: &self.wait_stages,
                signal_semaphores: &signal_semaphores,
            },
            &frame.fence,
        )?;
        frame.in_flight = Some(token.clone());

        self.presenter.present(&image, Some(token), None)?;

        self.current_frame = (self.current_frame + 1) % self.frames.len();
        Ok(true)
    }

    fn shutdown(&mut self) -> PresentResult<()> {
        self.presenter.destroy()?;
        for frame in self.frames.drain(..) {
            self.banks.fences.give_back(frame.fence)?;
        }
        self.banks.destroy()?;
        unsafe {
            // Also frees the command buffers
            self.device.device.destroy_command_pool(self.command_pool, None);
        }
        let stats = self.presenter.stats();
        log::info!(
            "Swapchains created: {}, recreations: {}, forced collections: {}",
            stats.chains_created,
            stats.recreations,
            stats.forced_collections
        );
        Ok(())
    }
}

/// Record a clear of `image`: UNDEFINED -> TRANSFER_DST -> clear -> PRESENT_SRC
fn record_clear(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    color: [f32; 4],
) -> Result<(), vk::Result> {
    let clear_color = vk::ClearColorValue { float32: color };

    // Which parts of the image to affect (all of it)
    let subresource_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    unsafe {
        device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(cmd, &begin_info)?;

        let barrier_to_transfer = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED) // Don't care about old contents
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range);

        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_to_transfer],
        );

        device.cmd_clear_color_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear_color,
            &[subresource_range],
        );

        let barrier_to_present = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range);

        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_to_present],
        );

        device.end_command_buffer(cmd)?;
    }
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    present_mode: vk::PresentModeKHR,
    is_fullscreen: bool,

    // Config hot-reload
    _watcher: Option<RecommendedWatcher>,
    config_changes: Option<Receiver<()>>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let (watcher, config_changes) = match watch_config() {
            Ok((watcher, rx)) => (Some(watcher), Some(rx)),
            Err(e) => {
                log::warn!("Config hot-reload disabled: {:#}", e);
                (None, None)
            }
        };
        let now = Instant::now();
        Self {
            present_mode: config.get_present_mode(),
            is_fullscreen: config.window.fullscreen,
            config,
            window: None,
            renderer: None,
            _watcher: watcher,
            config_changes,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Pick up a new present mode from config.toml; the manager recreates on the next acquire
    fn poll_config_changes(&mut self) {
        let Some(rx) = &self.config_changes else {
            return;
        };
        if rx.try_iter().count() == 0 {
            return;
        }
        match Config::load_from_path(CONFIG_PATH) {
            Ok(config) => {
                let mode = config.get_present_mode();
                if mode != self.present_mode {
                    log::info!("Present mode changed: {:?} -> {:?}", self.present_mode, mode);
                    self.present_mode = mode;
                }
                self.config.graphics.present_mode = config.graphics.present_mode;
            }
            Err(e) => log::warn!("Ignoring config change: {:#}", e),
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{:?}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    self.present_mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            log::info!("Cleaning up Vulkan resources...");
            if let Err(e) = renderer.shutdown() {
                log::error!("Shutdown failed: {}", e);
            }
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match Renderer::new(&self.config, Arc::clone(&window)) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:?}", e);
                event_loop.exit();
                return;
            }
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            // The manager polls the window size itself; nothing to do on Resized
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
            }

            WindowEvent::RedrawRequested => {
                self.poll_config_changes();
                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };
                match renderer.render_frame(self.present_mode) {
                    Ok(true) => self.update_fps(),
                    Ok(false) => {}
                    Err(e) => {
                        log::error!("Render error ({:?}): {}", e.kind(), e);
                        self.shutdown();
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown();
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
