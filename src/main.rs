// =============================================================================
// LUMEN DEMO - drives the engine core from a winit window
// =============================================================================
//
// The core owns device, swapchain and frame synchronization. This binary is
// the collaborator side:
//   - the window (surface provider + resize notifications)
//   - a command-buffer provider that clears every swapchain image
//   - the event loop that calls draw_frame once per redraw
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use lumen_core::backend::{CommandBufferProvider, FrameStatus, Swapchain, VulkanDevice};
use lumen_core::{Config, Engine, ResizeFlag};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Lumen demo");
    log::info!("Window: {}x{}", config.window.width, config.window.height);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Fatal engine errors end the event loop and surface here
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_filter())
        .parse_default_env()
        .init();
}

// =============================================================================
// COMMANDS
// =============================================================================

/// One pre-recorded command buffer per swapchain image, each clearing the
/// image through the swapchain's render pass.
struct ClearCommands {
    device: Arc<VulkanDevice>,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    clear_color: [f32; 4],
}

impl ClearCommands {
    fn new(device: Arc<VulkanDevice>, clear_color: [f32; 4]) -> Result<Self> {
        let graphics_family = device
            .queue_families
            .graphics_family
            .context("Device has no graphics queue family")?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None)? };

        Ok(Self {
            device,
            command_pool,
            command_buffers: Vec::new(),
            clear_color,
        })
    }

    fn record(&self, swapchain: &Swapchain) -> Result<()> {
        let device = &self.device.device;
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            let begin_info = vk::CommandBufferBeginInfo::builder();

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(swapchain.render_pass)
                .framebuffer(swapchain.framebuffers[i])
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: swapchain.extent,
                })
                .clear_values(&clear_values);

            unsafe {
                device.begin_command_buffer(cmd, &begin_info)?;
                device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
                device.cmd_end_render_pass(cmd);
                device.end_command_buffer(cmd)?;
            }
        }

        Ok(())
    }
}

impl CommandBufferProvider for ClearCommands {
    fn command_buffer(&mut self, image_index: u32) -> vk::CommandBuffer {
        self.command_buffers[image_index as usize]
    }

    fn swapchain_rebuilt(&mut self, swapchain: &Swapchain) -> Result<()> {
        // The engine waited for the device before rebuilding, nothing of the
        // old buffers is still executing
        if !self.command_buffers.is_empty() {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.command_pool, &self.command_buffers);
            }
            self.command_buffers.clear();
        }

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(swapchain.image_count() as u32);

        self.command_buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info)? };
        self.record(swapchain)?;

        log::info!(
            "Recorded {} command buffers for swapchain generation {}",
            self.command_buffers.len(),
            swapchain.generation
        );
        Ok(())
    }
}

impl Drop for ClearCommands {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        unsafe {
            // Also frees the command buffers
            self.device.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters: commands are released before the engine
struct Renderer {
    commands: ClearCommands,
    engine: Engine,
}

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    resize: Option<ResizeFlag>,
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            window: None,
            renderer: None,
            resize: None,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        let engine = Engine::new(&self.config, window)?;
        log::info!(
            "Validation layers: {}",
            if engine.instance().validation_enabled() { "enabled" } else { "disabled" }
        );
        let mut commands = ClearCommands::new(engine.device().clone(), self.config.render.clear_color)?;

        if let Some(swapchain) = engine.swapchain() {
            commands.swapchain_rebuilt(swapchain)?;
        }

        self.resize = Some(engine.resize_flag());
        self.renderer = Some(Renderer { commands, engine });
        Ok(())
    }

    fn render_frame(&mut self) -> Result<bool> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(false);
        };

        let status = renderer.engine.draw_frame(&mut renderer.commands, &mut ())?;
        Ok(matches!(status, FrameStatus::Presented { .. }))
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
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal: {:#}", error);
        self.fatal = Some(error);
        event_loop.exit();
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

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        if let Err(e) = self.init_renderer(window.clone()) {
            self.fail(event_loop, e.context("Failed to initialize Vulkan"));
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref resize) = self.resize {
                    resize.notify();
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
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

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Tear down while the window (and its surface) still exists
        if let Some(ref renderer) = self.renderer {
            if let Err(e) = renderer.engine.wait_idle() {
                log::error!("Device did not go idle before cleanup: {:#}", e);
            }
        }
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
