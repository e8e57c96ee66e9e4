// =============================================================================
// VKFRAME - minimal frame-lifecycle renderer
// =============================================================================
//
// The host side: window creation, the winit event loop, and argument
// parsing live here. The frame lifecycle itself (device, swapchain,
// command recording, GPU pacing) is behind the Framework trait, which
// this loop drives through init/update/render/resize/release.
//
// FRAME FLOW:
// 1. Acquire the next back buffer
// 2. Wait for that slot's previous GPU work
// 3. Record and submit the frame's commands
// 4. Present, then signal the GPU timeline
//
// =============================================================================

mod backend;
mod config;
mod framework;

use anyhow::Result;
use config::Config;
use framework::{Framework, FrameworkSettings, GpuFramework};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    // Load configuration, then apply command-line overrides
    let mut config = Config::load();
    apply_cli_overrides(&mut config);

    log::info!("Starting vkframe");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );

    let settings = FrameworkSettings::from_config(&config);
    let event_loop = EventLoop::new()?;
    let mut app = App::new(&config, Box::new(GpuFramework::new(settings)));
    event_loop.run_app(&mut app)?;

    // The message loop has ended; tear the framework down last
    app.framework.release()
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

/// Host-side argument parsing. The framework core never touches the
/// command line; it only receives the resulting values.
fn apply_cli_overrides(config: &mut Config) {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--width" => {
                if let Some(value) = args.next().and_then(|v| v.parse().ok()) {
                    config.window.width = value;
                }
            }
            "--height" => {
                if let Some(value) = args.next().and_then(|v| v.parse().ok()) {
                    config.window.height = value;
                }
            }
            "--software" => config.adapter.force_software = true,
            other => log::warn!("Ignoring unknown argument '{}'", other),
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Host application object owning the window and the framework.
struct App {
    framework: Box<dyn Framework>,

    window: Option<Arc<Window>>,
    title: String,
    start_fullscreen: bool,
    is_fullscreen: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: &Config, framework: Box<dyn Framework>) -> Self {
        let now = Instant::now();
        Self {
            framework,
            window: None,
            title: config.window.title.clone(),
            start_fullscreen: config.window.fullscreen,
            is_fullscreen: config.window.fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen {
                    "fullscreen"
                } else {
                    "windowed"
                };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.framework.width(),
                self.framework.height(),
            ));

        if self.start_fullscreen {
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

        // Initialization failure is fatal; there is no recovery path
        if let Err(e) = self.framework.init(&window) {
            log::error!("Failed to initialize framework: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    /// Handle window events.
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
                if let Err(e) = self.framework.resize(size.width, size.height) {
                    log::error!("Resize error: {:?}", e);
                    event_loop.exit();
                }
            }

            WindowEvent::RedrawRequested => {
                self.framework.update();
                match self.framework.render() {
                    Ok(()) => self.update_fps(),
                    Err(e) => {
                        log::error!("Render error: {:?}", e);
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };

                if event.state.is_pressed() {
                    match key {
                        // Host-side bindings; not forwarded to the framework
                        KeyCode::Escape => {
                            log::info!("ESC pressed, exiting...");
                            event_loop.exit();
                        }
                        KeyCode::F11 => {
                            self.toggle_fullscreen();
                        }
                        _ => {
                            if !event.repeat {
                                self.framework.key_down(key);
                            }
                        }
                    }
                } else {
                    self.framework.key_up(key);
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws while idle.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
