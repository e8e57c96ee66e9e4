// Framework - the frame lifecycle driver
//
// Wires adapter selection, device creation, the swapchain, command
// recording, and the frame pacer into the Init -> {Update, Render}* ->
// Release lifecycle a host event loop drives.

use anyhow::{bail, Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Duration;
use winit::keyboard::KeyCode;
use winit::window::Window;

use crate::backend::command::FrameCommands;
use crate::backend::device::{DeviceOptions, RenderDevice, WindowSurface};
use crate::backend::swapchain::{self, AcquireOutcome, Swapchain};
use crate::backend::sync::{
    flush_gpu_queue, FramePacer, FrameSync, GpuTimeline, Pacing, TimelineSemaphore,
};
use crate::config::Config;

/// The callback surface a host message loop invokes.
///
/// `resize` and `render` are only legal after `init`; `release` must be
/// the last call and may be repeated. The trait stays polymorphic so a
/// host can swap in an alternative backend.
pub trait Framework {
    fn init(&mut self, window: &Window) -> Result<()>;
    fn update(&mut self);
    fn render(&mut self) -> Result<()>;
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;
    fn release(&mut self) -> Result<()>;

    fn key_down(&mut self, _key: KeyCode) {}
    fn key_up(&mut self, _key: KeyCode) {}

    fn width(&self) -> u32;
    fn height(&self) -> u32;

    fn aspect_ratio(&self) -> f32 {
        self.width() as f32 / self.height() as f32
    }
}

/// Already-parsed settings handed to the framework by the host; the
/// core never touches the command line or the config file itself.
#[derive(Clone, Debug)]
pub struct FrameworkSettings {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub vsync: bool,
    pub clear_color: [f32; 4],
    pub pacing: Pacing,
    pub force_software: bool,
    pub software_fallback: bool,
    pub validation: bool,
    pub suppressed_messages: Vec<String>,
    pub frame_wait_timeout: Option<Duration>,
}

impl FrameworkSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            title: config.window.title.clone(),
            width: config.window.width,
            height: config.window.height,
            buffer_count: config.buffer_count(),
            vsync: config.graphics.vsync,
            clear_color: config.graphics.clear_color,
            pacing: config.pacing(),
            force_software: config.adapter.force_software,
            software_fallback: config.adapter.software_fallback,
            validation: config.debug.validation,
            suppressed_messages: config.debug.suppressed_messages.clone(),
            frame_wait_timeout: config.frame_wait_timeout(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initialized,
    Released,
}

/// Everything owned once `init` succeeds.
///
/// Field order is teardown order: GPU objects first, then the surface,
/// then the device that outlives them all.
struct GpuState {
    swapchain: Swapchain,
    commands: FrameCommands,
    sync: FrameSync,
    timeline: TimelineSemaphore,
    pacer: FramePacer,
    frame_cursor: usize,
    swapchain_dirty: bool,
    surface: WindowSurface,
    device: Arc<RenderDevice>,
}

impl GpuState {
    /// Drain the GPU, then recreate the swapchain at the current extent.
    fn flush_and_rebuild(&mut self) -> Result<()> {
        let flushed = flush_gpu_queue(&mut self.timeline)?;
        // Everything at or below the flushed value is complete
        self.pacer.reset_all(flushed);
        self.swapchain.rebuild()?;
        self.refit_slots()
    }

    /// Drain the GPU, then resize the back buffers.
    fn flush_and_resize(&mut self, width: u32, height: u32) -> Result<()> {
        let flushed = flush_gpu_queue(&mut self.timeline)?;
        self.pacer.reset_all(flushed);
        self.swapchain.resize(width, height)?;
        self.refit_slots()
    }

    /// Re-partition per-slot resources when the surface changed the
    /// image count. Legal only right after a flush.
    fn refit_slots(&mut self) -> Result<()> {
        let slots = self.swapchain.image_count();
        if slots != self.pacer.slot_count() {
            log::info!("Swapchain image count changed to {}", slots);
            self.commands = FrameCommands::new(self.device.clone(), slots)?;
            self.sync = FrameSync::new(self.device.clone(), slots)?;
            let mut pacer = FramePacer::new(slots);
            pacer.reset_all(self.timeline.last_signaled());
            self.pacer = pacer;
            self.frame_cursor = 0;
        }
        self.swapchain_dirty = false;
        Ok(())
    }

    fn render_frame(
        &mut self,
        clear_color: [f32; 4],
        pacing: Pacing,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.swapchain_dirty {
            self.flush_and_rebuild()?;
        }

        let acquire_semaphore = self.sync.image_available(self.frame_cursor);
        let slot = match self.swapchain.acquire(acquire_semaphore)? {
            AcquireOutcome::OutOfDate => {
                self.swapchain_dirty = true;
                return Ok(());
            }
            AcquireOutcome::Acquired { slot, suboptimal } => {
                if suboptimal {
                    self.swapchain_dirty = true;
                }
                slot as usize
            }
        };

        // The slot's previous submission must have retired before its
        // pool is reset. With N slots this only blocks when the GPU is
        // more than N - 1 frames behind.
        self.timeline.wait(self.pacer.value_for(slot), timeout)?;

        let first_use = self.swapchain.take_first_use(slot);
        self.commands
            .record_clear(slot, self.swapchain.image(slot), first_use, clear_color)?;
        self.commands
            .submit(slot, acquire_semaphore, self.sync.render_finished(slot))?;

        if self
            .swapchain
            .present(self.device.graphics_queue, self.sync.render_finished(slot))?
        {
            self.swapchain_dirty = true;
        }

        // Record the requirement for this slot's next reuse
        let value = self.timeline.signal()?;
        self.pacer.record_signal(slot, value);

        if pacing == Pacing::Lockstep {
            flush_gpu_queue(&mut self.timeline)?;
        }

        self.frame_cursor = (self.frame_cursor + 1) % self.pacer.slot_count();

        Ok(())
    }
}

/// GPU-backed implementation of [`Framework`]. Whether it runs on a
/// hardware adapter or a software rasterizer is decided by the adapter
/// policy in its settings.
pub struct GpuFramework {
    settings: FrameworkSettings,
    width: u32,
    height: u32,
    // A zero-sized resize request means the window is minimized; back
    // buffers stay at the clamped 1x1 but rendering is suspended
    minimized: bool,
    state: Lifecycle,
    gpu: Option<GpuState>,
}

impl GpuFramework {
    pub fn new(settings: FrameworkSettings) -> Self {
        let width = settings.width.max(1);
        let height = settings.height.max(1);
        Self {
            settings,
            width,
            height,
            minimized: false,
            state: Lifecycle::Uninitialized,
            gpu: None,
        }
    }
}

impl Framework for GpuFramework {
    fn init(&mut self, window: &Window) -> Result<()> {
        if self.state != Lifecycle::Uninitialized {
            bail!("Init is only legal once, before any other call");
        }

        log::info!("Initializing framework...");

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let options = DeviceOptions {
            force_software: self.settings.force_software,
            software_fallback: self.settings.software_fallback,
            validation: self.settings.validation,
            suppressed_messages: self.settings.suppressed_messages.clone(),
        };
        let device = RenderDevice::new(display_handle, &self.settings.title, &options)?;

        let surface = WindowSurface::new(&device, display_handle, window_handle)?;
        if !surface.supports_present(&device)? {
            bail!("GPU doesn't support presenting to this surface");
        }

        let tearing_supported = swapchain::query_tearing_support(
            surface.loader(),
            device.physical_device,
            surface.handle(),
        );

        let swapchain = Swapchain::new(
            device.clone(),
            &surface,
            self.width,
            self.height,
            self.settings.buffer_count,
            self.settings.vsync,
            tearing_supported,
        )?;

        // Per-slot resources follow the actual image count, which the
        // surface may have raised above the requested ring size
        let slots = swapchain.image_count();
        let commands = FrameCommands::new(device.clone(), slots)?;
        let sync = FrameSync::new(device.clone(), slots)?;
        let timeline = TimelineSemaphore::new(device.clone())?;
        let pacer = FramePacer::new(slots);

        self.gpu = Some(GpuState {
            swapchain,
            commands,
            sync,
            timeline,
            pacer,
            frame_cursor: 0,
            swapchain_dirty: false,
            surface,
            device,
        });
        self.state = Lifecycle::Initialized;

        log::info!("Framework initialized");
        Ok(())
    }

    fn update(&mut self) {
        // Reserved for scene logic; the core records no per-frame CPU
        // work of its own.
    }

    fn render(&mut self) -> Result<()> {
        if self.state != Lifecycle::Initialized {
            bail!("Render is only legal between Init and Release");
        }
        if self.minimized {
            return Ok(());
        }

        let gpu = self.gpu.as_mut().context("GPU state missing")?;
        gpu.render_frame(
            self.settings.clear_color,
            self.settings.pacing,
            self.settings.frame_wait_timeout,
        )
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if self.state != Lifecycle::Initialized {
            bail!("Resize is only legal between Init and Release");
        }

        self.minimized = width == 0 || height == 0;

        let Some((new_width, new_height)) =
            resize_action((self.width, self.height), (width, height))
        else {
            return Ok(());
        };

        log::info!("Resizing to {}x{}", new_width, new_height);
        self.width = new_width;
        self.height = new_height;

        let gpu = self.gpu.as_mut().context("GPU state missing")?;
        gpu.flush_and_resize(new_width, new_height)
    }

    fn release(&mut self) -> Result<()> {
        match self.state {
            // Idempotent teardown: repeated release is a no-op
            Lifecycle::Released => return Ok(()),
            Lifecycle::Uninitialized => {
                self.state = Lifecycle::Released;
                return Ok(());
            }
            Lifecycle::Initialized => {}
        }

        if let Some(mut gpu) = self.gpu.take() {
            // Drain-before-destroy: nothing may still reference the
            // resources being torn down
            flush_gpu_queue(&mut gpu.timeline)?;
            gpu.device.wait_idle()?;
        }
        self.state = Lifecycle::Released;

        log::info!("Framework released");
        Ok(())
    }

    fn key_down(&mut self, key: KeyCode) {
        if key == KeyCode::KeyV && self.state == Lifecycle::Initialized {
            self.settings.vsync = !self.settings.vsync;
            log::info!(
                "VSync {}",
                if self.settings.vsync { "on" } else { "off" }
            );
            if let Some(gpu) = self.gpu.as_mut() {
                gpu.swapchain.set_vsync(self.settings.vsync);
                gpu.swapchain_dirty = true;
            }
        }
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Decide what a resize request means: `None` when the raw dimensions
/// already match the current ones, otherwise the clamped target size.
/// Zero-sized back buffers are never allowed.
fn resize_action(current: (u32, u32), requested: (u32, u32)) -> Option<(u32, u32)> {
    if requested == current {
        return None;
    }
    Some((requested.0.max(1), requested.1.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> FrameworkSettings {
        FrameworkSettings::from_config(&Config::default())
    }

    #[test]
    fn resize_with_unchanged_dimensions_is_a_no_op() {
        assert_eq!(resize_action((1280, 720), (1280, 720)), None);
    }

    #[test]
    fn resize_clamps_each_dimension_to_one() {
        assert_eq!(resize_action((1280, 720), (0, 0)), Some((1, 1)));
        assert_eq!(resize_action((1280, 720), (0, 480)), Some((1, 480)));
        assert_eq!(resize_action((1280, 720), (640, 0)), Some((640, 1)));
    }

    #[test]
    fn resize_to_zero_still_proceeds_when_already_minimal() {
        // (0, 0) differs from the stored (1, 1), so the flush-and-resize
        // path runs even though the clamped target is unchanged
        assert_eq!(resize_action((1, 1), (0, 0)), Some((1, 1)));
    }

    #[test]
    fn render_before_init_is_rejected() {
        let mut framework = GpuFramework::new(settings());
        assert!(framework.render().is_err());
        assert!(framework.resize(800, 600).is_err());
    }

    #[test]
    fn release_is_idempotent() {
        let mut framework = GpuFramework::new(settings());
        assert!(framework.release().is_ok());
        assert!(framework.release().is_ok());
        // And the state machine stays final
        assert!(framework.render().is_err());
    }

    #[test]
    fn dimensions_are_clamped_at_construction() {
        let mut s = settings();
        s.width = 0;
        s.height = 0;
        let framework = GpuFramework::new(s);
        assert_eq!(framework.width(), 1);
        assert_eq!(framework.height(), 1);
    }

    #[test]
    fn aspect_ratio_uses_current_dimensions() {
        let framework = GpuFramework::new(settings());
        let expected = 1280.0 / 720.0;
        assert!((framework.aspect_ratio() - expected).abs() < f32::EPSILON);
    }

    #[test]
    fn settings_follow_the_config() {
        let config = Config::default();
        let s = FrameworkSettings::from_config(&config);
        assert_eq!(s.buffer_count, 2);
        assert_eq!(s.pacing, Pacing::Pipelined);
        assert_eq!(s.clear_color, [0.4, 0.6, 0.9, 1.0]);
        assert!(s.software_fallback);
        assert!(!s.force_software);
    }
}
