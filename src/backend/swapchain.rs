// Swapchain - window presentation
//
// Manages the ring of back buffers we render to and present, the
// render-target views over them, and the current back-buffer index.
// Rebuilding (resize, vsync change, out-of-date surface) requires the
// caller to flush the GPU first: the old buffers must not be referenced
// by any in-flight command list when they are released.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::device::WindowSurface;
use super::RenderDevice;

/// Result of acquiring the next back buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The slot to render into; `suboptimal` asks for a rebuild after
    /// this frame.
    Acquired { slot: u32, suboptimal: bool },
    /// The surface changed underneath us; rebuild before rendering.
    OutOfDate,
}

pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    loader: ash::extensions::khr::Swapchain,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    // Images of a fresh swapchain start in UNDEFINED layout; tracked
    // per image so the first clear transitions from the right layout
    first_use: Vec<bool>,
    format: vk::Format,
    extent: vk::Extent2D,
    buffer_count: u32,
    vsync: bool,
    tearing_supported: bool,
    current_index: u32,
    device: Arc<RenderDevice>,
}

impl Swapchain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<RenderDevice>,
        surface: &WindowSurface,
        width: u32,
        height: u32,
        buffer_count: u32,
        vsync: bool,
        tearing_supported: bool,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            loader,
            surface: surface.handle(),
            surface_loader: surface.loader().clone(),
            images: Vec::new(),
            views: Vec::new(),
            first_use: Vec::new(),
            format: vk::Format::B8G8R8A8_UNORM,
            extent: clamp_extent(width, height),
            buffer_count,
            vsync,
            tearing_supported,
            current_index: 0,
            device,
        };

        swapchain.create_swapchain()?;
        swapchain.update_render_target_views()?;

        Ok(swapchain)
    }

    /// (Re)create the underlying swapchain at `self.extent`, reusing the
    /// old one as the ancestor when present.
    fn create_swapchain(&mut self) -> Result<()> {
        let surface_caps = unsafe {
            self.surface_loader.get_physical_device_surface_capabilities(
                self.device.physical_device,
                self.surface,
            )
        }?;

        let formats = unsafe {
            self.surface_loader.get_physical_device_surface_formats(
                self.device.physical_device,
                self.surface,
            )
        }?;
        let surface_format = choose_surface_format(&formats).context("No surface format")?;

        let present_mode = present_mode_for(self.vsync, self.tearing_supported);
        log::info!("Present mode: {:?}", present_mode);

        // The surface dictates the extent when it reports a fixed one
        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: self.extent.width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: self.extent.height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let image_count = clamp_buffer_count(
            self.buffer_count,
            surface_caps.min_image_count,
            surface_caps.max_image_count,
        );

        let old_swapchain = self.swapchain;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        self.swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }

        self.images = unsafe { self.loader.get_swapchain_images(self.swapchain) }?;
        self.first_use = vec![true; self.images.len()];
        self.format = surface_format.format;
        self.extent = extent;
        self.current_index = 0;

        log::info!("Created swapchain with {} images", self.images.len());

        Ok(())
    }

    /// Rebuild the render-target views, one per back buffer. Must run
    /// after creation and after every rebuild.
    pub fn update_render_target_views(&mut self) -> Result<()> {
        self.destroy_views();

        let views: Result<Vec<_>> = self
            .images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe {
                    self.device
                        .device
                        .create_image_view(&create_info, None)
                        .context("Failed to create render target view")
                }
            })
            .collect();

        self.views = views?;
        debug_assert_eq!(self.views.len(), self.images.len());

        Ok(())
    }

    /// Resize the back buffers. The caller must have flushed the GPU
    /// queue; the old buffers are released before recreation.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.extent = clamp_extent(width, height);
        self.rebuild()
    }

    /// Recreate the swapchain at the current extent, preserving format
    /// and usage. Used after resize, vsync changes, and out-of-date
    /// surfaces. GPU must be flushed first.
    pub fn rebuild(&mut self) -> Result<()> {
        // Release every cached back-buffer reference before recreation
        self.destroy_views();
        self.images.clear();

        self.create_swapchain()?;
        self.update_render_target_views()
    }

    /// Change the present policy. Takes effect on the next `rebuild`.
    pub fn set_vsync(&mut self, vsync: bool) {
        self.vsync = vsync;
    }

    /// Acquire the next back buffer, advancing the current index.
    pub fn acquire(&mut self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                self.current_index = index;
                Ok(AcquireOutcome::Acquired {
                    slot: index,
                    suboptimal,
                })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire back buffer"),
        }
    }

    /// Present the current back buffer. Returns true when the swapchain
    /// needs a rebuild.
    pub fn present(&self, queue: vk::Queue, wait_semaphore: vk::Semaphore) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [self.current_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present back buffer"),
        }
    }

    #[inline]
    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    #[inline]
    pub fn image(&self, slot: usize) -> vk::Image {
        self.images[slot]
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Whether this is the image's first use since (re)creation; clears
    /// the flag.
    pub fn take_first_use(&mut self, slot: usize) -> bool {
        std::mem::replace(&mut self.first_use[slot], false)
    }

    fn destroy_views(&mut self) {
        unsafe {
            for &view in &self.views {
                self.device.device.destroy_image_view(view, None);
            }
        }
        self.views.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_views();
        unsafe {
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Back buffers may never be zero-sized; clamp each dimension to 1.
pub fn clamp_extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: width.max(1),
        height: height.max(1),
    }
}

/// Clamp the requested ring size into the surface's supported range
/// (`max` of zero means unbounded).
pub fn clamp_buffer_count(requested: u32, min: u32, max: u32) -> u32 {
    let count = requested.max(min);
    if max > 0 {
        count.min(max)
    } else {
        count
    }
}

/// Present mode policy: vsync always uses FIFO; without vsync, tearing
/// (IMMEDIATE) is used when the surface supports it, FIFO otherwise.
pub fn present_mode_for(vsync: bool, tearing_supported: bool) -> vk::PresentModeKHR {
    if !vsync && tearing_supported {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Prefer 8-bit-per-channel BGRA; fall back to whatever the surface
/// offers first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Tearing is available when the surface offers IMMEDIATE presents. A
/// failed query is logged and treated as unsupported.
pub fn query_tearing_support(
    surface_loader: &ash::extensions::khr::Surface,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> bool {
    match unsafe {
        surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
    } {
        Ok(modes) => modes.contains(&vk::PresentModeKHR::IMMEDIATE),
        Err(e) => {
            log::warn!("Failed to check tearing support: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_dimensions_clamp_to_one() {
        assert_eq!(clamp_extent(0, 0), vk::Extent2D { width: 1, height: 1 });
        assert_eq!(clamp_extent(0, 720), vk::Extent2D { width: 1, height: 720 });
        assert_eq!(
            clamp_extent(1280, 720),
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );
    }

    #[test]
    fn buffer_count_respects_surface_limits() {
        assert_eq!(clamp_buffer_count(2, 2, 8), 2);
        assert_eq!(clamp_buffer_count(2, 3, 8), 3);
        assert_eq!(clamp_buffer_count(4, 2, 3), 3);
        // max == 0 means the surface imposes no upper bound
        assert_eq!(clamp_buffer_count(4, 2, 0), 4);
    }

    #[test]
    fn vsync_always_selects_fifo() {
        assert_eq!(present_mode_for(true, true), vk::PresentModeKHR::FIFO);
        assert_eq!(present_mode_for(true, false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn tearing_selects_immediate_only_when_supported() {
        assert_eq!(present_mode_for(false, true), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(present_mode_for(false, false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_format_prefers_bgra8() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R16G16B16A16_SFLOAT,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }
}
