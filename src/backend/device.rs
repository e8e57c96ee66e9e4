// Vulkan device - core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Adapter selection (hardware preferred, software by policy)
// - Logical device + queue creation

use anyhow::{bail, Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use super::adapter::{self, AdapterInfo, MIN_API_VERSION};

/// Adapter and diagnostics policy applied during device creation.
#[derive(Clone, Debug, Default)]
pub struct DeviceOptions {
    pub force_software: bool,
    pub software_fallback: bool,
    pub validation: bool,
    /// Validation message ids dropped by the debug callback
    pub suppressed_messages: Vec<String>,
}

/// Vulkan device wrapper with automatic cleanup
pub struct RenderDevice {
    // Vulkan handles (order matters for drop!)
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // The adapter this device was created from
    pub adapter: AdapterInfo,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Referenced by the debug callback through its user-data pointer;
    // must outlive the messenger
    _message_filter: Option<Box<MessageFilter>>,
}

impl RenderDevice {
    /// Create the Vulkan device.
    ///
    /// Enumerates adapters, applies the selection policy from `options`
    /// (hardware with the most dedicated memory; software when forced or
    /// as a configured fallback), and creates the logical device with a
    /// single graphics queue.
    pub fn new(
        display_handle: RawDisplayHandle,
        app_name: &str,
        options: &DeviceOptions,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, app_name, display_handle, options.validation)?;

        let (debug_utils, message_filter) = if options.validation {
            let filter = Box::new(MessageFilter {
                suppressed: options.suppressed_messages.clone(),
            });
            let messenger = Self::setup_debug_messenger(&entry, &instance, &filter)?;
            (Some(messenger), Some(filter))
        } else {
            (None, None)
        };

        let (physical_device, graphics_queue_family, adapter) =
            Self::pick_adapter(&instance, options)?;

        log::info!("Selected adapter: {}", adapter.name);
        log::info!(
            "\tVendorName: {}\n\tDedicatedVideoMemory: {}\n\tSharedSystemMemory: {}",
            adapter.vendor_name(),
            adapter.dedicated_video_memory,
            adapter.shared_system_memory
        );

        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            adapter,
            debug_utils,
            _message_filter: message_filter,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("vkframe")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(MIN_API_VERSION);

        // Surface extensions for the host's window system
        let mut extensions = surface_extension_names(display_handle)?;

        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        filter: &MessageFilter,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        // Informational severity is not registered at all; the id-name
        // deny-list handles the remaining known-noisy messages.
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(filter as *const MessageFilter as *mut c_void);

        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_adapter(
        instance: &ash::Instance,
        options: &DeviceOptions,
    ) -> Result<(vk::PhysicalDevice, u32, AdapterInfo)> {
        let candidates = adapter::enumerate_adapters(instance)?;
        let infos: Vec<AdapterInfo> = candidates.iter().map(|c| c.info.clone()).collect();

        let picked = if options.force_software {
            adapter::select_software(&infos)
        } else {
            match adapter::select_hardware(&infos) {
                Some(index) => Some(index),
                None if options.software_fallback => {
                    log::warn!("No suitable hardware adapter, falling back to software");
                    adapter::select_software(&infos)
                }
                None => None,
            }
        };

        let Some(index) = picked else {
            bail!("No suitable GPU adapter found");
        };

        let chosen = &candidates[index];
        let graphics_family = chosen
            .graphics_family
            .context("Selected adapter has no graphics queue family")?;

        Ok((chosen.handle, graphics_family, chosen.info.clone()))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        // One direct queue at normal priority
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        // The frame pacer runs on timeline semaphores (core in 1.2)
        let mut vulkan12_features =
            vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut vulkan12_features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Presentation surface for a native window.
///
/// The window handle must stay valid for the surface's lifetime; the
/// host application owns the window and guarantees this.
pub struct WindowSurface {
    surface: vk::SurfaceKHR,
    loader: ash::extensions::khr::Surface,
}

impl WindowSurface {
    pub fn new(
        device: &RenderDevice,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        let loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);

        let surface = unsafe {
            match (display_handle, window_handle) {
                (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                    let hinstance =
                        handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const c_void;
                    let hwnd = handle.hwnd.get() as *const c_void;
                    let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                        .hinstance(hinstance)
                        .hwnd(hwnd);
                    let win32_loader =
                        ash::extensions::khr::Win32Surface::new(&device.entry, &device.instance);
                    win32_loader.create_win32_surface(&create_info, None)
                }
                (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                    let dpy = display
                        .display
                        .map(|d| d.as_ptr())
                        .unwrap_or(std::ptr::null_mut());
                    let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                        .dpy(dpy as *mut _)
                        .window(handle.window);
                    let xlib_loader =
                        ash::extensions::khr::XlibSurface::new(&device.entry, &device.instance);
                    xlib_loader.create_xlib_surface(&create_info, None)
                }
                (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
                    let connection = display
                        .connection
                        .map(|c| c.as_ptr())
                        .unwrap_or(std::ptr::null_mut());
                    let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                        .connection(connection as *mut _)
                        .window(handle.window.get());
                    let xcb_loader =
                        ash::extensions::khr::XcbSurface::new(&device.entry, &device.instance);
                    xcb_loader.create_xcb_surface(&create_info, None)
                }
                (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                    let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                        .display(display.display.as_ptr())
                        .surface(handle.surface.as_ptr());
                    let wayland_loader =
                        ash::extensions::khr::WaylandSurface::new(&device.entry, &device.instance);
                    wayland_loader.create_wayland_surface(&create_info, None)
                }
                _ => bail!("Unsupported window handle type"),
            }
        }
        .context("Failed to create window surface")?;

        Ok(Self { surface, loader })
    }

    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    #[inline]
    pub fn loader(&self) -> &ash::extensions::khr::Surface {
        &self.loader
    }

    /// Whether the device's graphics queue can present to this surface.
    pub fn supports_present(&self, device: &RenderDevice) -> Result<bool> {
        let supported = unsafe {
            self.loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                self.surface,
            )
        }?;
        Ok(supported)
    }
}

impl Drop for WindowSurface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}

/// Instance extensions needed to present to the host's window system,
/// chosen by the display handle variant.
fn surface_extension_names(
    display_handle: RawDisplayHandle,
) -> Result<Vec<*const std::os::raw::c_char>> {
    use ash::extensions::khr;

    let platform = match display_handle {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        _ => bail!("Unsupported display system"),
    };

    Ok(vec![khr::Surface::name().as_ptr(), platform.as_ptr()])
}

/// Deny-list consulted by the debug callback through its user-data pointer.
struct MessageFilter {
    suppressed: Vec<String>,
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    let data = &*p_callback_data;

    let id_name = if data.p_message_id_name.is_null() {
        ""
    } else {
        CStr::from_ptr(data.p_message_id_name)
            .to_str()
            .unwrap_or("")
    };

    if !p_user_data.is_null() {
        let filter = &*(p_user_data as *const MessageFilter);
        if filter.suppressed.iter().any(|s| s == id_name) {
            return vk::FALSE;
        }
    }

    let message = CStr::from_ptr(data.p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
