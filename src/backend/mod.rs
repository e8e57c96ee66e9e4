// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics

pub mod adapter;
pub mod command;
pub mod device;
pub mod swapchain;
pub mod sync;

pub use device::RenderDevice;
pub use swapchain::Swapchain;
