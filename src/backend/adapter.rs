// Adapter selection - physical GPU enumeration and filtering
//
// Responsibilities:
// - Enumerate every Vulkan physical device with its properties
// - Skip CPU rasterizers unless explicitly requested
// - Pick the adapter with the most dedicated video memory that meets
//   the minimum API version and has a graphics queue

use anyhow::Result;
use ash::vk;
use std::ffi::CStr;

/// Minimum Vulkan version an adapter must support (timeline semaphores
/// are core in 1.2).
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_2;

const PCI_ID_AMD: u32 = 0x1002;
const PCI_ID_INTEL: u32 = 0x8086;
const PCI_ID_NVIDIA: u32 = 0x10de;
const PCI_ID_MESA: u32 = 0x10005;

/// Host-side description of a physical adapter, captured once during
/// enumeration so selection can run over plain data.
#[derive(Clone, Debug)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub dedicated_video_memory: u64,
    pub shared_system_memory: u64,
    pub api_version: u32,
    pub has_graphics_queue: bool,
}

impl AdapterInfo {
    /// CPU rasterizers (llvmpipe, SwiftShader) report the CPU device type.
    pub fn is_software(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::CPU
    }

    pub fn vendor_name(&self) -> &'static str {
        match self.vendor_id {
            PCI_ID_AMD => "amd",
            PCI_ID_INTEL => "intel",
            PCI_ID_NVIDIA => "nvidia",
            PCI_ID_MESA => "mesa",
            _ => "unknown",
        }
    }

    fn meets_minimum(&self) -> bool {
        self.has_graphics_queue && self.api_version >= MIN_API_VERSION
    }
}

/// A physical device paired with its host-side description.
pub struct AdapterCandidate {
    pub handle: vk::PhysicalDevice,
    pub graphics_family: Option<u32>,
    pub info: AdapterInfo,
}

/// Enumerate all physical devices and capture their descriptions.
pub fn enumerate_adapters(instance: &ash::Instance) -> Result<Vec<AdapterCandidate>> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;

    log::info!("Found {} Vulkan adapter(s)", devices.len());

    let mut candidates = Vec::with_capacity(devices.len());
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let graphics_family = queue_families
            .iter()
            .enumerate()
            .find(|(_, family)| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(i, _)| i as u32);

        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let heaps = &memory.memory_heaps[..memory.memory_heap_count as usize];
        let dedicated_video_memory = heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();
        let shared_system_memory = heaps
            .iter()
            .filter(|heap| !heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        let info = AdapterInfo {
            name,
            vendor_id: properties.vendor_id,
            device_type: properties.device_type,
            dedicated_video_memory,
            shared_system_memory,
            api_version: properties.api_version,
            has_graphics_queue: graphics_family.is_some(),
        };

        log::debug!(
            "Adapter '{}' ({:?}, vendor {}): {} MiB dedicated",
            info.name,
            info.device_type,
            info.vendor_name(),
            info.dedicated_video_memory / (1024 * 1024)
        );

        candidates.push(AdapterCandidate {
            handle: device,
            graphics_family,
            info,
        });
    }

    Ok(candidates)
}

/// Pick the hardware adapter with the most dedicated video memory.
///
/// Software adapters never qualify here, whatever memory they report;
/// neither does an adapter reporting zero dedicated memory.
pub fn select_hardware(adapters: &[AdapterInfo]) -> Option<usize> {
    let mut max_dedicated_memory = 0u64;
    let mut chosen = None;

    for (index, info) in adapters.iter().enumerate() {
        if info.is_software() {
            // Don't select the basic render driver; software rendering
            // is an explicit request or a fallback, never a default.
            continue;
        }
        if info.meets_minimum() && info.dedicated_video_memory > max_dedicated_memory {
            max_dedicated_memory = info.dedicated_video_memory;
            chosen = Some(index);
        }
    }

    chosen
}

/// Pick a software adapter, preferring the one with the most memory.
pub fn select_software(adapters: &[AdapterInfo]) -> Option<usize> {
    adapters
        .iter()
        .enumerate()
        .filter(|(_, info)| info.is_software() && info.meets_minimum())
        .max_by_key(|(_, info)| info.dedicated_video_memory)
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(
        device_type: vk::PhysicalDeviceType,
        dedicated: u64,
        api_version: u32,
    ) -> AdapterInfo {
        AdapterInfo {
            name: "test".to_string(),
            vendor_id: PCI_ID_AMD,
            device_type,
            dedicated_video_memory: dedicated,
            shared_system_memory: 0,
            api_version,
            has_graphics_queue: true,
        }
    }

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn hardware_beats_software_regardless_of_memory() {
        let adapters = [
            adapter(vk::PhysicalDeviceType::CPU, 8 * GIB, MIN_API_VERSION),
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, 2 * GIB, MIN_API_VERSION),
        ];
        assert_eq!(select_hardware(&adapters), Some(1));
    }

    #[test]
    fn largest_dedicated_memory_wins() {
        let adapters = [
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, 4 * GIB, MIN_API_VERSION),
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, 12 * GIB, MIN_API_VERSION),
            adapter(vk::PhysicalDeviceType::INTEGRATED_GPU, 6 * GIB, MIN_API_VERSION),
        ];
        assert_eq!(select_hardware(&adapters), Some(1));
    }

    #[test]
    fn old_api_version_is_filtered() {
        let adapters = [
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, 8 * GIB, vk::API_VERSION_1_1),
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, 2 * GIB, MIN_API_VERSION),
        ];
        assert_eq!(select_hardware(&adapters), Some(1));
    }

    #[test]
    fn zero_dedicated_memory_never_qualifies() {
        let adapters = [adapter(
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            0,
            MIN_API_VERSION,
        )];
        assert_eq!(select_hardware(&adapters), None);
    }

    #[test]
    fn missing_graphics_queue_is_filtered() {
        let mut compute_only = adapter(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            8 * GIB,
            MIN_API_VERSION,
        );
        compute_only.has_graphics_queue = false;
        assert_eq!(select_hardware(&[compute_only]), None);
    }

    #[test]
    fn no_candidates_yields_none() {
        assert_eq!(select_hardware(&[]), None);
        assert_eq!(select_software(&[]), None);
    }

    #[test]
    fn software_selection_only_considers_software() {
        let adapters = [
            adapter(vk::PhysicalDeviceType::DISCRETE_GPU, 8 * GIB, MIN_API_VERSION),
            adapter(vk::PhysicalDeviceType::CPU, 0, MIN_API_VERSION),
        ];
        assert_eq!(select_software(&adapters), Some(1));
    }

    #[test]
    fn vendor_names_follow_pci_ids() {
        let mut info = adapter(vk::PhysicalDeviceType::DISCRETE_GPU, GIB, MIN_API_VERSION);
        assert_eq!(info.vendor_name(), "amd");
        info.vendor_id = PCI_ID_NVIDIA;
        assert_eq!(info.vendor_name(), "nvidia");
        info.vendor_id = PCI_ID_INTEL;
        assert_eq!(info.vendor_name(), "intel");
        info.vendor_id = 0x1234;
        assert_eq!(info.vendor_name(), "unknown");
    }
}
