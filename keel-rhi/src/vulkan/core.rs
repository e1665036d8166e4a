//! Vulkan instance, debug messenger and physical device selection.

use std::ffi::CStr;

use ash::{vk, Entry, Instance};
use keel_core::log;
use raw_window_handle::{HasDisplayHandle, RawDisplayHandle};
use winit::window::Window;

use crate::vulkan::swapchain::SurfaceWindow;
use crate::{RhiError, RhiResult};

#[cfg(feature = "validation")]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const SCORE_DISCRETE_GPU: u32 = 10000;
const SCORE_INTEGRATED_GPU: u32 = 1000;
const SCORE_PER_GB_VRAM: u32 = 100;
const SCORE_VULKAN_1_4: u32 = 600;
const SCORE_VULKAN_1_3: u32 = 400;

#[derive(Clone)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    name: String,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_family: u32,
}

impl PhysicalDevice {
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Family of the queue used for graphics, transfers and presentation.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }
}

/// Entry point and instance. Outlives every other Vulkan object.
pub struct VulkanCore {
    entry: Entry,
    instance: Instance,

    #[cfg(feature = "validation")]
    debug_utils: ash::ext::debug_utils::Instance,
    #[cfg(feature = "validation")]
    debug_messenger: vk::DebugUtilsMessengerEXT,
}

impl VulkanCore {
    #[profiling::function]
    pub fn new(window: &Window) -> RhiResult<Self> {
        let entry = unsafe { Entry::load()? };
        let display_handle = window
            .display_handle()
            .map_err(|err| RhiError::Surface(err.to_string()))?
            .as_raw();

        let instance = create_instance(&entry, display_handle)?;

        #[cfg(feature = "validation")]
        let (debug_utils, debug_messenger) = match setup_debug_messenger(&entry, &instance) {
            Ok(messenger) => messenger,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            entry,
            instance,
            #[cfg(feature = "validation")]
            debug_utils,
            #[cfg(feature = "validation")]
            debug_messenger,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for VulkanCore {
    fn drop(&mut self) {
        unsafe {
            #[cfg(feature = "validation")]
            self.debug_utils.destroy_debug_utils_messenger(self.debug_messenger, None);

            self.instance.destroy_instance(None);
        }
    }
}

fn required_instance_extensions(display_handle: RawDisplayHandle) -> RhiResult<Vec<*const std::ffi::c_char>> {
    let mut extensions = ash_window::enumerate_required_extensions(display_handle)?.to_vec();

    #[cfg(feature = "validation")]
    extensions.push(ash::ext::debug_utils::NAME.as_ptr());

    Ok(extensions)
}

fn create_instance(entry: &Entry, display_handle: RawDisplayHandle) -> RhiResult<Instance> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(c"Keel Sandbox")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Keel")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extensions = required_instance_extensions(display_handle)?;

    #[cfg(feature = "validation")]
    let layers = [VALIDATION_LAYER.as_ptr()];

    #[allow(unused_mut)]
    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions);

    #[cfg(feature = "validation")]
    {
        create_info = create_info.enabled_layer_names(&layers);
    }

    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

#[cfg(feature = "validation")]
fn setup_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT), vk::Result> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
    Ok((debug_utils, messenger))
}

#[cfg(feature = "validation")]
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };
    if callback_data.p_message.is_null() {
        return vk::FALSE;
    }
    let message = unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::debug!("Vulkan {}: {}", type_str, message),
        _ => log::trace!("Vulkan {}: {}", type_str, message),
    }

    vk::FALSE
}

/// A family supporting both graphics and presentation to `surface`.
fn find_queue_family(instance: &Instance, physical_device: vk::PhysicalDevice, surface: &SurfaceWindow) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = unsafe {
            surface
                .loader()
                .get_physical_device_surface_support(physical_device, index, surface.handle())
                .unwrap_or(false)
        };
        (graphics && present).then_some(index)
    })
}

fn score_physical_device(
    properties: &vk::PhysicalDeviceProperties,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> u32 {
    // Dynamic rendering and synchronization2 are core in 1.3.
    if properties.api_version < vk::API_VERSION_1_3 {
        return 0;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => SCORE_DISCRETE_GPU,
        vk::PhysicalDeviceType::INTEGRATED_GPU => SCORE_INTEGRATED_GPU,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 500,
        vk::PhysicalDeviceType::CPU => 100,
        _ => 10,
    };

    score += if properties.api_version >= vk::make_api_version(0, 1, 4, 0) {
        SCORE_VULKAN_1_4
    } else {
        SCORE_VULKAN_1_3
    };

    let vram_bytes: u64 = memory_properties.memory_heaps[..memory_properties.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();
    score + (vram_bytes / (1024 * 1024 * 1024)) as u32 * SCORE_PER_GB_VRAM
}

pub fn select_physical_device(instance: &Instance, surface: &SurfaceWindow) -> RhiResult<PhysicalDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    let mut best: Option<(u32, PhysicalDevice)> = None;
    for device in physical_devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some(queue_family) = find_queue_family(instance, device, surface) else {
            log::info!("Skipping GPU {name}: no graphics queue that can present");
            continue;
        };
        let score = score_physical_device(&properties, &memory_properties);
        log::info!("Found GPU: {} (score: {}, type: {:?})", name, score, properties.device_type);

        if score > 0 && best.as_ref().is_none_or(|(best_score, _)| score > *best_score) {
            best = Some((
                score,
                PhysicalDevice {
                    handle: device,
                    name,
                    properties,
                    memory_properties,
                    queue_family,
                },
            ));
        }
    }

    best.map(|(_, device)| device).ok_or(RhiError::NoSuitableGpu)
}
