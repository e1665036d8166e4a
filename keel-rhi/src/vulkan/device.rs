//! Logical device, its queue and the object ownership trait.

use ash::{vk, Device, Instance};
use keel_core::log;
use parking_lot::{Mutex, MutexGuard};

use crate::vulkan::core::PhysicalDevice;
use crate::RhiResult;

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Crate-only trait for wrappers that own an `ash::Device` used to destroy them.
///
/// Implemented by `#[DeviceObject]`; sealed so it stays invisible outside `keel-rhi`.
pub(crate) trait DeviceObject: sealed::Sealed {
    fn device(&self) -> &Device;

    fn label(&self) -> &str {
        ""
    }
}

fn required_device_extensions() -> [*const std::ffi::c_char; 1] {
    [ash::khr::swapchain::NAME.as_ptr()]
}

/// Logical device with its single graphics/present queue.
///
/// Queue submission and idle waits require external synchronization, so the queue sits
/// behind a mutex and every use of it goes through [`LogicalDevice::queue`].
pub struct LogicalDevice {
    device: Device,
    queue: Mutex<vk::Queue>,
    queue_family: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    #[cfg(feature = "validation")]
    debug_utils: ash::ext::debug_utils::Device,
}

impl LogicalDevice {
    #[profiling::function]
    pub fn new(instance: &Instance, physical_device: &PhysicalDevice) -> RhiResult<Self> {
        let queue_priority = 1.0f32;
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(physical_device.queue_family())
            .queue_priorities(std::slice::from_ref(&queue_priority));

        let extensions = required_device_extensions();
        let features = vk::PhysicalDeviceFeatures::default().multi_draw_indirect(true);

        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut vulkan_13_features);

        let device = unsafe { instance.create_device(physical_device.handle(), &create_info, None)? };
        let queue = unsafe { device.get_device_queue(physical_device.queue_family(), 0) };
        log::info!("Logical device created on {}", physical_device.name());

        Ok(Self {
            #[cfg(feature = "validation")]
            debug_utils: ash::ext::debug_utils::Device::new(instance, &device),
            device,
            queue: Mutex::new(queue),
            queue_family: physical_device.queue_family(),
            memory_properties: *physical_device.memory_properties(),
        })
    }

    #[inline]
    pub fn handle(&self) -> &Device {
        &self.device
    }

    /// Exclusive access to the queue.
    #[inline]
    pub fn queue(&self) -> MutexGuard<'_, vk::Queue> {
        self.queue.lock()
    }

    #[inline]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    #[inline]
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn wait_idle(&self) -> RhiResult<()> {
        let _queue = self.queue();
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Find a memory type allowed by `type_filter` with all of `properties`.
    pub fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&index| {
            let memory_type = self.memory_properties.memory_types[index as usize];
            type_filter & (1 << index) != 0 && memory_type.property_flags.contains(properties)
        })
    }

    /// Allocate and bind memory for `requirements`.
    pub fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> RhiResult<vk::DeviceMemory> {
        let memory_type_index = self
            .find_memory_type(requirements.memory_type_bits, properties)
            .ok_or(crate::RhiError::OutOfMemory)?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => Ok(memory),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(crate::RhiError::OutOfMemory)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Attach a debug name visible in validation messages and capture tools.
    #[allow(unused_variables)]
    pub fn set_debug_name<H: vk::Handle>(&self, handle: H, name: &str) {
        #[cfg(feature = "validation")]
        {
            let Ok(name) = std::ffi::CString::new(name) else {
                return;
            };
            let info = vk::DebugUtilsObjectNameInfoEXT::default()
                .object_handle(handle)
                .object_name(&name);
            if let Err(err) = unsafe { self.debug_utils.set_debug_utils_object_name(&info) } {
                log::trace!("set_debug_utils_object_name failed: {err}");
            }
        }
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                log::error!("Idle wait before device destruction failed: {err}");
            }
            self.device.destroy_device(None);
        }
    }
}
