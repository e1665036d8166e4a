use ash::vk;
use keel_rhi_derive::DeviceObject;

use crate::vulkan::device::{DeviceObject, LogicalDevice};
use crate::RhiResult;

#[DeviceObject]
pub struct VulkanFence {
    fence: vk::Fence,
}

impl VulkanFence {
    pub fn new(device: &LogicalDevice, signaled: bool) -> RhiResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            device
                .handle()
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        };
        Ok(Self {
            fence,
            device: device.handle().clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device().destroy_fence(self.fence, None) };
    }
}

#[DeviceObject]
pub struct VulkanSemaphore {
    semaphore: vk::Semaphore,
}

impl VulkanSemaphore {
    pub fn new(device: &LogicalDevice) -> RhiResult<Self> {
        let semaphore = unsafe {
            device
                .handle()
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        };
        Ok(Self {
            semaphore,
            device: device.handle().clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        unsafe { self.device().destroy_semaphore(self.semaphore, None) };
    }
}
