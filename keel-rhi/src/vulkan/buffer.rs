//! GPU buffers and host-visible staging memory.

use ash::vk;
use enumflags2::BitFlags;
use keel_core::log;
use keel_rhi_derive::DeviceObject;

use crate::resource::{BufferDesc, BufferUsage, MemoryLocation};
use crate::vulkan::device::{DeviceObject, LogicalDevice};
use crate::{RhiError, RhiResult};

fn usage_to_vk(usage: BitFlags<BufferUsage>) -> vk::BufferUsageFlags {
    usage.iter().fold(vk::BufferUsageFlags::empty(), |flags, usage| {
        flags
            | match usage {
                BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
                BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
                BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
                BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
                BufferUsage::Indirect => vk::BufferUsageFlags::INDIRECT_BUFFER,
                BufferUsage::TransferSrc => vk::BufferUsageFlags::TRANSFER_SRC,
                BufferUsage::TransferDst => vk::BufferUsageFlags::TRANSFER_DST,
            }
    })
}

fn memory_flags(location: MemoryLocation) -> vk::MemoryPropertyFlags {
    match location {
        MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        MemoryLocation::HostVisible => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    }
}

/// Buffer with its own memory allocation.
#[DeviceObject(label = "name")]
pub struct VulkanBuffer {
    name: String,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    host_visible: bool,
}

impl VulkanBuffer {
    pub fn new(device: &LogicalDevice, desc: &BufferDesc) -> RhiResult<Self> {
        // Device-local buffers are always filled through copies.
        let mut usage = usage_to_vk(desc.usage);
        if !desc.is_host_visible() {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        Self::create(device, &desc.name, desc.size, usage, memory_flags(desc.location))
    }

    /// Host-visible transfer source.
    pub fn staging(device: &LogicalDevice, name: &str, size: u64) -> RhiResult<Self> {
        Self::create(
            device,
            name,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            memory_flags(MemoryLocation::HostVisible),
        )
    }

    fn create(
        device: &LogicalDevice,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> RhiResult<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = device.handle();
        let buffer = unsafe { raw.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
        let memory = match device.allocate(requirements, memory_flags) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { raw.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };
        if let Err(err) = unsafe { raw.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                raw.destroy_buffer(buffer, None);
                raw.free_memory(memory, None);
            }
            return Err(err.into());
        }

        device.set_debug_name(buffer, name);
        log::trace!("buffer '{name}' created ({size} bytes)");

        Ok(Self {
            name: name.to_owned(),
            buffer,
            memory,
            size,
            host_visible: memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            device: raw.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy `data` to `offset` through a temporary mapping.
    pub fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.host_visible {
            return Err(RhiError::Backend(format!("buffer '{}' is not host visible", self.name)));
        }
        let in_range = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= self.size);
        if !in_range {
            return Err(RhiError::Backend(format!(
                "write of {} bytes at {offset} outside buffer '{}'",
                data.len(),
                self.name
            )));
        }

        // SAFETY: the range is checked above and the mapping is limited to `data.len()`.
        unsafe {
            let ptr = self.device.map_memory(
                self.memory,
                offset,
                data.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
    }
}

/// Host-visible staging buffer mapped for its whole lifetime.
pub struct VulkanStaging {
    buffer: VulkanBuffer,
    mapped: std::ptr::NonNull<u8>,
}

// SAFETY: the mapping is owned by this value and only written through `write`, which the
// backend serializes per staging buffer (one ring slot owns it).
unsafe impl Send for VulkanStaging {}
unsafe impl Sync for VulkanStaging {}

impl VulkanStaging {
    pub fn new(device: &LogicalDevice, capacity: u64) -> RhiResult<Self> {
        let buffer = VulkanBuffer::staging(device, "staging.transient", capacity)?;
        let ptr = unsafe {
            device
                .handle()
                .map_memory(buffer.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        let mapped = std::ptr::NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| RhiError::Backend("staging memory mapped to null".to_owned()))?;
        Ok(Self { buffer, mapped })
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.buffer.size()
    }

    /// Copy `data` to `offset`. Out-of-range writes are dropped and logged.
    pub fn write(&self, offset: u64, data: &[u8]) {
        let in_range = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= self.capacity());
        if !in_range {
            log::error!("staging write of {} bytes at {offset} exceeds {}", data.len(), self.capacity());
            return;
        }
        // SAFETY: the range lies inside the mapped allocation, and memory is host coherent.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.mapped.as_ptr().add(offset as usize), data.len());
        }
    }
}

impl Drop for VulkanStaging {
    fn drop(&mut self) {
        unsafe { self.buffer.device().unmap_memory(self.buffer.memory) };
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device().destroy_buffer(self.buffer, None);
            self.device().free_memory(self.memory, None);
        }
        log::trace!("buffer '{}' destroyed", self.label());
    }
}
