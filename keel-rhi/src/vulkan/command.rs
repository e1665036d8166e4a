//! Command streams and the blocking immediate encoder.

use std::time::Duration;

use ash::vk;
use keel_core::log;
use keel_rhi_derive::DeviceObject;
use parking_lot::Mutex;

use crate::vulkan::buffer::VulkanBuffer;
use crate::vulkan::device::{DeviceObject, LogicalDevice};
use crate::{RhiError, RhiResult};

/// Upper bound for blocking uploads. Reaching it means the queue is hung.
const IMMEDIATE_TIMEOUT: Duration = Duration::from_secs(5);

fn create_pool(device: &LogicalDevice, flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool, vk::Result> {
    let create_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(device.queue_family())
        .flags(flags);
    unsafe { device.handle().create_command_pool(&create_info, None) }
}

fn allocate_primary(device: &ash::Device, pool: vk::CommandPool) -> Result<vk::CommandBuffer, vk::Result> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
    buffers.first().copied().ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
}

/// Recording state that depends on the output image.
#[derive(Debug)]
pub(crate) struct StreamState {
    /// Output image this stream renders to, fixed at `begin`.
    pub image_index: Option<u32>,
    /// Layout the output image was last transitioned to in this stream.
    pub surface_layout: vk::ImageLayout,
}

/// One primary command buffer with its own pool, reset on every `begin`.
#[DeviceObject]
pub struct VulkanCommandStream {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    pub(crate) state: Mutex<StreamState>,
}

impl VulkanCommandStream {
    pub fn new(device: &LogicalDevice) -> RhiResult<Self> {
        let raw = device.handle();
        let pool = create_pool(device, vk::CommandPoolCreateFlags::TRANSIENT)?;
        let buffer = match allocate_primary(raw, pool) {
            Ok(buffer) => buffer,
            Err(err) => {
                unsafe { raw.destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            pool,
            buffer,
            state: Mutex::new(StreamState {
                image_index: None,
                surface_layout: vk::ImageLayout::UNDEFINED,
            }),
            device: raw.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn begin(&self, image_index: Option<u32>) -> RhiResult<()> {
        unsafe {
            self.device()
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device().begin_command_buffer(self.buffer, &begin_info)?;
        }
        let mut state = self.state.lock();
        state.image_index = image_index;
        state.surface_layout = vk::ImageLayout::UNDEFINED;
        Ok(())
    }

    pub fn end(&self) -> RhiResult<()> {
        unsafe { self.device().end_command_buffer(self.buffer)? };
        Ok(())
    }
}

impl Drop for VulkanCommandStream {
    fn drop(&mut self) {
        unsafe { self.device().destroy_command_pool(self.pool, None) };
    }
}

/// Records a one-off command buffer, submits it and blocks until the GPU finishes.
///
/// Used for blocking uploads and one-time layout transitions.
#[DeviceObject]
pub struct ImmediateEncoder {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    lock: Mutex<()>,
}

impl ImmediateEncoder {
    pub fn new(device: &LogicalDevice) -> RhiResult<Self> {
        let raw = device.handle();
        let pool = create_pool(device, vk::CommandPoolCreateFlags::TRANSIENT)?;
        let created = allocate_primary(raw, pool)
            .and_then(|cmd| unsafe { raw.create_fence(&vk::FenceCreateInfo::default(), None) }.map(|fence| (cmd, fence)));
        let (cmd, fence) = match created {
            Ok(created) => created,
            Err(err) => {
                unsafe { raw.destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            pool,
            cmd,
            fence,
            lock: Mutex::new(()),
            device: raw.clone(),
        })
    }

    #[profiling::function]
    pub fn submit_and_wait<F>(&self, device: &LogicalDevice, record: F) -> RhiResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let _guard = self.lock.lock();
        let raw = self.device();

        let cmd = self.cmd;
        unsafe {
            raw.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            raw.begin_command_buffer(cmd, &begin_info)?;
        }
        record(raw, cmd);
        unsafe { raw.end_command_buffer(cmd)? };

        let cmd_info = vk::CommandBufferSubmitInfo::default().command_buffer(cmd);
        let submit_info = vk::SubmitInfo2::default().command_buffer_infos(std::slice::from_ref(&cmd_info));
        {
            let queue = device.queue();
            unsafe { raw.queue_submit2(*queue, &[submit_info], self.fence)? };
        }

        let waited = unsafe { raw.wait_for_fences(&[self.fence], true, IMMEDIATE_TIMEOUT.as_nanos() as u64) };
        match waited {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                log::error!("Immediate submission did not finish within {IMMEDIATE_TIMEOUT:?}");
                return Err(RhiError::DeviceLost);
            }
            Err(err) => return Err(err.into()),
        }
        unsafe { raw.reset_fences(&[self.fence])? };
        Ok(())
    }

    /// Copy `data` into `dst` at `offset` through a temporary staging buffer.
    pub fn upload_buffer(&self, device: &LogicalDevice, dst: &VulkanBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let staging = VulkanBuffer::staging(device, "staging.immediate", data.len() as u64)?;
        staging.write(0, data)?;
        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(offset)
            .size(data.len() as u64);
        self.submit_and_wait(device, |raw, cmd| unsafe {
            raw.cmd_copy_buffer(cmd, staging.handle(), dst.handle(), &[region]);
        })
    }
}

impl Drop for ImmediateEncoder {
    fn drop(&mut self) {
        unsafe {
            self.device().destroy_fence(self.fence, None);
            self.device().destroy_command_pool(self.pool, None);
        }
    }
}
