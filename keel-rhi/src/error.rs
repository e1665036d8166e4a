//! RHI error types.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the render hardware interface.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Failed to load the Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface creation or query error
    #[error("Surface error: {0}")]
    Surface(String),

    /// Swapchain creation error
    #[error("Swapchain error: {0}")]
    Swapchain(String),

    /// Host or device memory exhausted
    #[error("Out of memory")]
    OutOfMemory,

    /// A ring slot fence did not signal within the bounded wait.
    #[error("GPU hang: fence of ring slot {slot} not signaled after {timeout:?}")]
    GpuHang { slot: usize, timeout: Duration },

    /// The device is no longer usable (a previous fence wait timed out).
    #[error("Device lost")]
    DeviceLost,

    /// Rejected configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend-specific failure
    #[error("Backend error: {0}")]
    Backend(String),
}

impl RhiError {
    /// Whether this error leaves the GPU in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RhiError::GpuHang { .. } | RhiError::DeviceLost)
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
