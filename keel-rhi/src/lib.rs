//! Keel RHI (Render Hardware Interface) - frame and resource lifecycle.
//!
//! [`RenderDevice`] paces frames over a ring of slots, orchestrates render passes, stages
//! uploads through per-slot transient arenas, defers destruction until the GPU is done with
//! an object, keeps size-dependent surface resources coherent and keeps every slot's binding
//! table in sync. It is generic over a [`RenderBackend`]: [`vulkan::VulkanBackend`] drives a
//! real GPU through ash, [`headless::HeadlessBackend`] simulates one.

pub mod backend;
pub mod binding;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod headless;
pub mod pass;
pub mod pipeline;
pub mod resource;
pub mod surface;
pub mod upload;
pub mod vulkan;
mod defer_release;
mod synchronization;

pub use backend::{Extent2D, RenderBackend, Viewport};
pub use binding::{BindingPoint, BindingSource};
pub use config::{FatalHandler, RhiConfig};
pub use device::RenderDevice;
pub use error::{RhiError, RhiResult};
pub use frame::{FrameInfo, FrameStatus, SkipReason};
pub use pass::{ActivePass, PassKind, PassState};
pub use pipeline::{CascadeUniforms, FrameUniforms, GlobalUniforms, ModelUniforms, PipelineVariant};
pub use resource::{
    AddressMode, BufferDesc, BufferHandle, BufferUsage, FilterMode, MemoryLocation, SamplerDesc, TextureDesc,
    TextureFormat, TextureHandle, TextureUsage,
};
pub use surface::SurfaceStamp;
pub use upload::ArenaFull;
