//! Resource handles, descriptors and the tables that map handles to native objects.

use std::sync::atomic::{AtomicU64, Ordering};

use enumflags2::BitFlags;
use keel_core::collections::HashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::backend::RenderBackend;

macro_rules! resource_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Reserved handle meaning "no resource"; the fallback is used in its place.
            pub const NONE: $name = $name(0);

            #[inline]
            pub fn is_none(self) -> bool {
                self.0 == 0
            }

            #[inline]
            pub fn raw(self) -> u64 {
                self.0
            }

            #[cfg(test)]
            pub(crate) fn from_raw(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

resource_handle!(
    /// Opaque identifier of a GPU buffer.
    BufferHandle
);
resource_handle!(
    /// Opaque identifier of a GPU texture (image, views and sampler).
    TextureHandle
);

#[enumflags2::bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex = 1 << 0,
    Index = 1 << 1,
    Uniform = 1 << 2,
    Storage = 1 << 3,
    Indirect = 1 << 4,
    TransferSrc = 1 << 5,
    TransferDst = 1 << 6,
}

/// Where buffer memory lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// GPU-only; written through the transient arena or a blocking upload.
    #[default]
    DeviceLocal,
    /// Persistently mapped, coherent; written directly by the CPU.
    HostVisible,
}

/// Buffer descriptor for creating GPU buffers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub name: String,
    /// Size of the buffer in bytes.
    pub size: u64,
    pub usage: BitFlags<BufferUsage>,
    pub location: MemoryLocation,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            name: "Unnamed buffer".to_string(),
            size: 0,
            usage: BitFlags::empty(),
            location: MemoryLocation::DeviceLocal,
        }
    }
}

impl BufferDesc {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            size,
            ..Default::default()
        }
    }

    pub fn vertex(name: &str, size: u64) -> Self {
        Self::new(name, size).with_usage(BufferUsage::Vertex | BufferUsage::TransferDst)
    }

    pub fn index(name: &str, size: u64) -> Self {
        Self::new(name, size).with_usage(BufferUsage::Index | BufferUsage::TransferDst)
    }

    /// Host-visible uniform buffer.
    pub fn uniform(name: &str, size: u64) -> Self {
        Self::new(name, size)
            .with_usage(BufferUsage::Uniform)
            .host_visible()
    }

    pub fn storage(name: &str, size: u64) -> Self {
        Self::new(name, size).with_usage(BufferUsage::Storage | BufferUsage::TransferDst)
    }

    /// Per-instance data read by the vertex stage from a storage buffer.
    pub fn instance(name: &str, size: u64) -> Self {
        Self::storage(name, size)
    }

    pub fn indirect(name: &str, size: u64) -> Self {
        Self::new(name, size).with_usage(BufferUsage::Indirect | BufferUsage::TransferDst)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_usage(mut self, usage: impl Into<BitFlags<BufferUsage>>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn with_additional_usage(mut self, usage: impl Into<BitFlags<BufferUsage>>) -> Self {
        self.usage |= usage.into();
        self
    }

    pub fn host_visible(mut self) -> Self {
        self.location = MemoryLocation::HostVisible;
        self
    }

    pub fn device_local(mut self) -> Self {
        self.location = MemoryLocation::DeviceLocal;
        self
    }

    #[inline]
    pub fn is_host_visible(&self) -> bool {
        self.location == MemoryLocation::HostVisible
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    #[default]
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Srgb,
    R8Unorm,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u64 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8Srgb
            | TextureFormat::Bgra8Srgb
            | TextureFormat::Rg16Float
            | TextureFormat::R32Float
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }

    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }
}

#[enumflags2::bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureUsage {
    Sampled = 1 << 0,
    ColorAttachment = 1 << 1,
    DepthAttachment = 1 << 2,
    Storage = 1 << 3,
    TransferDst = 1 << 4,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    Repeat,
    ClampToEdge,
}

/// Sampler state baked into a texture at creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: FilterMode,
    pub address_mode: AddressMode,
    /// Depth comparison sampling (shadow maps).
    pub compare: bool,
}

impl SamplerDesc {
    pub fn clamped() -> Self {
        Self {
            address_mode: AddressMode::ClampToEdge,
            ..Default::default()
        }
    }

    pub fn shadow() -> Self {
        Self {
            filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
            compare: true,
        }
    }
}

/// Texture descriptor for creating GPU textures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub name: String,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub array_layers: u32,
    pub usage: BitFlags<TextureUsage>,
    pub sampler: SamplerDesc,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            format: TextureFormat::Rgba8Unorm,
            width: 1,
            height: 1,
            array_layers: 1,
            usage: TextureUsage::Sampled | TextureUsage::TransferDst,
            sampler: SamplerDesc::default(),
        }
    }
}

impl TextureDesc {
    /// Sampled 2D texture filled by uploads.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            format,
            width,
            height,
            ..Default::default()
        }
    }

    pub fn new_2d_array(width: u32, height: u32, layers: u32, format: TextureFormat) -> Self {
        Self {
            array_layers: layers,
            ..Self::new_2d(width, height, format)
        }
    }

    /// Render target that later passes sample.
    pub fn new_color_attachment(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            usage: TextureUsage::ColorAttachment | TextureUsage::Sampled,
            sampler: SamplerDesc::clamped(),
            ..Self::new_2d(width, height, format)
        }
    }

    pub fn new_depth_attachment(width: u32, height: u32) -> Self {
        Self {
            usage: TextureUsage::DepthAttachment | TextureUsage::Sampled,
            sampler: SamplerDesc::clamped(),
            ..Self::new_2d(width, height, TextureFormat::Depth32Float)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_usage(mut self, usage: impl Into<BitFlags<TextureUsage>>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerDesc) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }

    /// Bytes a full upload of every layer must provide.
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.array_layers as u64 * self.format.bytes_per_texel()
    }
}

pub struct BufferRecord<B: RenderBackend> {
    pub native: B::Buffer,
    pub desc: BufferDesc,
}

pub struct TextureRecord<B: RenderBackend> {
    pub native: B::Image,
    pub desc: TextureDesc,
}

/// Handle to record maps for buffers and textures.
///
/// Lock order when both are needed: buffers, then textures.
pub struct ResourceTables<B: RenderBackend> {
    next_handle: AtomicU64,
    buffers: Mutex<HashMap<BufferHandle, BufferRecord<B>>>,
    textures: Mutex<HashMap<TextureHandle, TextureRecord<B>>>,
}

impl<B: RenderBackend> Default for ResourceTables<B> {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::default()),
            textures: Mutex::new(HashMap::default()),
        }
    }
}

impl<B: RenderBackend> ResourceTables<B> {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_raw(&self) -> u64 {
        // Shared by both tables; never wraps in practice and never yields 0.
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert_buffer(&self, record: BufferRecord<B>) -> BufferHandle {
        let handle = BufferHandle(self.next_raw());
        self.buffers.lock().insert(handle, record);
        handle
    }

    pub fn insert_texture(&self, record: TextureRecord<B>) -> TextureHandle {
        let handle = TextureHandle(self.next_raw());
        self.textures.lock().insert(handle, record);
        handle
    }

    pub fn remove_buffer(&self, handle: BufferHandle) -> Option<BufferRecord<B>> {
        if handle.is_none() {
            return None;
        }
        self.buffers.lock().remove(&handle)
    }

    pub fn remove_texture(&self, handle: TextureHandle) -> Option<TextureRecord<B>> {
        if handle.is_none() {
            return None;
        }
        self.textures.lock().remove(&handle)
    }

    #[inline]
    pub fn buffers(&self) -> MutexGuard<'_, HashMap<BufferHandle, BufferRecord<B>>> {
        self.buffers.lock()
    }

    #[inline]
    pub fn textures(&self) -> MutexGuard<'_, HashMap<TextureHandle, TextureRecord<B>>> {
        self.textures.lock()
    }

    pub fn buffer_desc(&self, handle: BufferHandle) -> Option<BufferDesc> {
        self.buffers.lock().get(&handle).map(|record| record.desc.clone())
    }

    pub fn texture_desc(&self, handle: TextureHandle) -> Option<TextureDesc> {
        self.textures.lock().get(&handle).map(|record| record.desc.clone())
    }

    pub fn contains_buffer(&self, handle: BufferHandle) -> bool {
        self.buffers.lock().contains_key(&handle)
    }

    pub fn contains_texture(&self, handle: TextureHandle) -> bool {
        self.textures.lock().contains_key(&handle)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.lock().len()
    }

    /// Take every live record (shutdown).
    pub fn drain(&self) -> (Vec<BufferRecord<B>>, Vec<TextureRecord<B>>) {
        let buffers = self.buffers.lock().drain().map(|(_, record)| record).collect();
        let textures = self.textures.lock().drain().map(|(_, record)| record).collect();
        (buffers, textures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;

    type Tables = ResourceTables<HeadlessBackend>;

    fn buffer_record(backend: &HeadlessBackend, size: u64) -> BufferRecord<HeadlessBackend> {
        let desc = BufferDesc::vertex("test", size);
        BufferRecord {
            native: backend.create_buffer(&desc).unwrap(),
            desc,
        }
    }

    #[test]
    fn handles_are_unique_across_tables_and_never_zero() {
        let backend = HeadlessBackend::new();
        let tables = Tables::new();
        let a = tables.insert_buffer(buffer_record(&backend, 16));
        let desc = TextureDesc::new_2d(4, 4, TextureFormat::Rgba8Unorm);
        let t = tables.insert_texture(TextureRecord {
            native: backend.create_image(&desc).unwrap(),
            desc,
        });
        let b = tables.insert_buffer(buffer_record(&backend, 16));

        assert!(!a.is_none() && !t.is_none() && !b.is_none());
        assert!(a.raw() < t.raw() && t.raw() < b.raw());
    }

    #[test]
    fn removed_handles_are_not_reissued() {
        let backend = HeadlessBackend::new();
        let tables = Tables::new();
        let a = tables.insert_buffer(buffer_record(&backend, 16));
        assert!(tables.remove_buffer(a).is_some());
        assert!(tables.remove_buffer(a).is_none());
        assert!(!tables.contains_buffer(a));

        let b = tables.insert_buffer(buffer_record(&backend, 16));
        assert_ne!(a, b);
    }

    #[test]
    fn none_handle_is_never_present() {
        let tables = Tables::new();
        assert!(tables.remove_buffer(BufferHandle::NONE).is_none());
        assert!(tables.remove_texture(TextureHandle::NONE).is_none());
        assert!(tables.buffer_desc(BufferHandle::NONE).is_none());
    }

    #[test]
    fn descriptor_builders() {
        let desc = BufferDesc::uniform("globals", 256);
        assert!(desc.is_host_visible());
        assert!(desc.usage.contains(BufferUsage::Uniform));

        let vertex = BufferDesc::vertex("mesh", 64).with_additional_usage(BufferUsage::Storage);
        assert!(!vertex.is_host_visible());
        assert!(vertex.usage.contains(BufferUsage::Vertex | BufferUsage::Storage));

        let shadow = TextureDesc::new_2d_array(1024, 1024, 4, TextureFormat::Depth32Float);
        assert_eq!(shadow.byte_size(), 1024 * 1024 * 4 * 4);
        assert!(shadow.format.is_depth());
    }
}
