//! Pipeline variants and the uniform records copied verbatim into GPU memory.
//!
//! Shader compilation and fixed-function state live outside this crate. A pipeline is an
//! opaque object registered on the backend under a [`PipelineVariant`]; the records below
//! are plain data whose contents the core never interprets.

use bytemuck::{Pod, Zeroable};

use crate::pass::PassKind;

/// Fixed-function + shader combination selected per draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineVariant {
    Opaque,
    Textured,
    Transparent,
    Skybox,
    ShadowCaster,
    GeometryNormals,
    AmbientOcclusion,
    UiQuad,
    UiText,
}

impl PipelineVariant {
    pub const ALL: [PipelineVariant; 9] = [
        PipelineVariant::Opaque,
        PipelineVariant::Textured,
        PipelineVariant::Transparent,
        PipelineVariant::Skybox,
        PipelineVariant::ShadowCaster,
        PipelineVariant::GeometryNormals,
        PipelineVariant::AmbientOcclusion,
        PipelineVariant::UiQuad,
        PipelineVariant::UiText,
    ];

    /// The only pass whose attachments this pipeline was built against.
    pub fn pass(self) -> PassKind {
        match self {
            PipelineVariant::Opaque
            | PipelineVariant::Textured
            | PipelineVariant::Transparent
            | PipelineVariant::Skybox => PassKind::Main,
            PipelineVariant::ShadowCaster => PassKind::Shadow,
            PipelineVariant::GeometryNormals => PassKind::Geometry,
            PipelineVariant::AmbientOcclusion => PassKind::AmbientOcclusion,
            PipelineVariant::UiQuad | PipelineVariant::UiText => PassKind::Ui,
        }
    }
}

/// Upper bound on shadow cascades the per-slot uniform buffer reserves room for.
pub const MAX_SHADOW_CASCADES: usize = 8;

/// Per-frame parameters shared by every pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GlobalUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    pub sun_direction: [f32; 4],
    pub sun_color: [f32; 4],
    pub ambient_color: [f32; 4],
    /// x, y: framebuffer size; z, w: reciprocal.
    pub screen_size: [f32; 4],
    /// x: seconds since start, y: frame delta.
    pub time: [f32; 4],
}

/// Per-cascade shadow parameters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CascadeUniforms {
    pub light_view_projection: [[f32; 4]; 4],
    /// x: far split depth of the cascade.
    pub split: [f32; 4],
}

/// Per-draw parameters, recorded as push constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ModelUniforms {
    pub model: [[f32; 4]; 4],
    pub color: [f32; 4],
}

/// Layout of the per-slot uniform buffer: globals followed by the cascade array.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub global: GlobalUniforms,
    pub cascades: [CascadeUniforms; MAX_SHADOW_CASCADES],
}

impl FrameUniforms {
    pub const SIZE: u64 = std::mem::size_of::<FrameUniforms>() as u64;
}

/// Push constant range size every pipeline layout must reserve.
pub const MODEL_PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<ModelUniforms>() as u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_a_pass() {
        let shadow: Vec<_> = PipelineVariant::ALL
            .iter()
            .filter(|variant| variant.pass() == PassKind::Shadow)
            .collect();
        assert_eq!(shadow, [&PipelineVariant::ShadowCaster]);
        assert_eq!(PipelineVariant::UiText.pass(), PassKind::Ui);
    }

    #[test]
    fn push_constants_fit_guaranteed_limit() {
        // 128 bytes is the minimum maxPushConstantsSize every Vulkan device supports.
        assert!(MODEL_PUSH_CONSTANT_SIZE <= 128);
    }

    #[test]
    fn uniform_records_are_16_byte_multiples() {
        assert_eq!(std::mem::size_of::<GlobalUniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<CascadeUniforms>() % 16, 0);
        assert_eq!(FrameUniforms::SIZE % 16, 0);
    }
}
