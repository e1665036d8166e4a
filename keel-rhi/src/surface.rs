//! Output surface and every object whose size follows it.
//!
//! A surface generation owns the depth, normal and ambient occlusion images plus the render
//! targets built on them. It is rebuilt as a whole, never patched: targets are destroyed
//! before the images they reference, images are created before the targets that use them,
//! and every group is stamped with the generation it belongs to. The shadow cascades do not
//! depend on the window size and live outside generations.

use keel_core::log;

use crate::backend::{ColorTarget, DepthTarget, Extent2D, LoadOp, RenderBackend, RenderTargetDesc};
use crate::pass::{ActivePass, PassKind};
use crate::resource::{SamplerDesc, TextureDesc, TextureFormat};
use crate::RhiResult;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SurfaceStamp {
    pub generation: u64,
    pub extent: Extent2D,
}

/// Size-dependent images of one generation.
pub struct SurfaceImages<B: RenderBackend> {
    pub stamp: SurfaceStamp,
    pub depth: B::Image,
    pub normal: B::Image,
    pub ambient_occlusion: B::Image,
}

/// Render targets of one generation.
pub struct SurfaceTargets<B: RenderBackend> {
    pub stamp: SurfaceStamp,
    pub main: B::RenderTarget,
    pub geometry: B::RenderTarget,
    pub ambient_occlusion: B::RenderTarget,
    pub ui: B::RenderTarget,
}

pub struct SurfaceGeneration<B: RenderBackend> {
    pub images: SurfaceImages<B>,
    pub targets: SurfaceTargets<B>,
}

impl<B: RenderBackend> SurfaceGeneration<B> {
    fn create(backend: &B, stamp: SurfaceStamp) -> RhiResult<Self> {
        let images = create_images(backend, stamp)?;
        match create_targets(backend, &images, stamp) {
            Ok(targets) => Ok(Self { images, targets }),
            Err(err) => {
                destroy_images(backend, images);
                Err(err)
            }
        }
    }

    fn destroy(self, backend: &B) {
        let SurfaceGeneration { images, targets } = self;
        backend.destroy_render_target(targets.ui);
        backend.destroy_render_target(targets.ambient_occlusion);
        backend.destroy_render_target(targets.geometry);
        backend.destroy_render_target(targets.main);
        destroy_images(backend, images);
    }
}

fn create_images<B: RenderBackend>(backend: &B, stamp: SurfaceStamp) -> RhiResult<SurfaceImages<B>> {
    let Extent2D { width, height } = stamp.extent;
    let depth = backend.create_image(&TextureDesc::new_depth_attachment(width, height).with_name("scene_depth"))?;
    let normal = match backend.create_image(
        &TextureDesc::new_color_attachment(width, height, TextureFormat::Rgba16Float).with_name("scene_normal"),
    ) {
        Ok(image) => image,
        Err(err) => {
            backend.destroy_image(depth);
            return Err(err);
        }
    };
    let ambient_occlusion = match backend.create_image(
        &TextureDesc::new_color_attachment(width, height, TextureFormat::R8Unorm).with_name("ambient_occlusion"),
    ) {
        Ok(image) => image,
        Err(err) => {
            backend.destroy_image(normal);
            backend.destroy_image(depth);
            return Err(err);
        }
    };

    Ok(SurfaceImages {
        stamp,
        depth,
        normal,
        ambient_occlusion,
    })
}

fn destroy_images<B: RenderBackend>(backend: &B, images: SurfaceImages<B>) {
    backend.destroy_image(images.ambient_occlusion);
    backend.destroy_image(images.normal);
    backend.destroy_image(images.depth);
}

fn create_targets<B: RenderBackend>(
    backend: &B,
    images: &SurfaceImages<B>,
    stamp: SurfaceStamp,
) -> RhiResult<SurfaceTargets<B>> {
    let extent = stamp.extent;
    let depth = || Some(DepthTarget { image: &images.depth, layer: 0 });

    let main = backend.create_render_target(&RenderTargetDesc {
        name: "main",
        kind: PassKind::Main,
        extent,
        color: ColorTarget::Surface,
        depth: depth(),
        color_load: LoadOp::Clear,
    })?;
    let geometry = match backend.create_render_target(&RenderTargetDesc {
        name: "geometry",
        kind: PassKind::Geometry,
        extent,
        color: ColorTarget::Image(&images.normal),
        depth: depth(),
        color_load: LoadOp::Clear,
    }) {
        Ok(target) => target,
        Err(err) => {
            backend.destroy_render_target(main);
            return Err(err);
        }
    };
    let ambient_occlusion = match backend.create_render_target(&RenderTargetDesc {
        name: "ambient_occlusion",
        kind: PassKind::AmbientOcclusion,
        extent,
        color: ColorTarget::Image(&images.ambient_occlusion),
        depth: None,
        color_load: LoadOp::Clear,
    }) {
        Ok(target) => target,
        Err(err) => {
            backend.destroy_render_target(geometry);
            backend.destroy_render_target(main);
            return Err(err);
        }
    };
    // Drawn over the main pass output.
    let ui = match backend.create_render_target(&RenderTargetDesc {
        name: "ui",
        kind: PassKind::Ui,
        extent,
        color: ColorTarget::Surface,
        depth: None,
        color_load: LoadOp::Load,
    }) {
        Ok(target) => target,
        Err(err) => {
            backend.destroy_render_target(ambient_occlusion);
            backend.destroy_render_target(geometry);
            backend.destroy_render_target(main);
            return Err(err);
        }
    };

    Ok(SurfaceTargets {
        stamp,
        main,
        geometry,
        ambient_occlusion,
        ui,
    })
}

/// Shadow map array and one depth-only target per cascade.
pub struct ShadowTargets<B: RenderBackend> {
    pub map: B::Image,
    pub cascades: Vec<B::RenderTarget>,
    pub size: u32,
}

impl<B: RenderBackend> ShadowTargets<B> {
    pub fn new(backend: &B, cascades: u32, size: u32) -> RhiResult<Self> {
        let map = backend.create_image(
            &TextureDesc::new_depth_attachment(size, size)
                .with_array_layers(cascades)
                .with_sampler(SamplerDesc::shadow())
                .with_name("shadow_cascades"),
        )?;

        let mut targets = Vec::with_capacity(cascades as usize);
        for layer in 0..cascades {
            let name = format!("shadow_cascade_{layer}");
            let target = backend.create_render_target(&RenderTargetDesc {
                name: &name,
                kind: PassKind::Shadow,
                extent: Extent2D::new(size, size),
                color: ColorTarget::None,
                depth: Some(DepthTarget { image: &map, layer }),
                color_load: LoadOp::Clear,
            });
            match target {
                Ok(target) => targets.push(target),
                Err(err) => {
                    for target in targets {
                        backend.destroy_render_target(target);
                    }
                    backend.destroy_image(map);
                    return Err(err);
                }
            }
        }

        Ok(Self {
            map,
            cascades: targets,
            size,
        })
    }

    #[inline]
    pub fn cascade_count(&self) -> u32 {
        self.cascades.len() as u32
    }

    pub fn destroy(self, backend: &B) {
        for target in self.cascades {
            backend.destroy_render_target(target);
        }
        backend.destroy_image(self.map);
    }
}

/// Result of checking the surface before a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceValidity {
    Valid,
    /// Must be rebuilt at this extent before rendering.
    Invalid(Extent2D),
    /// Zero-sized window; nothing can be rendered until it is restored.
    Minimized,
}

pub struct SurfaceLifecycle<B: RenderBackend> {
    current: Option<SurfaceGeneration<B>>,
    shadow: Option<ShadowTargets<B>>,
    stamp: SurfaceStamp,
    pending_resize: Option<Extent2D>,
    needs_rebuild: bool,
    rebuilds: u64,
}

impl<B: RenderBackend> SurfaceLifecycle<B> {
    /// Shadow targets only; the first generation is built by the first frame.
    pub fn new(backend: &B, shadow_cascades: u32, shadow_map_size: u32) -> RhiResult<Self> {
        Ok(Self {
            current: None,
            shadow: Some(ShadowTargets::new(backend, shadow_cascades, shadow_map_size)?),
            stamp: SurfaceStamp::default(),
            pending_resize: None,
            needs_rebuild: true,
            rebuilds: 0,
        })
    }

    #[inline]
    pub fn stamp(&self) -> SurfaceStamp {
        self.stamp
    }

    #[inline]
    pub fn generation(&self) -> Option<&SurfaceGeneration<B>> {
        self.current.as_ref()
    }

    #[inline]
    pub fn shadow(&self) -> Option<&ShadowTargets<B>> {
        self.shadow.as_ref()
    }

    /// How many generations have been built.
    #[inline]
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Explicit resize request; applied at the next frame start.
    pub fn request_resize(&mut self, extent: Extent2D) {
        self.pending_resize = Some(extent);
    }

    /// Present reported the surface as stale.
    pub fn mark_invalid(&mut self) {
        self.needs_rebuild = true;
    }

    #[inline]
    pub fn is_marked_invalid(&self) -> bool {
        self.needs_rebuild || self.pending_resize.is_some()
    }

    pub fn validate(&self, window: Extent2D) -> SurfaceValidity {
        let target = self.pending_resize.unwrap_or(window);
        if target.is_empty() || window.is_empty() {
            return SurfaceValidity::Minimized;
        }

        let Some(current) = &self.current else {
            return SurfaceValidity::Invalid(target);
        };
        let stale = self.needs_rebuild
            || self.pending_resize.is_some()
            || window != self.stamp.extent
            || current.images.stamp != self.stamp
            || current.targets.stamp != self.stamp;

        if stale {
            SurfaceValidity::Invalid(target)
        } else {
            SurfaceValidity::Valid
        }
    }

    /// Tear down the current generation and build the next one at `extent`.
    ///
    /// Waits for the GPU to go idle first. On failure the surface stays invalid and the
    /// next frame tries again.
    pub fn rebuild(&mut self, backend: &B, extent: Extent2D) -> RhiResult<()> {
        profiling::scope!("SurfaceLifecycle::rebuild");

        backend.wait_idle()?;
        if let Some(old) = self.current.take() {
            old.destroy(backend);
        }
        self.needs_rebuild = true;

        let actual = backend.recreate_surface(extent)?;
        if actual.is_empty() {
            return Ok(());
        }

        let stamp = SurfaceStamp {
            generation: self.stamp.generation + 1,
            extent: actual,
        };
        let generation = SurfaceGeneration::create(backend, stamp)?;

        log::debug!(
            "surface generation {} built at {}x{}",
            stamp.generation,
            actual.width,
            actual.height
        );
        self.current = Some(generation);
        self.stamp = stamp;
        self.pending_resize = None;
        self.needs_rebuild = false;
        self.rebuilds += 1;
        Ok(())
    }

    /// Target a pass renders into, with the extent it covers.
    pub fn target(&self, pass: ActivePass) -> Option<(&B::RenderTarget, Extent2D)> {
        match pass {
            ActivePass::Shadow { cascade } => {
                let shadow = self.shadow.as_ref()?;
                let target = shadow.cascades.get(cascade as usize)?;
                Some((target, Extent2D::new(shadow.size, shadow.size)))
            }
            _ => {
                let current = self.current.as_ref()?;
                let target = match pass {
                    ActivePass::Main => &current.targets.main,
                    ActivePass::Geometry => &current.targets.geometry,
                    ActivePass::AmbientOcclusion => &current.targets.ambient_occlusion,
                    ActivePass::Ui => &current.targets.ui,
                    ActivePass::Shadow { .. } => return None,
                };
                Some((target, current.targets.stamp.extent))
            }
        }
    }

    /// Destroy everything. The GPU must be idle.
    pub fn destroy(&mut self, backend: &B) {
        if let Some(current) = self.current.take() {
            current.destroy(backend);
        }
        if let Some(shadow) = self.shadow.take() {
            shadow.destroy(backend);
        }
    }

    /// Drop ownership of every native object without touching the backend.
    pub(crate) fn abandon(&mut self) {
        std::mem::forget(self.current.take());
        std::mem::forget(self.shadow.take());
    }
}
