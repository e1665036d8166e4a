//! Keeps every ring slot's binding table in line with what the caller selected.
//!
//! Most binding points change rarely (textures, render targets after a resize); when one of
//! them changes, every slot is marked dirty and rewrites its whole table the next time it
//! starts a frame. Instance data changes per draw and is patched point by point instead.

use crate::resource::{BufferHandle, TextureHandle};
use keel_core::collections::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BindingPoint {
    GlobalUniforms,
    ColorTexture,
    NormalMap,
    RoughnessMap,
    ShadowMap,
    AmbientOcclusion,
    InstanceData,
}

impl BindingPoint {
    pub const COUNT: usize = 7;

    pub const ALL: [BindingPoint; Self::COUNT] = [
        BindingPoint::GlobalUniforms,
        BindingPoint::ColorTexture,
        BindingPoint::NormalMap,
        BindingPoint::RoughnessMap,
        BindingPoint::ShadowMap,
        BindingPoint::AmbientOcclusion,
        BindingPoint::InstanceData,
    ];

    /// Shader binding number.
    #[inline]
    pub fn index(self) -> u32 {
        self as u32
    }

    /// Points rewritten with the whole table rather than patched individually.
    #[inline]
    pub fn is_bulk(self) -> bool {
        !matches!(self, BindingPoint::InstanceData)
    }

    #[inline]
    pub fn is_texture(self) -> bool {
        matches!(
            self,
            BindingPoint::ColorTexture
                | BindingPoint::NormalMap
                | BindingPoint::RoughnessMap
                | BindingPoint::ShadowMap
                | BindingPoint::AmbientOcclusion
        )
    }
}

/// What a binding point currently refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingSource {
    /// The 1x1 white texture or the zeroed fallback buffer.
    Fallback,
    /// The slot's own uniform buffer.
    SlotUniforms,
    Buffer(BufferHandle),
    Texture(TextureHandle),
    /// Ambient occlusion target of a surface generation.
    AmbientOcclusionTarget { generation: u64 },
    ShadowMap,
}

impl BindingSource {
    pub fn from_buffer(handle: BufferHandle) -> Self {
        if handle.is_none() {
            BindingSource::Fallback
        } else {
            BindingSource::Buffer(handle)
        }
    }

    pub fn from_texture(handle: TextureHandle) -> Self {
        if handle.is_none() {
            BindingSource::Fallback
        } else {
            BindingSource::Texture(handle)
        }
    }
}

/// Table writes a slot needs before its next use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Every point is rewritten.
    pub full: bool,
    pub points: SmallVec<[BindingPoint; BindingPoint::COUNT]>,
}

impl SyncPlan {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Clone, Debug)]
struct SlotBindings {
    /// What the slot's table holds; `None` until first written.
    reflected: [Option<BindingSource>; BindingPoint::COUNT],
    dirty: bool,
}

impl SlotBindings {
    fn new() -> Self {
        Self {
            reflected: [None; BindingPoint::COUNT],
            dirty: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BindingSynchronizer {
    selected: [BindingSource; BindingPoint::COUNT],
    /// Bulk selection the slots were last marked dirty for.
    bulk_seen: Option<[BindingSource; BindingPoint::COUNT]>,
    slots: Vec<SlotBindings>,
}

impl BindingSynchronizer {
    pub fn new(slot_count: usize) -> Self {
        let mut selected = [BindingSource::Fallback; BindingPoint::COUNT];
        selected[BindingPoint::GlobalUniforms as usize] = BindingSource::SlotUniforms;
        selected[BindingPoint::ShadowMap as usize] = BindingSource::ShadowMap;
        Self {
            selected,
            bulk_seen: None,
            slots: vec![SlotBindings::new(); slot_count],
        }
    }

    #[inline]
    pub fn selected(&self, point: BindingPoint) -> BindingSource {
        self.selected[point as usize]
    }

    /// Record the caller's choice for `point`. Returns whether it changed.
    pub fn select(&mut self, point: BindingPoint, source: BindingSource) -> bool {
        let slot = &mut self.selected[point as usize];
        if *slot == source {
            return false;
        }
        *slot = source;
        true
    }

    /// Points currently selecting `source` go back to the fallback.
    pub fn revert(&mut self, source: BindingSource) -> SmallVec<[BindingPoint; BindingPoint::COUNT]> {
        let mut reverted = SmallVec::new();
        for point in BindingPoint::ALL {
            if self.selected[point as usize] == source {
                self.selected[point as usize] = BindingSource::Fallback;
                reverted.push(point);
            }
        }
        reverted
    }

    #[inline]
    pub fn is_dirty(&self, slot: usize) -> bool {
        self.slots[slot].dirty
    }

    #[inline]
    pub fn reflected(&self, slot: usize, point: BindingPoint) -> Option<BindingSource> {
        self.slots[slot].reflected[point as usize]
    }

    pub fn mark_all_dirty(&mut self) {
        for slot in &mut self.slots {
            slot.dirty = true;
        }
    }

    /// Work `slot` needs at the start of its frame.
    pub fn plan(&mut self, slot: usize) -> SyncPlan {
        let bulk = self.bulk_selection();
        if self.bulk_seen != Some(bulk) {
            self.mark_all_dirty();
            self.bulk_seen = Some(bulk);
        }

        let bindings = &self.slots[slot];
        if bindings.dirty {
            return SyncPlan {
                full: true,
                points: BindingPoint::ALL.iter().copied().collect(),
            };
        }

        SyncPlan {
            full: false,
            points: BindingPoint::ALL
                .iter()
                .copied()
                .filter(|&point| bindings.reflected[point as usize] != Some(self.selected[point as usize]))
                .collect(),
        }
    }

    fn bulk_selection(&self) -> [BindingSource; BindingPoint::COUNT] {
        let mut bulk = self.selected;
        // Patched points never force a full rewrite.
        for point in BindingPoint::ALL.iter().filter(|point| !point.is_bulk()) {
            bulk[*point as usize] = BindingSource::Fallback;
        }
        bulk
    }

    /// The table of `slot` now holds the selected source for every point in `plan`.
    pub fn mark_written(&mut self, slot: usize, plan: &SyncPlan) {
        let selected = self.selected;
        let bindings = &mut self.slots[slot];
        for &point in &plan.points {
            bindings.reflected[point as usize] = Some(selected[point as usize]);
        }
        if plan.full {
            bindings.dirty = false;
        }
    }

    /// Whether `slot` has to be patched right now for `point` to be current.
    pub fn needs_patch(&self, slot: usize, point: BindingPoint) -> bool {
        self.slots[slot].reflected[point as usize] != Some(self.selected[point as usize])
    }

    pub fn mark_patched(&mut self, slot: usize, point: BindingPoint) {
        self.slots[slot].reflected[point as usize] = Some(self.selected[point as usize]);
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync(bindings: &mut BindingSynchronizer, slot: usize) -> SyncPlan {
        let plan = bindings.plan(slot);
        bindings.mark_written(slot, &plan);
        plan
    }

    #[test]
    fn every_slot_starts_with_full_write() {
        let mut bindings = BindingSynchronizer::new(2);
        assert!(sync(&mut bindings, 0).full);
        assert!(sync(&mut bindings, 1).full);
        assert!(sync(&mut bindings, 0).is_empty());
        assert!(sync(&mut bindings, 1).is_empty());
    }

    #[test]
    fn bulk_change_dirties_every_slot() {
        let mut bindings = BindingSynchronizer::new(2);
        sync(&mut bindings, 0);
        sync(&mut bindings, 1);

        assert!(bindings.select(BindingPoint::ColorTexture, BindingSource::from_texture(TextureHandle::from_raw(9))));
        let plan = sync(&mut bindings, 0);
        assert!(plan.full);
        assert!(bindings.is_dirty(1));
        assert!(sync(&mut bindings, 1).full);
        assert!(!bindings.is_dirty(0) && !bindings.is_dirty(1));
    }

    #[test]
    fn instance_data_is_patched_not_bulk() {
        let mut bindings = BindingSynchronizer::new(2);
        sync(&mut bindings, 0);
        sync(&mut bindings, 1);

        bindings.select(BindingPoint::InstanceData, BindingSource::from_buffer(BufferHandle::from_raw(4)));
        assert!(bindings.needs_patch(0, BindingPoint::InstanceData));
        bindings.mark_patched(0, BindingPoint::InstanceData);
        assert!(!bindings.needs_patch(0, BindingPoint::InstanceData));

        let plan = sync(&mut bindings, 1);
        assert!(!plan.full);
        assert_eq!(plan.points.as_slice(), &[BindingPoint::InstanceData]);
        assert!(sync(&mut bindings, 0).is_empty());
    }

    #[test]
    fn reselecting_same_source_changes_nothing() {
        let mut bindings = BindingSynchronizer::new(2);
        sync(&mut bindings, 0);
        sync(&mut bindings, 1);
        assert!(!bindings.select(BindingPoint::ShadowMap, BindingSource::ShadowMap));
        assert!(sync(&mut bindings, 0).is_empty());
    }

    #[test]
    fn revert_returns_points_to_fallback() {
        let mut bindings = BindingSynchronizer::new(1);
        let texture = BindingSource::from_texture(TextureHandle::from_raw(3));
        bindings.select(BindingPoint::ColorTexture, texture);
        bindings.select(BindingPoint::RoughnessMap, texture);
        let reverted = bindings.revert(texture);
        assert_eq!(reverted.as_slice(), &[BindingPoint::ColorTexture, BindingPoint::RoughnessMap]);
        assert_eq!(bindings.selected(BindingPoint::ColorTexture), BindingSource::Fallback);
    }

    #[test]
    fn none_handles_select_fallback() {
        assert_eq!(BindingSource::from_buffer(BufferHandle::NONE), BindingSource::Fallback);
        assert_eq!(BindingSource::from_texture(TextureHandle::NONE), BindingSource::Fallback);
    }
}
