//! Binding table layout and per-slot descriptor sets.
//!
//! All pipelines share one set layout where binding `n` is `BindingPoint::index() == n`, plus
//! one push constant range carrying the per-draw model uniforms.

use ash::vk;
use keel_core::collections::SmallVec;
use keel_rhi_derive::DeviceObject;

use crate::binding::BindingPoint;
use crate::pipeline::MODEL_PUSH_CONSTANT_SIZE;
use crate::vulkan::device::{DeviceObject, LogicalDevice};
use crate::RhiResult;

fn descriptor_type(point: BindingPoint) -> vk::DescriptorType {
    match point {
        BindingPoint::GlobalUniforms => vk::DescriptorType::UNIFORM_BUFFER,
        BindingPoint::InstanceData => vk::DescriptorType::STORAGE_BUFFER,
        _ => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

/// Shared descriptor set layout and pipeline layout.
#[DeviceObject]
pub struct BindingLayout {
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

impl BindingLayout {
    pub fn new(device: &LogicalDevice) -> RhiResult<Self> {
        let raw = device.handle();

        let bindings: SmallVec<[vk::DescriptorSetLayoutBinding; BindingPoint::COUNT]> = BindingPoint::ALL
            .iter()
            .map(|&point| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(point.index())
                    .descriptor_type(descriptor_type(point))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = unsafe { raw.create_descriptor_set_layout(&create_info, None)? };

        let push_constant = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(MODEL_PUSH_CONSTANT_SIZE);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&set_layout))
            .push_constant_ranges(std::slice::from_ref(&push_constant));
        let pipeline_layout = match unsafe { raw.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(err) => {
                unsafe { raw.destroy_descriptor_set_layout(set_layout, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            set_layout,
            pipeline_layout,
            device: raw.clone(),
        })
    }

    #[inline]
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    #[inline]
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }
}

impl Drop for BindingLayout {
    fn drop(&mut self) {
        unsafe {
            self.device().destroy_pipeline_layout(self.pipeline_layout, None);
            self.device().destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// One descriptor set with a pool of its own. A table is never written while a stream that
/// bound it is recording or executing.
#[DeviceObject]
pub struct VulkanBindingTable {
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

impl VulkanBindingTable {
    pub fn new(device: &LogicalDevice, layout: &BindingLayout) -> RhiResult<Self> {
        let raw = device.handle();
        let textures = BindingPoint::ALL.iter().filter(|point| point.is_texture()).count() as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(textures),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { raw.create_descriptor_pool(&pool_info, None)? };

        let set_layouts = [layout.set_layout()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = match unsafe { raw.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(err) => {
                unsafe { raw.destroy_descriptor_pool(pool, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            pool,
            set,
            device: raw.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }
}

impl Drop for VulkanBindingTable {
    fn drop(&mut self) {
        // Destroying the pool frees the set.
        unsafe { self.device().destroy_descriptor_pool(self.pool, None) };
    }
}

/// Resource info for one binding write, resolved before the `vk::WriteDescriptorSet`s that
/// borrow it are built.
pub(crate) enum ResolvedWrite {
    Buffer(BindingPoint, vk::DescriptorBufferInfo),
    Image(BindingPoint, vk::DescriptorImageInfo),
}

pub(crate) fn update_table(device: &ash::Device, table: &VulkanBindingTable, resolved: &[ResolvedWrite]) {
    if resolved.is_empty() {
        return;
    }
    let writes: SmallVec<[vk::WriteDescriptorSet; BindingPoint::COUNT]> = resolved
        .iter()
        .map(|write| match write {
            ResolvedWrite::Buffer(point, info) => vk::WriteDescriptorSet::default()
                .dst_set(table.handle())
                .dst_binding(point.index())
                .descriptor_type(descriptor_type(*point))
                .buffer_info(std::slice::from_ref(info)),
            ResolvedWrite::Image(point, info) => vk::WriteDescriptorSet::default()
                .dst_set(table.handle())
                .dst_binding(point.index())
                .descriptor_type(descriptor_type(*point))
                .image_info(std::slice::from_ref(info)),
        })
        .collect();
    unsafe { device.update_descriptor_sets(&writes, &[]) };
}
