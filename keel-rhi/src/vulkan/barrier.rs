//! Synchronization2 barrier helpers.
//!
//! Non-swapchain images stay in `GENERAL`, so most ordering is expressed with global memory
//! barriers. Layout transitions are only needed for the swapchain images and for the one-time
//! transition of a freshly created image.

use ash::vk;

/// A global memory barrier that does not target a specific buffer or image.
pub fn global_memory_barrier<'a>(
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
) -> vk::MemoryBarrier2<'a> {
    vk::MemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
}

/// Flush all memory writes so they are visible to subsequent GPU operations.
pub fn flush_all_memory_writes<'a>() -> vk::MemoryBarrier2<'a> {
    global_memory_barrier(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::MEMORY_WRITE,
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
    )
}

/// Copies recorded so far become visible to every later stage.
pub fn transfer_to_all_commands<'a>() -> vk::MemoryBarrier2<'a> {
    global_memory_barrier(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::MEMORY_READ,
    )
}

/// Copies recorded after this wait for every earlier read of their destination.
pub fn all_commands_to_transfer<'a>() -> vk::MemoryBarrier2<'a> {
    global_memory_barrier(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::NONE,
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
    )
}

/// Whole-image layout transition.
pub fn image_transition<'a>(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> vk::ImageMemoryBarrier2<'a> {
    vk::ImageMemoryBarrier2::default()
        .image(image)
        .subresource_range(range)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_stage_mask(src.0)
        .src_access_mask(src.1)
        .dst_stage_mask(dst.0)
        .dst_access_mask(dst.1)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
}

pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Swapchain image from presentation (or undefined) to color attachment.
pub fn surface_to_attachment<'a>(image: vk::Image) -> vk::ImageMemoryBarrier2<'a> {
    image_transition(
        image,
        color_range(),
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        (vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT, vk::AccessFlags2::NONE),
        (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
    )
}

/// Swapchain image from `old_layout` to presentable.
pub fn surface_to_present<'a>(image: vk::Image, old_layout: vk::ImageLayout) -> vk::ImageMemoryBarrier2<'a> {
    image_transition(
        image,
        color_range(),
        old_layout,
        vk::ImageLayout::PRESENT_SRC_KHR,
        (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::NONE),
    )
}

pub fn memory_dependency<'a>(barriers: &'a [vk::MemoryBarrier2<'a>]) -> vk::DependencyInfo<'a> {
    vk::DependencyInfo::default().memory_barriers(barriers)
}

pub fn image_dependency<'a>(barriers: &'a [vk::ImageMemoryBarrier2<'a>]) -> vk::DependencyInfo<'a> {
    vk::DependencyInfo::default().image_memory_barriers(barriers)
}
