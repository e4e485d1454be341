use ash::vk;
use tracing::debug;

use vkdrm_core::{LedgerId, ResourceKind};

use crate::context::VulkanContext;
use crate::error::{VkError, VkResultExt};

/// Full colour subresource of a single-level, single-layer image.
pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Command pool on the context's queue family.
pub struct CommandPool<'a> {
    ctx: &'a VulkanContext,
    pool: vk::CommandPool,
    id: LedgerId,
}

impl<'a> CommandPool<'a> {
    pub fn new(ctx: &'a VulkanContext) -> Result<Self, VkError> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family_index());
        let pool = unsafe { ctx.device().create_command_pool(&info, None) }
            .call("vkCreateCommandPool")?;
        let id = ctx.ledger().record_create(ResourceKind::VkCommandPool);
        Ok(Self { ctx, pool, id })
    }

    pub fn raw(&self) -> vk::CommandPool {
        self.pool
    }

    /// Record a one-shot clear of `image` to `color`, leaving the image in
    /// `final_layout`. Prior contents are discarded.
    pub fn record_clear(
        &self,
        image: vk::Image,
        color: [f32; 4],
        final_layout: vk::ImageLayout,
    ) -> Result<ClearCommand<'_>, VkError> {
        let device = self.ctx.device();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .call("vkAllocateCommandBuffers")?[0];
        let command = ClearCommand {
            pool: self,
            buffer,
            id: self.ctx.ledger().record_create(ResourceKind::VkCommandBuffer),
        };

        // `command` frees the buffer if recording fails part way.
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
        unsafe { device.begin_command_buffer(buffer, &begin_info) }
            .call("vkBeginCommandBuffer")?;
        record_clear_commands(device, buffer, image, color, final_layout);
        unsafe { device.end_command_buffer(buffer) }.call("vkEndCommandBuffer")?;

        debug!("recorded clear to {:?} -> {:?}", color, final_layout);
        Ok(command)
    }
}

impl Drop for CommandPool<'_> {
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_command_pool(self.pool, None) };
        let _ = self.ctx.ledger().record_destroy(self.id);
    }
}

/// Recorded clear command buffer, freed back to its pool on drop.
pub struct ClearCommand<'p> {
    pool: &'p CommandPool<'p>,
    buffer: vk::CommandBuffer,
    id: LedgerId,
}

impl ClearCommand<'_> {
    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Submit once and block until the queue is idle.
    pub fn submit_and_wait(&self) -> Result<(), VkError> {
        let ctx = self.pool.ctx;
        let buffers = [self.buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&buffers);
        unsafe {
            ctx.device()
                .queue_submit(ctx.queue(), &[submit], vk::Fence::null())
        }
        .call("vkQueueSubmit")?;
        ctx.wait_idle()?;
        debug!("clear submitted and completed");
        Ok(())
    }
}

impl Drop for ClearCommand<'_> {
    fn drop(&mut self) {
        let ctx = self.pool.ctx;
        unsafe { ctx.device().free_command_buffers(self.pool.pool, &[self.buffer]) };
        let _ = ctx.ledger().record_destroy(self.id);
    }
}

/// Barrier into TRANSFER_DST_OPTIMAL, full-resource clear, barrier into
/// `final_layout`.
pub fn record_clear_commands(
    device: &ash::Device,
    buffer: vk::CommandBuffer,
    image: vk::Image,
    color: [f32; 4],
    final_layout: vk::ImageLayout,
) {
    let to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE);

    let (dst_access, dst_stage) = release_scope(final_layout);
    let to_final = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(dst_access)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(final_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE);

    let clear = vk::ClearColorValue { float32: color };

    unsafe {
        device.cmd_pipeline_barrier(
            buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );
        device.cmd_clear_color_image(
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear,
            &[COLOR_RANGE],
        );
        device.cmd_pipeline_barrier(
            buffer,
            vk::PipelineStageFlags::TRANSFER,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_final],
        );
    }
}

/// Access mask and stage that must see the clear for each consumer layout.
pub fn release_scope(final_layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match final_layout {
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        // Host readback and external scanout both read the linear image in GENERAL.
        _ => (
            vk::AccessFlags::HOST_READ | vk::AccessFlags::MEMORY_READ,
            vk::PipelineStageFlags::HOST | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_release_needs_no_access() {
        let (access, stage) = release_scope(vk::ImageLayout::PRESENT_SRC_KHR);
        assert!(access.is_empty());
        assert_eq!(stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn general_release_is_host_visible() {
        let (access, stage) = release_scope(vk::ImageLayout::GENERAL);
        assert!(access.contains(vk::AccessFlags::HOST_READ));
        assert!(stage.contains(vk::PipelineStageFlags::HOST));
    }

    #[test]
    fn color_range_covers_single_subresource() {
        assert_eq!(COLOR_RANGE.level_count, 1);
        assert_eq!(COLOR_RANGE.layer_count, 1);
        assert_eq!(COLOR_RANGE.aspect_mask, vk::ImageAspectFlags::COLOR);
    }
}
