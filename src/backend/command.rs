// Command recording - per-slot pools and the clear pass
//
// One command pool per back-buffer slot so a pool is never reset while
// the GPU may still be reading its commands. The recorded sequence is
// the whole frame's content for now: transition the back buffer out of
// present, clear it, transition it back. A real renderer would insert
// its draw calls between the two transitions.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::RenderDevice;

pub struct FrameCommands {
    pools: Vec<vk::CommandPool>,
    buffers: Vec<vk::CommandBuffer>,
    device: Arc<RenderDevice>,
}

impl FrameCommands {
    pub fn new(device: Arc<RenderDevice>, slots: usize) -> Result<Self> {
        let mut pools = Vec::with_capacity(slots);
        let mut buffers = Vec::with_capacity(slots);

        for _ in 0..slots {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(device.graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);

            let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
                .context("Failed to create command pool")?;
            pools.push(pool);

            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            let allocated = unsafe { device.device.allocate_command_buffers(&alloc_info) }
                .context("Failed to allocate command buffer")?;
            buffers.push(allocated[0]);
        }

        log::info!("Created {} per-slot command pools", slots);

        Ok(Self {
            pools,
            buffers,
            device,
        })
    }

    /// Reset the slot's pool and record the clear sequence for `image`.
    ///
    /// Only legal once the frame pacer has confirmed the slot's previous
    /// submission completed.
    pub fn record_clear(
        &self,
        slot: usize,
        image: vk::Image,
        first_use: bool,
        clear_color: [f32; 4],
    ) -> Result<()> {
        let cmd = self.buffers[slot];
        let device = &self.device.device;

        let (to_clear, to_present) = clear_pass_barriers(image, first_use);
        let clear_value = vk::ClearColorValue {
            float32: clear_color,
        };

        unsafe {
            device
                .reset_command_pool(self.pools[slot], vk::CommandPoolResetFlags::empty())
                .context("Failed to reset command pool")?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_clear],
            );

            device.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_value,
                &[color_subresource_range()],
            );

            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );

            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }

        Ok(())
    }

    /// Submit the slot's closed command buffer to the graphics queue.
    pub fn submit(
        &self,
        slot: usize,
        wait_semaphore: vk::Semaphore,
        signal_semaphore: vk::Semaphore,
    ) -> Result<()> {
        let command_buffers = [self.buffers[slot]];
        let wait_semaphores = [wait_semaphore];
        let signal_semaphores = [signal_semaphore];
        // The clear runs in the transfer stage; gate it on the acquire
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )
        }
        .context("Failed to submit command buffer")?;

        Ok(())
    }
}

impl Drop for FrameCommands {
    fn drop(&mut self) {
        unsafe {
            for &pool in &self.pools {
                // Destroying the pool frees its command buffer
                self.device.device.destroy_command_pool(pool, None);
            }
        }
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// The frame's transition pair: present -> clear target, clear target
/// -> present. A back buffer fresh from (re)creation has no defined
/// contents, so its first transition starts from UNDEFINED.
pub fn clear_pass_barriers(
    image: vk::Image,
    first_use: bool,
) -> (vk::ImageMemoryBarrier, vk::ImageMemoryBarrier) {
    let old_layout = if first_use {
        vk::ImageLayout::UNDEFINED
    } else {
        vk::ImageLayout::PRESENT_SRC_KHR
    };

    let to_clear = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(old_layout)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
        .build();

    let to_present = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
        .build();

    (to_clear, to_present)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_pass_is_one_transition_pair() {
        let image = vk::Image::null();
        let (to_clear, to_present) = clear_pass_barriers(image, false);

        // Out of present, into the clear target
        assert_eq!(to_clear.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(to_clear.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(to_clear.dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);

        // And back to present
        assert_eq!(to_present.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(to_present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(to_present.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn first_use_transitions_from_undefined() {
        let (to_clear, to_present) = clear_pass_barriers(vk::Image::null(), true);
        assert_eq!(to_clear.old_layout, vk::ImageLayout::UNDEFINED);
        // The return transition is unaffected
        assert_eq!(to_present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn barriers_cover_the_whole_color_image() {
        let (to_clear, _) = clear_pass_barriers(vk::Image::null(), false);
        let range = to_clear.subresource_range;
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 1);
    }
}
