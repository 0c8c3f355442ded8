use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{vk_call, SetupError};
use vkdispatch_core::Extent3;

/// Command pool with one primary command buffer and the fence its submission
/// signals.
pub struct DispatchCommand {
    ctx: Arc<DeviceContext>,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    workgroups: Extent3,
}

impl DispatchCommand {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn workgroups(&self) -> Extent3 {
        self.workgroups
    }
}

impl Drop for DispatchCommand {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            if self.fence != vk::Fence::null() {
                device.destroy_fence(self.fence, None);
            }
            // Frees the command buffer along with the pool.
            device.destroy_command_pool(self.pool, None);
        }
        debug!("destroyed command pool");
    }
}

/// Record a one-time command buffer that binds `pipeline` and `set` and
/// dispatches `workgroups`, followed by a barrier making shader writes
/// visible to host reads.
pub fn record_dispatch(
    ctx: &Arc<DeviceContext>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set: vk::DescriptorSet,
    workgroups: Extent3,
) -> Result<DispatchCommand, SetupError> {
    let device = ctx.device();

    let pool_info =
        vk::CommandPoolCreateInfo::default().queue_family_index(ctx.queue_family_index());
    let pool = unsafe { device.create_command_pool(&pool_info, None) }
        .map_err(vk_call("vkCreateCommandPool"))?;
    let mut command = DispatchCommand {
        ctx: Arc::clone(ctx),
        pool,
        command_buffer: vk::CommandBuffer::null(),
        fence: vk::Fence::null(),
        workgroups,
    };

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
        .map_err(vk_call("vkAllocateCommandBuffers"))?;
    let cb = buffers[0];
    command.command_buffer = cb;

    command.fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
        .map_err(vk_call("vkCreateFence"))?;

    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ);

    unsafe {
        device
            .begin_command_buffer(cb, &begin_info)
            .map_err(vk_call("vkBeginCommandBuffer"))?;
        device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipeline);
        device.cmd_bind_descriptor_sets(
            cb,
            vk::PipelineBindPoint::COMPUTE,
            layout,
            0,
            &[set],
            &[],
        );
        device.cmd_dispatch(cb, workgroups.x, workgroups.y, workgroups.z);
        device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
        device
            .end_command_buffer(cb)
            .map_err(vk_call("vkEndCommandBuffer"))?;
    }

    debug!("recorded dispatch of {} workgroups", workgroups);
    Ok(command)
}

/// Submit the recorded command buffer; its fence signals on completion.
pub fn submit(ctx: &DeviceContext, command: &DispatchCommand) -> Result<(), SetupError> {
    let command_buffers = [command.command_buffer];
    let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
    unsafe {
        ctx.device()
            .queue_submit(ctx.queue(), std::slice::from_ref(&submit), command.fence)
            .map_err(vk_call("vkQueueSubmit"))?;
    }
    debug!("submitted dispatch of {} workgroups", command.workgroups);
    Ok(())
}

/// Block until a submitted command has finished and the queue is idle.
pub fn wait(ctx: &DeviceContext, command: &DispatchCommand) -> Result<(), SetupError> {
    let device = ctx.device();
    unsafe {
        device
            .wait_for_fences(&[command.fence], true, u64::MAX)
            .map_err(vk_call("vkWaitForFences"))?;
        device
            .queue_wait_idle(ctx.queue())
            .map_err(vk_call("vkQueueWaitIdle"))?;
    }
    Ok(())
}
