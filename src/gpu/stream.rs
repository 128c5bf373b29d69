use std::ptr;
use std::sync::Arc;

use vulkanalia::{
    Device,
    vk::{self, DeviceV1_0},
};

use crate::error::VkrtError;

use super::context::DeviceContext;

/// Identity of a deferred launch: the descriptor set it updates and the
/// buffer handles it binds, in binding order. Two launches with equal tokens
/// can share one CPU-side descriptor update between synchronizes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamToken {
    pub descriptor_set: vk::DescriptorSet,
    pub buffers: Vec<vk::Buffer>,
}

type RecordFn = Box<dyn FnOnce(&Device, vk::CommandBuffer)>;

/// Per-(thread, device) command recorder: one command pool, one reusable
/// primary command buffer, one fence.
///
/// In immediate mode launches record straight into the open command buffer.
/// In deferred mode launches are queued and recorded during `synchronize`,
/// after their descriptor sets have been updated.
pub struct Stream {
    ctx: Arc<DeviceContext>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    recording: bool,
    deferred_kernels: Vec<RecordFn>,
    deferred_tokens: Vec<StreamToken>,
}

impl Stream {
    pub fn new(ctx: Arc<DeviceContext>) -> Result<Self, VkrtError> {
        unsafe {
            let pool_info = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                next: ptr::null(),
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                queue_family_index: ctx.queue_family_index,
            };
            let command_pool = ctx.device().create_command_pool(&pool_info, None)?;

            let alloc_info = vk::CommandBufferAllocateInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
                next: ptr::null(),
                command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
            };
            let command_buffer = match ctx.device().allocate_command_buffers(&alloc_info) {
                Ok(buffers) => buffers[0],
                Err(e) => {
                    ctx.device().destroy_command_pool(command_pool, None);
                    return Err(e.into());
                }
            };

            let fence_info = vk::FenceCreateInfo {
                s_type: vk::StructureType::FENCE_CREATE_INFO,
                next: ptr::null(),
                flags: vk::FenceCreateFlags::empty(),
            };
            let fence = match ctx.device().create_fence(&fence_info, None) {
                Ok(f) => f,
                Err(e) => {
                    ctx.device().destroy_command_pool(command_pool, None);
                    return Err(e.into());
                }
            };

            Ok(Self {
                ctx,
                command_pool,
                command_buffer,
                fence,
                recording: false,
                deferred_kernels: Vec::new(),
                deferred_tokens: Vec::new(),
            })
        }
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    fn begin_if_needed(&mut self) -> Result<(), VkrtError> {
        if !self.recording {
            let begin_info = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            unsafe {
                self.ctx
                    .device()
                    .begin_command_buffer(self.command_buffer, &begin_info)?;
            }
            self.recording = true;
        }
        Ok(())
    }

    /// Submit work to the stream. Immediate mode records now; deferred mode
    /// queues the closure until the next `synchronize`, so it must own what
    /// it captures.
    pub fn launch(
        &mut self,
        kernel: impl FnOnce(&Device, vk::CommandBuffer) + 'static,
    ) -> Result<(), VkrtError> {
        if self.ctx.use_immediate() {
            self.begin_if_needed()?;
            kernel(self.ctx.device(), self.command_buffer);
        } else {
            self.deferred_kernels.push(Box::new(kernel));
        }
        Ok(())
    }

    /// Deferred-protocol submission. `init` performs the CPU-side descriptor
    /// update and runs at most once per distinct token between synchronizes.
    /// Reusing a descriptor set with different buffers while kernels are
    /// queued forces a synchronize first, because the update would clobber
    /// bindings the queued kernels still reference.
    pub fn launch_deferred(
        &mut self,
        init: impl FnOnce(),
        kernel: impl FnOnce(&Device, vk::CommandBuffer) + 'static,
        token: StreamToken,
    ) -> Result<(), VkrtError> {
        assert!(
            !self.ctx.use_immediate(),
            "launch_deferred on an immediate-mode stream"
        );
        let conflicting = self
            .deferred_tokens
            .iter()
            .any(|t| t.descriptor_set == token.descriptor_set && t.buffers != token.buffers);
        if conflicting {
            self.synchronize()?;
        }
        if !self.deferred_tokens.contains(&token) {
            init();
            self.deferred_tokens.push(token);
        }
        self.deferred_kernels.push(Box::new(kernel));
        Ok(())
    }

    /// Record any queued work, submit the command buffer under the device
    /// queue mutex, and block until the fence signals. Resets the command
    /// buffer and clears the deferred token set afterwards.
    pub fn synchronize(&mut self) -> Result<(), VkrtError> {
        if !self.deferred_kernels.is_empty() {
            self.begin_if_needed()?;
            for kernel in std::mem::take(&mut self.deferred_kernels) {
                kernel(self.ctx.device(), self.command_buffer);
            }
        }
        self.deferred_tokens.clear();
        if !self.recording {
            return Ok(());
        }
        unsafe {
            self.ctx.device().end_command_buffer(self.command_buffer)?;
            self.ctx.queue_submit(self.command_buffer, self.fence)?;
            self.ctx
                .device()
                .wait_for_fences(&[self.fence], true, u64::MAX)?;
            self.ctx.device().reset_fences(&[self.fence])?;
            self.ctx
                .device()
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
        }
        self.recording = false;
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_fence(self.fence, None);
            self.ctx
                .device()
                .free_command_buffers(self.command_pool, &[self.command_buffer]);
            self.ctx.device().destroy_command_pool(self.command_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vulkanalia::vk::Handle;

    fn token(set: u64, buffers: &[u64]) -> StreamToken {
        StreamToken {
            descriptor_set: vk::DescriptorSet::from_raw(set),
            buffers: buffers.iter().map(|&b| vk::Buffer::from_raw(b)).collect(),
        }
    }

    #[test]
    fn equal_tokens_deduplicate() {
        let seen = vec![token(1, &[10, 20])];
        assert!(seen.contains(&token(1, &[10, 20])));
        assert!(!seen.contains(&token(1, &[20, 10])));
        assert!(!seen.contains(&token(2, &[10, 20])));
    }

    #[test]
    fn same_set_different_buffers_conflicts() {
        let seen = vec![token(1, &[10, 20])];
        let incoming = token(1, &[10, 30]);
        let conflicting = seen
            .iter()
            .any(|t| t.descriptor_set == incoming.descriptor_set && t.buffers != incoming.buffers);
        assert!(conflicting);

        let same = token(1, &[10, 20]);
        assert!(
            !seen
                .iter()
                .any(|t| t.descriptor_set == same.descriptor_set && t.buffers != same.buffers)
        );
    }
}
