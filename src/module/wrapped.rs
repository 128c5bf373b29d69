use std::ptr;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use vulkanalia::{
    Device,
    vk::{self, DeviceV1_0},
};

use crate::error::VkrtError;
use crate::gpu::device_api::MAX_DEVICES;
use crate::gpu::memory::DeviceBuffer;
use crate::gpu::stream::StreamToken;
use crate::gpu::thread_entry::ThreadEntry;

use super::ModuleInner;

/// One packed scalar argument: an 8-byte slot holding any POD value the
/// kernel ABI knows about, 32-bit values in the low four bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ArgUnion64([u8; 8]);

impl ArgUnion64 {
    fn from_low_bytes(bytes: [u8; 4]) -> Self {
        let mut slot = [0u8; 8];
        slot[..4].copy_from_slice(&bytes);
        Self(slot)
    }

    pub fn from_i32(v: i32) -> Self {
        Self::from_low_bytes(v.to_le_bytes())
    }

    pub fn from_u32(v: u32) -> Self {
        Self::from_low_bytes(v.to_le_bytes())
    }

    pub fn from_f32(v: f32) -> Self {
        Self::from_low_bytes(v.to_le_bytes())
    }

    pub fn from_i64(v: i64) -> Self {
        Self(v.to_le_bytes())
    }

    pub fn from_u64(v: u64) -> Self {
        Self(v.to_le_bytes())
    }

    pub fn from_f64(v: f64) -> Self {
        Self(v.to_le_bytes())
    }
}

fn tag_slot(tag: &str) -> Option<usize> {
    match tag {
        "blockIdx.x" => Some(0),
        "blockIdx.y" => Some(1),
        "blockIdx.z" => Some(2),
        "threadIdx.x" => Some(3),
        "threadIdx.y" => Some(4),
        "threadIdx.z" => Some(5),
        _ => None,
    }
}

/// Maps the kernel's thread-axis tags onto the trailing launch arguments so
/// grid (and block) extents can be pulled out of a call.
#[derive(Clone, Debug)]
pub(crate) struct ThreadAxisConfig {
    slots: Vec<usize>,
}

impl ThreadAxisConfig {
    pub(crate) fn new(tags: &[String]) -> Self {
        let slots = tags
            .iter()
            .map(|tag| {
                tag_slot(tag).unwrap_or_else(|| panic!("Unknown thread axis tag {}", tag))
            })
            .collect();
        Self { slots }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn extract(&self, launch_params: &[u64]) -> Workload {
        assert_eq!(
            launch_params.len(),
            self.slots.len(),
            "Launch parameter count does not match the kernel's thread axes"
        );
        let mut wl = Workload { dims: [1; 6] };
        for (&slot, &value) in self.slots.iter().zip(launch_params) {
            wl.dims[slot] = value;
        }
        wl
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Workload {
    dims: [u64; 6],
}

impl Workload {
    pub(crate) fn grid_dim(&self, i: usize) -> u32 {
        self.dims[i] as u32
    }

    pub(crate) fn block_dim(&self, i: usize) -> u32 {
        self.dims[i + 3] as u32
    }
}

fn post_dispatch_barrier(device: &Device, cb: vk::CommandBuffer) {
    let barrier_info = vk::MemoryBarrier {
        s_type: vk::StructureType::MEMORY_BARRIER,
        next: ptr::null(),
        src_access_mask: vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::SHADER_READ,
        dst_access_mask: vk::AccessFlags::TRANSFER_READ
            | vk::AccessFlags::TRANSFER_WRITE
            | vk::AccessFlags::SHADER_READ
            | vk::AccessFlags::SHADER_WRITE,
    };
    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            &[barrier_info],
            &[] as &[vk::BufferMemoryBarrier],
            &[] as &[vk::ImageMemoryBarrier],
        );
    }
}

/// Callable front-end for one kernel. Binds arguments, picks the immediate
/// or deferred protocol from the current device, and installs the
/// post-dispatch barrier.
pub struct WrappedFunction {
    module: Arc<ModuleInner>,
    func_name: String,
    num_buffer_args: usize,
    num_pack_args: usize,
    thread_axis: ThreadAxisConfig,
}

impl WrappedFunction {
    pub(crate) fn new(
        module: Arc<ModuleInner>,
        func_name: String,
        num_buffer_args: usize,
        num_pack_args: usize,
        thread_axis: ThreadAxisConfig,
    ) -> Self {
        Self {
            module,
            func_name,
            num_buffer_args,
            num_pack_args,
            thread_axis,
        }
    }

    pub fn name(&self) -> &str {
        &self.func_name
    }

    pub fn num_buffer_args(&self) -> usize {
        self.num_buffer_args
    }

    pub fn num_pack_args(&self) -> usize {
        self.num_pack_args
    }

    /// Number of trailing launch parameters expected by [`call`](Self::call).
    pub fn num_launch_params(&self) -> usize {
        self.thread_axis.len()
    }

    /// Dispatch the kernel on the calling thread's current device.
    ///
    /// `buffers` are the device-buffer arguments in ABI order, `pack_args`
    /// the marshalled POD scalars, and `launch_params` the extents for the
    /// kernel's thread axes.
    pub fn call(
        &self,
        buffers: &[&DeviceBuffer],
        pack_args: &[ArgUnion64],
        launch_params: &[u64],
    ) -> Result<(), VkrtError> {
        assert_eq!(buffers.len(), self.num_buffer_args, "buffer argument count");
        assert_eq!(pack_args.len(), self.num_pack_args, "POD argument count");
        let api = self.module.api.clone();
        ThreadEntry::with(&api, |entry| {
            let device_id = entry.device_id();
            assert!(device_id < MAX_DEVICES);
            let ctx = api.context(device_id).clone();
            let pipeline = self.module.get_pipeline(entry, device_id, &self.func_name)?;
            let wl = self.thread_axis.extract(launch_params);
            let grid = [wl.grid_dim(0), wl.grid_dim(1), wl.grid_dim(2)];
            debug_assert!(
                wl.block_dim(0) as u64 * wl.block_dim(1) as u64 * wl.block_dim(2) as u64
                    <= ctx.target.max_num_threads.max(1) as u64,
                "workgroup exceeds maxComputeWorkGroupInvocations"
            );

            let mut descriptor_buffers: Vec<vk::DescriptorBufferInfo> = buffers
                .iter()
                .map(|b| vk::DescriptorBufferInfo {
                    buffer: b.buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE as u64,
                })
                .collect();

            let nbytes_scalars = self.num_pack_args * std::mem::size_of::<ArgUnion64>();
            let ubo_host_ptr = if pipeline.use_ubo {
                let ubo = entry.uniform_buffer(device_id, nbytes_scalars as vk::DeviceSize);
                descriptor_buffers.push(vk::DescriptorBufferInfo {
                    buffer: ubo.buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE as u64,
                });
                Some(ubo.host_ptr())
            } else {
                None
            };

            // Deferred closures outlive this frame, so both protocols move
            // owned copies of the scalars and descriptor infos.
            let pack_storage: Vec<ArgUnion64> = pack_args.to_vec();

            if ctx.use_immediate() {
                let pipe = pipeline.clone();
                let push_ctx = ctx.clone();
                entry.stream(device_id)?.launch(move |device, cb| unsafe {
                    device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipe.pipeline);
                    push_ctx.cmd_push_descriptor_set_with_template(
                        cb,
                        pipe.descriptor_update_template,
                        pipe.pipeline_layout,
                        &descriptor_buffers,
                    );
                    if let Some(host_ptr) = ubo_host_ptr {
                        let bytes = bytemuck::cast_slice::<ArgUnion64, u8>(&pack_storage);
                        ptr::copy_nonoverlapping(bytes.as_ptr(), host_ptr, bytes.len());
                    } else if !pack_storage.is_empty() {
                        device.cmd_push_constants(
                            cb,
                            pipe.pipeline_layout,
                            vk::ShaderStageFlags::COMPUTE,
                            0,
                            bytemuck::cast_slice::<ArgUnion64, u8>(&pack_storage),
                        );
                    }
                    device.cmd_dispatch(cb, grid[0], grid[1], grid[2]);
                    post_dispatch_barrier(device, cb);
                })
            } else {
                let token = StreamToken {
                    descriptor_set: pipeline.descriptor_set,
                    buffers: descriptor_buffers.iter().map(|info| info.buffer).collect(),
                };

                let init_pipe = pipeline.clone();
                let init_ctx = ctx.clone();
                let infos = descriptor_buffers;
                let init = move || {
                    let writes: Vec<vk::WriteDescriptorSet> = infos
                        .iter()
                        .enumerate()
                        .map(|(i, info)| vk::WriteDescriptorSet {
                            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                            next: ptr::null(),
                            dst_set: init_pipe.descriptor_set,
                            dst_binding: i as u32,
                            dst_array_element: 0,
                            descriptor_count: 1,
                            descriptor_type: if init_pipe.use_ubo && i == infos.len() - 1 {
                                vk::DescriptorType::UNIFORM_BUFFER
                            } else {
                                vk::DescriptorType::STORAGE_BUFFER
                            },
                            image_info: ptr::null(),
                            buffer_info: info,
                            texel_buffer_view: ptr::null(),
                        })
                        .collect();
                    unsafe {
                        init_ctx
                            .device()
                            .update_descriptor_sets(&writes, &[] as &[vk::CopyDescriptorSet]);
                    }
                };

                let pipe = pipeline.clone();
                let kernel = move |device: &Device, cb: vk::CommandBuffer| unsafe {
                    device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipe.pipeline);
                    device.cmd_bind_descriptor_sets(
                        cb,
                        vk::PipelineBindPoint::COMPUTE,
                        pipe.pipeline_layout,
                        0,
                        &[pipe.descriptor_set],
                        &[],
                    );
                    if let Some(host_ptr) = ubo_host_ptr {
                        let bytes = bytemuck::cast_slice::<ArgUnion64, u8>(&pack_storage);
                        ptr::copy_nonoverlapping(bytes.as_ptr(), host_ptr, bytes.len());
                    } else if !pack_storage.is_empty() {
                        device.cmd_push_constants(
                            cb,
                            pipe.pipeline_layout,
                            vk::ShaderStageFlags::COMPUTE,
                            0,
                            bytemuck::cast_slice::<ArgUnion64, u8>(&pack_storage),
                        );
                    }
                    device.cmd_dispatch(cb, grid[0], grid[1], grid[2]);
                    post_dispatch_barrier(device, cb);
                };

                entry.stream(device_id)?.launch_deferred(init, kernel, token)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_slots_are_eight_bytes() {
        assert_eq!(std::mem::size_of::<ArgUnion64>(), 8);
        let args = [ArgUnion64::from_i32(7), ArgUnion64::from_f32(1.0)];
        let bytes = bytemuck::cast_slice::<ArgUnion64, u8>(&args);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn thirty_two_bit_values_fill_the_low_bytes() {
        let slot = ArgUnion64::from_u32(0x0403_0201);
        assert_eq!(slot.0, [1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(ArgUnion64::from_i32(-1).0[..4], [0xff; 4]);
        assert_eq!(ArgUnion64::from_i32(-1).0[4..], [0; 4]);
    }

    #[test]
    fn sixty_four_bit_values_fill_the_slot() {
        assert_eq!(
            ArgUnion64::from_u64(0x0807_0605_0403_0201).0,
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(
            ArgUnion64::from_f64(1.0).0,
            1.0f64.to_le_bytes()
        );
    }

    #[test]
    fn thread_axes_map_to_grid_and_block() {
        let tags: Vec<String> = ["blockIdx.x", "blockIdx.y", "threadIdx.x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cfg = ThreadAxisConfig::new(&tags);
        let wl = cfg.extract(&[16, 8, 64]);
        assert_eq!([wl.grid_dim(0), wl.grid_dim(1), wl.grid_dim(2)], [16, 8, 1]);
        assert_eq!(
            [wl.block_dim(0), wl.block_dim(1), wl.block_dim(2)],
            [64, 1, 1]
        );
    }

    #[test]
    fn missing_axes_default_to_one() {
        let cfg = ThreadAxisConfig::new(&[]);
        let wl = cfg.extract(&[]);
        for i in 0..3 {
            assert_eq!(wl.grid_dim(i), 1);
            assert_eq!(wl.block_dim(i), 1);
        }
    }

    #[test]
    #[should_panic]
    fn unknown_axis_tags_are_rejected() {
        ThreadAxisConfig::new(&["vthread.x".to_string()]);
    }
}
