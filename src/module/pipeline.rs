use std::ffi::CString;
use std::ptr;
use std::sync::Arc;

use vulkanalia::vk::{self, DeviceV1_0, Handle};

use crate::error::VkrtError;
use crate::gpu::context::DeviceContext;
use crate::gpu::thread_entry::ThreadEntry;

use super::wrapped::ArgUnion64;
use super::{ArgType, VulkanShader};

fn push_arg_info(
    bindings: &mut Vec<vk::DescriptorSetLayoutBinding>,
    template_entries: &mut Vec<vk::DescriptorUpdateTemplateEntry>,
    pool_sizes: &mut Vec<vk::DescriptorPoolSize>,
    binding: u32,
    descriptor_type: vk::DescriptorType,
) {
    match pool_sizes.iter_mut().find(|p| p.type_ == descriptor_type) {
        Some(psize) => psize.descriptor_count += 1,
        None => pool_sizes.push(vk::DescriptorPoolSize {
            type_: descriptor_type,
            descriptor_count: 1,
        }),
    }

    bindings.push(vk::DescriptorSetLayoutBinding {
        binding,
        descriptor_type,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::COMPUTE,
        immutable_samplers: ptr::null(),
    });

    template_entries.push(vk::DescriptorUpdateTemplateEntry {
        dst_binding: binding,
        dst_array_element: 0,
        descriptor_count: 1,
        descriptor_type,
        offset: binding as usize * std::mem::size_of::<vk::DescriptorBufferInfo>(),
        stride: std::mem::size_of::<vk::DescriptorBufferInfo>(),
    });
}

/// Everything needed to dispatch one kernel on one device, built lazily on
/// first use and cached by the owning module.
///
/// The update template exists iff the device runs the immediate protocol;
/// the descriptor pool and set exist iff it runs the deferred protocol.
pub struct VulkanPipeline {
    ctx: Arc<DeviceContext>,
    shader: vk::ShaderModule,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    pub(crate) descriptor_set: vk::DescriptorSet,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) descriptor_update_template: vk::DescriptorUpdateTemplate,
    pub(crate) use_ubo: bool,
}

impl VulkanPipeline {
    /// Build the pipeline bundle. On failure the partially built object is
    /// dropped, destroying whatever was created, in reverse creation order.
    pub(crate) fn build(
        ctx: Arc<DeviceContext>,
        entry: &mut ThreadEntry,
        shader: &VulkanShader,
        arg_types: &[ArgType],
        func_name: &str,
    ) -> Result<Self, VkrtError> {
        let mut pe = VulkanPipeline {
            ctx: ctx.clone(),
            shader: vk::ShaderModule::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_update_template: vk::DescriptorUpdateTemplate::null(),
            use_ubo: shader.use_ubo(),
        };

        unsafe {
            let shader_info = vk::ShaderModuleCreateInfo {
                s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
                next: ptr::null(),
                flags: vk::ShaderModuleCreateFlags::empty(),
                code_size: shader.data.len() * std::mem::size_of::<u32>(),
                code: shader.data.as_ptr(),
            };
            pe.shader = ctx.device().create_shader_module(&shader_info, None)?;

            // One storage-buffer binding per opaque-handle argument, at
            // sequential binding indices; POD arguments only count.
            let mut bindings = Vec::new();
            let mut template_entries = Vec::new();
            let mut pool_sizes = Vec::new();
            let mut num_buffer = 0u32;
            let mut num_pod = 0usize;
            for arg_type in arg_types {
                if arg_type.is_handle() {
                    push_arg_info(
                        &mut bindings,
                        &mut template_entries,
                        &mut pool_sizes,
                        num_buffer,
                        vk::DescriptorType::STORAGE_BUFFER,
                    );
                    num_buffer += 1;
                } else {
                    num_pod += 1;
                }
            }

            let nbytes_scalars = num_pod * std::mem::size_of::<ArgUnion64>();
            if pe.use_ubo {
                // Scalars travel through a uniform buffer at the binding
                // after the storage buffers; make sure the per-thread UBO
                // can hold them.
                push_arg_info(
                    &mut bindings,
                    &mut template_entries,
                    &mut pool_sizes,
                    num_buffer,
                    vk::DescriptorType::UNIFORM_BUFFER,
                );
                entry.allocate_uniform_buffer(ctx.device_id, nbytes_scalars as vk::DeviceSize)?;
            }

            let mut layout_flags = vk::DescriptorSetLayoutCreateFlags::empty();
            if ctx.use_immediate() {
                layout_flags |= vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR;
            }
            let layout_info = vk::DescriptorSetLayoutCreateInfo {
                s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
                next: ptr::null(),
                flags: layout_flags,
                binding_count: bindings.len() as u32,
                bindings: bindings.as_ptr(),
            };
            pe.descriptor_set_layout = ctx
                .device()
                .create_descriptor_set_layout(&layout_info, None)?;

            if !ctx.use_immediate() {
                let pool_info = vk::DescriptorPoolCreateInfo {
                    s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
                    next: ptr::null(),
                    flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
                    max_sets: 1,
                    pool_size_count: pool_sizes.len() as u32,
                    pool_sizes: pool_sizes.as_ptr(),
                };
                pe.descriptor_pool = ctx.device().create_descriptor_pool(&pool_info, None)?;

                let alloc_info = vk::DescriptorSetAllocateInfo {
                    s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
                    next: ptr::null(),
                    descriptor_pool: pe.descriptor_pool,
                    descriptor_set_count: 1,
                    set_layouts: &pe.descriptor_set_layout,
                };
                pe.descriptor_set = ctx.device().allocate_descriptor_sets(&alloc_info)?[0];
            }

            let push_constant_range = vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::COMPUTE,
                offset: 0,
                size: nbytes_scalars as u32,
            };
            let use_push_constants = nbytes_scalars > 0 && !pe.use_ubo;
            if use_push_constants {
                assert!(
                    push_constant_range.size <= ctx.target.max_push_constants_size,
                    "Kernel {} needs {} bytes of push constants, device limit is {}",
                    func_name,
                    push_constant_range.size,
                    ctx.target.max_push_constants_size
                );
            }
            let layout_info = vk::PipelineLayoutCreateInfo {
                s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
                next: ptr::null(),
                flags: vk::PipelineLayoutCreateFlags::empty(),
                set_layout_count: 1,
                set_layouts: &pe.descriptor_set_layout,
                push_constant_range_count: use_push_constants as u32,
                push_constant_ranges: if use_push_constants {
                    &push_constant_range
                } else {
                    ptr::null()
                },
            };
            pe.pipeline_layout = ctx.device().create_pipeline_layout(&layout_info, None)?;

            let entry_point = CString::new(func_name).unwrap();
            let pipeline_info = vk::ComputePipelineCreateInfo {
                s_type: vk::StructureType::COMPUTE_PIPELINE_CREATE_INFO,
                next: ptr::null(),
                flags: vk::PipelineCreateFlags::empty(),
                stage: vk::PipelineShaderStageCreateInfo {
                    s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                    next: ptr::null(),
                    flags: vk::PipelineShaderStageCreateFlags::empty(),
                    stage: vk::ShaderStageFlags::COMPUTE,
                    module: pe.shader,
                    name: entry_point.as_ptr(),
                    specialization_info: ptr::null(),
                },
                layout: pe.pipeline_layout,
                base_pipeline_handle: vk::Pipeline::null(),
                base_pipeline_index: 0,
            };
            pe.pipeline = ctx
                .device()
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)?
                .0[0];

            if ctx.use_immediate() {
                let template_info = vk::DescriptorUpdateTemplateCreateInfo {
                    s_type: vk::StructureType::DESCRIPTOR_UPDATE_TEMPLATE_CREATE_INFO,
                    next: ptr::null(),
                    flags: vk::DescriptorUpdateTemplateCreateFlags::empty(),
                    descriptor_update_entry_count: template_entries.len() as u32,
                    descriptor_update_entries: template_entries.as_ptr(),
                    template_type: vk::DescriptorUpdateTemplateType::PUSH_DESCRIPTORS,
                    descriptor_set_layout: pe.descriptor_set_layout,
                    pipeline_bind_point: vk::PipelineBindPoint::COMPUTE,
                    pipeline_layout: pe.pipeline_layout,
                    set: 0,
                };
                pe.descriptor_update_template =
                    ctx.create_descriptor_update_template(&template_info)?;
            }
        }

        Ok(pe)
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            let device = self.ctx.device();
            if self.descriptor_update_template != vk::DescriptorUpdateTemplate::null() {
                self.ctx
                    .destroy_descriptor_update_template(self.descriptor_update_template);
            }
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                // also returns the descriptor set
                device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            }
            if self.shader != vk::ShaderModule::null() {
                device.destroy_shader_module(self.shader, None);
            }
        }
    }
}
