use std::ffi::{CStr, CString, c_void};
use std::os::raw::c_char;
use std::ptr;
use std::sync::{Arc, Mutex};

use vulkanalia::{
    Device,
    vk::{self, DeviceV1_0, Handle, InstanceV1_0},
};

use crate::error::VkrtError;

use super::device_api::RawInstance;
use super::memory::{
    first_matching_memory_type, select_compute_memory_type, select_staging_memory_type,
};
use super::target::{Target, describe_device};

/// Device extensions enabled when the driver offers them.
const OPTIONAL_DEVICE_EXTENSIONS: &[&str] = &[
    "VK_KHR_driver_properties",
    "VK_KHR_storage_buffer_storage_class",
    "VK_KHR_8bit_storage",
    "VK_KHR_16bit_storage",
    "VK_KHR_shader_float16_int8",
    "VK_KHR_push_descriptor",
    "VK_KHR_descriptor_update_template",
    "VK_KHR_get_memory_requirements2",
    "VK_KHR_dedicated_allocation",
    "VK_KHR_spirv_1_4",
];

/// Prefer compute-only queue families; fall back to compute+graphics.
/// On devices exposing both (e.g. Mesa RADV) the compute-only family keeps
/// desktop graphics workloads responsive.
pub(crate) fn select_queue_family(props: &[vk::QueueFamilyProperties]) -> Option<u32> {
    let compute_only = props.iter().position(|p| {
        p.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !p.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    });
    compute_only
        .or_else(|| {
            props
                .iter()
                .position(|p| p.queue_flags.contains(vk::QueueFlags::COMPUTE))
        })
        .map(|i| i as u32)
}

fn probe_type_bits(device: &Device, usage: vk::BufferUsageFlags) -> Result<u32, VkrtError> {
    unsafe {
        let info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            next: ptr::null(),
            flags: vk::BufferCreateFlags::empty(),
            size: 1024,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_family_index_count: 0,
            queue_family_indices: ptr::null(),
        };
        let buffer = device.create_buffer(&info, None)?;
        let reqs = device.get_buffer_memory_requirements(buffer);
        device.destroy_buffer(buffer, None);
        Ok(reqs.memory_type_bits)
    }
}

/// Per-physical-device state. Immutable after init except for the queue
/// mutex, which serializes submits from different threads.
pub struct DeviceContext {
    pub device_id: usize,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub queue_family_index: u32,
    pub staging_mtype_index: u32,
    pub compute_mtype_index: u32,
    pub coherent_staging: bool,
    use_immediate: bool,
    use_dedicated: bool,
    pub target: Target,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue: vk::Queue,
    queue_mutex: Mutex<()>,
    device: Device,
    // keeps the instance alive until after the device is destroyed
    _instance: Arc<RawInstance>,
}

impl DeviceContext {
    /// Build the context for one physical device. Returns `Ok(None)` when the
    /// device has no compute queue family.
    pub(crate) fn new(
        raw_instance: &Arc<RawInstance>,
        device_id: usize,
        physical_device: vk::PhysicalDevice,
        instance_extensions: &[String],
        has_properties2: bool,
    ) -> Result<Option<Self>, VkrtError> {
        let instance = &raw_instance.handle;
        unsafe {
            let queue_families =
                instance.get_physical_device_queue_family_properties(physical_device);
            let Some(queue_family_index) = select_queue_family(&queue_families) else {
                return Ok(None);
            };

            let ext_props =
                instance.enumerate_device_extension_properties(physical_device, None)?;
            let available: Vec<String> = ext_props
                .iter()
                .filter(|p| p.spec_version > 0)
                .map(|p| {
                    CStr::from_ptr(p.extension_name.as_ptr())
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();
            let device_extensions: Vec<String> = OPTIONAL_DEVICE_EXTENSIONS
                .iter()
                .filter(|e| available.iter().any(|a| a == *e))
                .map(|e| e.to_string())
                .collect();

            let target = describe_device(
                instance,
                physical_device,
                has_properties2,
                instance_extensions,
                &device_extensions,
            );

            let queue_info = vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                next: ptr::null(),
                flags: vk::DeviceQueueCreateFlags::empty(),
                queue_family_index,
                queue_count: 1,
                queue_priorities: &1.0f32,
            };

            // Enable every feature the capability map declared. The structs
            // must stay alive until after create_device returns.
            let mut enabled_features = vk::PhysicalDeviceFeatures2 {
                s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
                next: ptr::null_mut(),
                features: Default::default(),
            };
            let mut storage_8bit = vk::PhysicalDevice8BitStorageFeatures {
                s_type: vk::StructureType::PHYSICAL_DEVICE_8BIT_STORAGE_FEATURES,
                next: ptr::null_mut(),
                ..Default::default()
            };
            let mut storage_16bit = vk::PhysicalDevice16BitStorageFeatures {
                s_type: vk::StructureType::PHYSICAL_DEVICE_16BIT_STORAGE_FEATURES,
                next: ptr::null_mut(),
                ..Default::default()
            };
            let mut float16_int8 = vk::PhysicalDeviceShaderFloat16Int8Features {
                s_type: vk::StructureType::PHYSICAL_DEVICE_SHADER_FLOAT16_INT8_FEATURES,
                next: ptr::null_mut(),
                ..Default::default()
            };

            let mut needs_float16_int8 = false;
            if target.supports_float16 {
                float16_int8.shader_float16 = vk::TRUE;
                needs_float16_int8 = true;
            }
            if target.supports_int8 {
                float16_int8.shader_int8 = vk::TRUE;
                needs_float16_int8 = true;
            }
            if target.supports_float64 {
                enabled_features.features.shader_float64 = vk::TRUE;
            }
            if target.supports_int16 {
                enabled_features.features.shader_int16 = vk::TRUE;
            }
            if target.supports_int64 {
                enabled_features.features.shader_int64 = vk::TRUE;
            }
            let mut tail: *mut *mut c_void = &mut enabled_features.next;
            if target.supports_8bit_buffer {
                storage_8bit.storage_buffer_8bit_access = vk::TRUE;
                *tail = &mut storage_8bit as *mut _ as *mut c_void;
                tail = &mut storage_8bit.next;
            }
            if target.supports_16bit_buffer {
                storage_16bit.storage_buffer_16bit_access = vk::TRUE;
                *tail = &mut storage_16bit as *mut _ as *mut c_void;
                tail = &mut storage_16bit.next;
            }
            if needs_float16_int8 {
                *tail = &mut float16_int8 as *mut _ as *mut c_void;
            }

            let ext_names: Vec<CString> = device_extensions
                .iter()
                .map(|e| CString::new(e.as_str()).unwrap())
                .collect();
            let ext_name_ptrs: Vec<*const c_char> =
                ext_names.iter().map(|s| s.as_ptr()).collect();

            let device_create_info = vk::DeviceCreateInfo {
                s_type: vk::StructureType::DEVICE_CREATE_INFO,
                next: if has_properties2 {
                    &enabled_features as *const _ as *const c_void
                } else {
                    ptr::null()
                },
                flags: vk::DeviceCreateFlags::empty(),
                queue_create_info_count: 1,
                queue_create_infos: &queue_info,
                enabled_layer_count: 0,
                enabled_layer_names: ptr::null(),
                enabled_extension_count: ext_name_ptrs.len() as u32,
                enabled_extension_names: if ext_name_ptrs.is_empty() {
                    ptr::null()
                } else {
                    ext_name_ptrs.as_ptr()
                },
                enabled_features: if has_properties2 {
                    ptr::null()
                } else {
                    &enabled_features.features
                },
            };

            let device = instance.create_device(physical_device, &device_create_info, None)?;
            let queue = device.get_device_queue(queue_family_index, 0);

            let memory_properties =
                instance.get_physical_device_memory_properties(physical_device);

            // Probe memoryTypeBits once for staging usage and once for
            // compute usage, then rank candidates.
            let selected = (|| -> Result<(u32, bool, u32), VkrtError> {
                let staging_bits = probe_type_bits(
                    &device,
                    vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                )?;
                let compute_bits = probe_type_bits(
                    &device,
                    vk::BufferUsageFlags::TRANSFER_SRC
                        | vk::BufferUsageFlags::TRANSFER_DST
                        | vk::BufferUsageFlags::STORAGE_BUFFER,
                )?;
                let (staging_index, coherent) =
                    select_staging_memory_type(&memory_properties, staging_bits).ok_or_else(
                        || {
                            VkrtError::DeviceInit(
                                "Cannot find suitable staging memory on device".into(),
                            )
                        },
                    )?;
                let compute_index = select_compute_memory_type(&memory_properties, compute_bits)
                    .ok_or_else(|| {
                        VkrtError::DeviceInit(
                            "Cannot find suitable device-local memory on device".into(),
                        )
                    })?;
                Ok((staging_index, coherent, compute_index))
            })();
            let (staging_mtype_index, coherent_staging, compute_mtype_index) = match selected {
                Ok(v) => v,
                Err(e) => {
                    device.destroy_device(None);
                    return Err(e);
                }
            };

            let use_immediate = target.supports_push_descriptor;
            let use_dedicated = target.supports_dedicated_allocation;

            Ok(Some(Self {
                device_id,
                physical_device,
                queue_family_index,
                staging_mtype_index,
                compute_mtype_index,
                coherent_staging,
                use_immediate,
                use_dedicated,
                target,
                memory_properties,
                queue,
                queue_mutex: Mutex::new(()),
                device,
                _instance: raw_instance.clone(),
            }))
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// True when kernel launches use the push-descriptor fast path. When
    /// false the deferred protocol with preallocated descriptor sets is used.
    pub fn use_immediate(&self) -> bool {
        self.use_immediate
    }

    pub fn use_dedicated_allocation(&self) -> bool {
        self.use_dedicated
    }

    /// Submit one command buffer on the device queue. The queue mutex is the
    /// only cross-thread contention point in the runtime.
    pub(crate) fn queue_submit(
        &self,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> Result<(), VkrtError> {
        let submit_info = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            next: ptr::null(),
            wait_semaphore_count: 0,
            wait_semaphores: ptr::null(),
            wait_dst_stage_mask: ptr::null(),
            command_buffer_count: 1,
            command_buffers: &command_buffer,
            signal_semaphore_count: 0,
            signal_semaphores: ptr::null(),
        };
        let _guard = self.queue_mutex.lock().unwrap();
        unsafe {
            self.device.queue_submit(self.queue, &[submit_info], fence)?;
        }
        Ok(())
    }

    /// Memory type for an ad-hoc host-visible buffer (the UBO path), chosen
    /// from a probe buffer with the requested usage.
    pub(crate) fn probe_memory_type(
        &self,
        usage: vk::BufferUsageFlags,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32, VkrtError> {
        let bits = probe_type_bits(&self.device, usage)?;
        first_matching_memory_type(&self.memory_properties, bits, required).ok_or_else(|| {
            VkrtError::DeviceInit(format!(
                "No memory type with properties {:?} on device {}",
                required, self.device_id
            ))
        })
    }

    /// Dedicated-allocation query through VK_KHR_get_memory_requirements2.
    pub(crate) fn buffer_dedicated_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> (vk::DeviceSize, bool) {
        debug_assert!(self.use_dedicated);
        unsafe {
            let mut dedicated = vk::MemoryDedicatedRequirements {
                s_type: vk::StructureType::MEMORY_DEDICATED_REQUIREMENTS,
                next: ptr::null_mut(),
                ..Default::default()
            };
            let mut reqs = vk::MemoryRequirements2 {
                s_type: vk::StructureType::MEMORY_REQUIREMENTS_2,
                next: &mut dedicated as *mut _ as *mut c_void,
                ..Default::default()
            };
            let info = vk::BufferMemoryRequirementsInfo2 {
                s_type: vk::StructureType::BUFFER_MEMORY_REQUIREMENTS_INFO_2,
                next: ptr::null(),
                buffer,
            };
            let fp = self.device.commands().get_buffer_memory_requirements2_khr;
            fp(self.device.handle(), &info, &mut reqs);
            (
                reqs.memory_requirements.size,
                dedicated.requires_dedicated_allocation != 0
                    || dedicated.prefers_dedicated_allocation != 0,
            )
        }
    }

    /// Create a push-descriptor update template through the KHR entry point.
    pub(crate) fn create_descriptor_update_template(
        &self,
        info: &vk::DescriptorUpdateTemplateCreateInfo,
    ) -> Result<vk::DescriptorUpdateTemplate, VkrtError> {
        assert!(self.use_immediate);
        unsafe {
            let mut template = vk::DescriptorUpdateTemplate::null();
            let fp = self.device.commands().create_descriptor_update_template_khr;
            let code = fp(self.device.handle(), info, ptr::null(), &mut template);
            if code != vk::Result::SUCCESS {
                return Err(VkrtError::Vulkan(format!(
                    "vkCreateDescriptorUpdateTemplateKHR: {:?}",
                    code
                )));
            }
            Ok(template)
        }
    }

    pub(crate) fn destroy_descriptor_update_template(
        &self,
        template: vk::DescriptorUpdateTemplate,
    ) {
        unsafe {
            let fp = self.device.commands().destroy_descriptor_update_template_khr;
            fp(self.device.handle(), template, ptr::null());
        }
    }

    /// Record descriptor writes straight into the command buffer through the
    /// update template (immediate protocol only).
    pub(crate) fn cmd_push_descriptor_set_with_template(
        &self,
        command_buffer: vk::CommandBuffer,
        template: vk::DescriptorUpdateTemplate,
        layout: vk::PipelineLayout,
        buffer_infos: &[vk::DescriptorBufferInfo],
    ) {
        assert!(self.use_immediate);
        unsafe {
            let fp = self
                .device
                .commands()
                .cmd_push_descriptor_set_with_template_khr;
            fp(
                command_buffer,
                template,
                layout,
                0,
                buffer_infos.as_ptr() as *const c_void,
            );
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        tracing::debug!(
            "destroying vulkan device {} ({})",
            self.device_id,
            self.target.device_name
        );
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn queue_selection_prefers_compute_only() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_family(&families), Some(1));
    }

    #[test]
    fn queue_selection_falls_back_to_graphics_compute() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(select_queue_family(&families), Some(1));
    }

    #[test]
    fn devices_without_compute_are_skipped() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        assert_eq!(select_queue_family(&families), None);
    }
}
