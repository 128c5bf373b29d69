use std::ffi::{CStr, CString, c_char};
use std::ptr;
use std::sync::Arc;

use vulkanalia::{
    Entry, Instance,
    loader::{LIBRARY, LibloadingLoader},
    vk::{self, DeviceV1_0, EntryV1_0, InstanceV1_0},
};

use crate::error::VkrtError;

use super::context::DeviceContext;
use super::memory::DeviceBuffer;
use super::target::{ENV_ENABLE_VALIDATION, Target, env_flag, version_string};
use super::thread_entry::ThreadEntry;

/// Upper bound on initialized devices; per-module pipeline caches are sized
/// against it.
pub const MAX_DEVICES: usize = 8;

const PROPERTIES2_EXTENSION: &str = "VK_KHR_get_physical_device_properties2";

/// Device attribute kinds answered by [`DeviceApi::get_attr`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceAttr {
    Exist,
    MaxThreadsPerBlock,
    MaxSharedMemoryPerBlock,
    WarpSize,
    ComputeVersion,
    DeviceName,
    MaxClockRate,
    MultiProcessorCount,
    MaxThreadDimensions,
    MaxRegistersPerBlock,
    ApiVersion,
    DriverVersion,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    None,
    Int(i64),
    Str(String),
}

/// Owner of the process-wide `VkInstance` and the loader entry. Destroyed
/// only after every device context has released its reference, so
/// `vkDestroyInstance` always runs after the last `vkDestroyDevice`.
pub(crate) struct RawInstance {
    pub(crate) handle: Instance,
    _entry: Entry,
}

impl Drop for RawInstance {
    fn drop(&mut self) {
        tracing::debug!("destroying vulkan instance");
        unsafe {
            self.handle.destroy_instance(None);
        }
    }
}

/// Pick instance layers: validation only when the env flag asks for it,
/// preferring the Khronos layer over the legacy LunarG pair.
fn select_validation_layers(available: &[String], validation_requested: bool) -> Vec<String> {
    if !validation_requested {
        return Vec::new();
    }
    if available.iter().any(|l| l == "VK_LAYER_KHRONOS_validation") {
        return vec!["VK_LAYER_KHRONOS_validation".to_string()];
    }
    ["VK_LAYER_LUNARG_standard_validation", "VK_LAYER_LUNARG_parameter_validation"]
        .iter()
        .filter(|l| available.iter().any(|a| a == *l))
        .map(|l| l.to_string())
        .collect()
}

/// The device-API facade: owns the Vulkan instance and one context per
/// usable device, and exposes allocation, copy, synchronization, and
/// attribute queries. Per-thread stream and cache state lives in
/// [`ThreadEntry`]; this type is shared across threads behind an `Arc`.
///
/// The value must be dropped (not leaked) at shutdown: some drivers crash at
/// process exit unless `vkDestroyInstance` ran.
pub struct DeviceApi {
    contexts: Vec<Arc<DeviceContext>>,
    instance_api_version: u32,
    _instance: Arc<RawInstance>,
}

impl DeviceApi {
    pub fn new() -> Result<Arc<Self>, VkrtError> {
        unsafe {
            let loader = LibloadingLoader::new(LIBRARY)
                .map_err(|e| VkrtError::Loader(format!("{:?}", e)))?;
            let entry =
                Entry::new(loader).map_err(|e| VkrtError::Loader(format!("{:?}", e)))?;

            let available_layers: Vec<String> = entry
                .enumerate_instance_layer_properties()?
                .iter()
                .map(|lp| {
                    CStr::from_ptr(lp.layer_name.as_ptr())
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();
            let layers =
                select_validation_layers(&available_layers, env_flag(ENV_ENABLE_VALIDATION));

            let available_extensions: Vec<String> = entry
                .enumerate_instance_extension_properties(None)?
                .iter()
                .filter(|p| p.spec_version > 0)
                .map(|p| {
                    CStr::from_ptr(p.extension_name.as_ptr())
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();
            let instance_extensions: Vec<String> = available_extensions
                .iter()
                .filter(|e| e.as_str() == PROPERTIES2_EXTENSION)
                .cloned()
                .collect();
            let has_properties2 = !instance_extensions.is_empty();

            // Missing entry point means a Vulkan 1.0 loader.
            let instance_api_version = entry
                .version()
                .map(|v| vk::make_version(v.major, v.minor, v.patch))
                .unwrap_or(vk::make_version(1, 0, 0));

            let aname = CString::new("vkrt").unwrap();
            let app_info = vk::ApplicationInfo {
                s_type: vk::StructureType::APPLICATION_INFO,
                next: ptr::null(),
                application_name: aname.as_ptr(),
                application_version: 0,
                engine_name: aname.as_ptr(),
                engine_version: 0,
                api_version: instance_api_version,
            };

            let layer_names: Vec<CString> = layers
                .iter()
                .map(|l| CString::new(l.as_str()).unwrap())
                .collect();
            let layer_ptrs: Vec<*const c_char> =
                layer_names.iter().map(|s| s.as_ptr()).collect();
            let ext_names: Vec<CString> = instance_extensions
                .iter()
                .map(|e| CString::new(e.as_str()).unwrap())
                .collect();
            let ext_ptrs: Vec<*const c_char> = ext_names.iter().map(|s| s.as_ptr()).collect();

            let create_info = vk::InstanceCreateInfo {
                s_type: vk::StructureType::INSTANCE_CREATE_INFO,
                next: ptr::null(),
                flags: vk::InstanceCreateFlags::empty(),
                application_info: &app_info,
                enabled_layer_count: layer_ptrs.len() as u32,
                enabled_layer_names: if layer_ptrs.is_empty() {
                    ptr::null()
                } else {
                    layer_ptrs.as_ptr()
                },
                enabled_extension_count: ext_ptrs.len() as u32,
                enabled_extension_names: if ext_ptrs.is_empty() {
                    ptr::null()
                } else {
                    ext_ptrs.as_ptr()
                },
            };

            let instance = Arc::new(RawInstance {
                handle: entry.create_instance(&create_info, None)?,
                _entry: entry,
            });

            let physical_devices = instance.handle.enumerate_physical_devices()?;
            let mut contexts = Vec::new();
            for physical_device in physical_devices {
                if contexts.len() == MAX_DEVICES {
                    tracing::warn!("more than {} vulkan devices, ignoring the rest", MAX_DEVICES);
                    break;
                }
                if let Some(ctx) = DeviceContext::new(
                    &instance,
                    contexts.len(),
                    physical_device,
                    &instance_extensions,
                    has_properties2,
                )? {
                    contexts.push(Arc::new(ctx));
                }
            }

            tracing::info!("initialized vulkan with {} devices", contexts.len());
            for ctx in &contexts {
                tracing::info!(
                    "vulkan({})='{}' use_immediate={}",
                    ctx.device_id,
                    ctx.target.device_name,
                    ctx.use_immediate()
                );
            }

            Ok(Arc::new(Self {
                contexts,
                instance_api_version,
                _instance: instance,
            }))
        }
    }

    pub fn num_devices(&self) -> usize {
        self.contexts.len()
    }

    pub fn context(&self, device_id: usize) -> &Arc<DeviceContext> {
        self.contexts
            .get(device_id)
            .unwrap_or_else(|| panic!("Invalid device id {}", device_id))
    }

    /// Capability map for a device, for the kernel compiler.
    pub fn generate_target(&self, device_id: usize) -> Target {
        self.context(device_id).target.clone()
    }

    /// Select the device used by subsequent kernel launches on this thread.
    pub fn set_device(self: &Arc<Self>, device_id: usize) {
        ThreadEntry::with(self, |entry| entry.set_device(device_id));
    }

    pub fn get_attr(&self, device_id: usize, kind: DeviceAttr) -> AttrValue {
        if kind == DeviceAttr::Exist {
            return AttrValue::Int((device_id < self.contexts.len()) as i64);
        }
        let target = &self.context(device_id).target;
        match kind {
            DeviceAttr::Exist => unreachable!(),
            DeviceAttr::MaxThreadsPerBlock => AttrValue::Int(target.max_num_threads as i64),
            DeviceAttr::MaxSharedMemoryPerBlock => {
                AttrValue::Int(target.max_shared_memory_per_block as i64)
            }
            DeviceAttr::WarpSize => AttrValue::Int(target.thread_warp_size as i64),
            DeviceAttr::ComputeVersion => {
                AttrValue::Str(version_string(target.vulkan_api_version))
            }
            DeviceAttr::DeviceName => AttrValue::Str(target.device_name.clone()),
            DeviceAttr::MaxClockRate => AttrValue::None,
            DeviceAttr::MultiProcessorCount => AttrValue::None,
            DeviceAttr::MaxThreadDimensions => AttrValue::Str(format!(
                "[{}, {}, {}]",
                target.max_block_size[0], target.max_block_size[1], target.max_block_size[2]
            )),
            DeviceAttr::MaxRegistersPerBlock => AttrValue::None,
            DeviceAttr::ApiVersion => AttrValue::Int(self.instance_api_version as i64),
            DeviceAttr::DriverVersion => AttrValue::Str(version_string(target.driver_version)),
        }
    }

    /// Allocate tensor storage on the device's compute memory type.
    /// Zero-byte requests are promoted to one byte.
    pub fn alloc_data_space(
        &self,
        device_id: usize,
        nbytes: vk::DeviceSize,
    ) -> Result<DeviceBuffer, VkrtError> {
        // Vulkan misbehaves on zero-size allocations
        let nbytes = nbytes.max(1);
        let ctx = self.context(device_id).clone();
        let mem_type_index = ctx.compute_mtype_index;
        DeviceBuffer::new(
            ctx,
            nbytes,
            vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::STORAGE_BUFFER,
            mem_type_index,
        )
    }

    /// Free a device buffer. The calling thread's stream on the owning
    /// device is synchronized first so no in-flight command still references
    /// the buffer.
    pub fn free_data_space(self: &Arc<Self>, buffer: DeviceBuffer) -> Result<(), VkrtError> {
        let device_id = buffer.device_id();
        ThreadEntry::with(self, |entry| entry.stream(device_id)?.synchronize())?;
        drop(buffer);
        Ok(())
    }

    /// Device-to-device copy on one device, with a transfer→(transfer|compute)
    /// barrier so later kernels and copies observe the write.
    pub fn copy_device_to_device(
        self: &Arc<Self>,
        src: &DeviceBuffer,
        src_offset: vk::DeviceSize,
        dst: &DeviceBuffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), VkrtError> {
        assert_eq!(
            src.device_id(),
            dst.device_id(),
            "Cross-device copies are not supported"
        );
        if size == 0 {
            return Ok(());
        }
        let (src_buf, dst_buf) = (src.buffer, dst.buffer);
        ThreadEntry::with(self, |entry| {
            entry.stream(src.device_id())?.launch(move |device, cb| unsafe {
                let copy_info = vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                };
                device.cmd_copy_buffer(cb, src_buf, dst_buf, &[copy_info]);

                let barrier_info = vk::MemoryBarrier {
                    s_type: vk::StructureType::MEMORY_BARRIER,
                    next: ptr::null(),
                    src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access_mask: vk::AccessFlags::TRANSFER_READ
                        | vk::AccessFlags::TRANSFER_WRITE
                        | vk::AccessFlags::SHADER_READ
                        | vk::AccessFlags::SHADER_WRITE,
                };
                device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[barrier_info],
                    &[] as &[vk::BufferMemoryBarrier],
                    &[] as &[vk::ImageMemoryBarrier],
                );
            })
        })
    }

    /// Host-to-device copy through the thread's staging buffer: memcpy into
    /// the mapping, flush when staging memory is non-coherent, then a
    /// host→transfer barrier, the copy, and a synchronize.
    pub fn copy_host_to_device(
        self: &Arc<Self>,
        src: &[u8],
        dst: &DeviceBuffer,
        dst_offset: vk::DeviceSize,
    ) -> Result<(), VkrtError> {
        if src.is_empty() {
            return Ok(());
        }
        let device_id = dst.device_id();
        let size = src.len() as vk::DeviceSize;
        let coherent = self.context(device_id).coherent_staging;
        let dst_buf = dst.buffer;
        ThreadEntry::with(self, |entry| {
            let staging_buf = {
                let staging = entry.staging_buffer(device_id, size)?;
                staging.write_bytes(0, src);
                if !coherent {
                    staging.flush()?;
                }
                staging.buffer
            };
            let stream = entry.stream(device_id)?;
            stream.launch(move |device, cb| unsafe {
                let barrier_info = vk::MemoryBarrier {
                    s_type: vk::StructureType::MEMORY_BARRIER,
                    next: ptr::null(),
                    src_access_mask: vk::AccessFlags::empty(),
                    dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                };
                device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[barrier_info],
                    &[] as &[vk::BufferMemoryBarrier],
                    &[] as &[vk::ImageMemoryBarrier],
                );
                let copy_info = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset,
                    size,
                };
                device.cmd_copy_buffer(cb, staging_buf, dst_buf, &[copy_info]);
            })?;
            stream.synchronize()
        })
    }

    /// Device-to-host copy through the thread's staging buffer: record the
    /// copy, synchronize, invalidate the mapping when staging memory is
    /// non-coherent, then memcpy out.
    pub fn copy_device_to_host(
        self: &Arc<Self>,
        src: &DeviceBuffer,
        src_offset: vk::DeviceSize,
        dst: &mut [u8],
    ) -> Result<(), VkrtError> {
        if dst.is_empty() {
            return Ok(());
        }
        let device_id = src.device_id();
        let size = dst.len() as vk::DeviceSize;
        let coherent = self.context(device_id).coherent_staging;
        let src_buf = src.buffer;
        ThreadEntry::with(self, |entry| {
            let staging_buf = entry.staging_buffer(device_id, size)?.buffer;
            let stream = entry.stream(device_id)?;
            stream.launch(move |device, cb| unsafe {
                let copy_info = vk::BufferCopy {
                    src_offset,
                    dst_offset: 0,
                    size,
                };
                device.cmd_copy_buffer(cb, src_buf, staging_buf, &[copy_info]);
            })?;
            stream.synchronize()?;
            let staging = entry.staging_buffer(device_id, size)?;
            if !coherent {
                staging.invalidate()?;
            }
            staging.read_bytes(0, dst);
            Ok(())
        })
    }

    /// Block until all work submitted on the calling thread's stream for the
    /// device has completed.
    pub fn stream_sync(self: &Arc<Self>, device_id: usize) -> Result<(), VkrtError> {
        ThreadEntry::with(self, |entry| entry.stream(device_id)?.synchronize())
    }

    /// There is one stream per (thread, device), so ordering between "two
    /// streams" always holds.
    pub fn sync_stream_from_to(self: &Arc<Self>, _device_id: usize) {}

    /// Short-lived kernel scratch space from the calling thread's pool.
    pub fn alloc_workspace(
        self: &Arc<Self>,
        device_id: usize,
        nbytes: vk::DeviceSize,
    ) -> Result<DeviceBuffer, VkrtError> {
        ThreadEntry::with(self, |entry| entry.alloc_workspace(device_id, nbytes))
    }

    pub fn free_workspace(self: &Arc<Self>, buffer: DeviceBuffer) {
        ThreadEntry::with(self, |entry| entry.free_workspace(buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_layers_prefer_khronos() {
        let available = vec![
            "VK_LAYER_LUNARG_standard_validation".to_string(),
            "VK_LAYER_KHRONOS_validation".to_string(),
        ];
        assert_eq!(
            select_validation_layers(&available, true),
            vec!["VK_LAYER_KHRONOS_validation".to_string()]
        );
    }

    #[test]
    fn validation_layers_fall_back_to_lunarg() {
        let available = vec![
            "VK_LAYER_LUNARG_parameter_validation".to_string(),
            "VK_LAYER_LUNARG_standard_validation".to_string(),
        ];
        assert_eq!(
            select_validation_layers(&available, true),
            vec![
                "VK_LAYER_LUNARG_standard_validation".to_string(),
                "VK_LAYER_LUNARG_parameter_validation".to_string()
            ]
        );
    }

    #[test]
    fn validation_layers_require_the_env_flag() {
        let available = vec!["VK_LAYER_KHRONOS_validation".to_string()];
        assert!(select_validation_layers(&available, false).is_empty());
        assert!(select_validation_layers(&[], true).is_empty());
    }
}
