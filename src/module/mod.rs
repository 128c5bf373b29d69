pub mod pipeline;
pub mod saveload;
pub mod wrapped;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::VkrtError;
use crate::gpu::device_api::{DeviceApi, MAX_DEVICES};
use crate::gpu::thread_entry::ThreadEntry;

use pipeline::VulkanPipeline;
use wrapped::{ThreadAxisConfig, WrappedFunction};

/// Type of one kernel argument, as recorded by the kernel compiler.
/// Buffer arguments are opaque device handles; everything else is POD and
/// travels in the packed scalar slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgType {
    Handle,
    Int(u8),
    UInt(u8),
    Float(u8),
}

impl ArgType {
    pub fn is_handle(self) -> bool {
        matches!(self, ArgType::Handle)
    }
}

/// Compiler-produced metadata for one kernel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub arg_types: Vec<ArgType>,
    pub thread_axis_tags: Vec<String>,
}

/// One precompiled SPIR-V kernel with its metadata flags.
#[derive(Clone, Debug, PartialEq)]
pub struct VulkanShader {
    pub flags: u32,
    pub data: Vec<u32>,
}

impl VulkanShader {
    /// Scalar arguments go through a uniform buffer instead of push
    /// constants (set by the compiler when they exceed the device limit).
    pub const FLAG_USE_UBO: u32 = 1 << 0;

    pub fn use_ubo(&self) -> bool {
        self.flags & Self::FLAG_USE_UBO != 0
    }
}

/// Buffer arguments must come first; counts them.
pub(crate) fn num_buffer_args(arg_types: &[ArgType]) -> usize {
    let n = arg_types.iter().take_while(|t| t.is_handle()).count();
    assert!(
        arg_types[n..].iter().all(|t| !t.is_handle()),
        "Buffer arguments must precede POD arguments"
    );
    n
}

pub(crate) struct ModuleInner {
    pub(crate) api: Arc<DeviceApi>,
    pub(crate) smap: HashMap<String, VulkanShader>,
    pub(crate) fmap: HashMap<String, FunctionInfo>,
    pub(crate) source: String,
    // per-device pipeline cache; get_or_build holds the lock across Vulkan
    // object creation since first-touch is rare
    ecache: Mutex<Vec<HashMap<String, Arc<VulkanPipeline>>>>,
    build_count: AtomicUsize,
}

impl ModuleInner {
    pub(crate) fn get_pipeline(
        &self,
        entry: &mut ThreadEntry,
        device_id: usize,
        func_name: &str,
    ) -> Result<Arc<VulkanPipeline>, VkrtError> {
        let mut cache = self.ecache.lock().unwrap();
        if let Some(pe) = cache[device_id].get(func_name) {
            return Ok(pe.clone());
        }

        let shader = self
            .smap
            .get(func_name)
            .unwrap_or_else(|| panic!("No shader named {} in module", func_name));
        let info = self
            .fmap
            .get(func_name)
            .unwrap_or_else(|| panic!("No function info for {}", func_name));

        let ctx = self.api.context(device_id).clone();
        let pe = Arc::new(VulkanPipeline::build(
            ctx,
            entry,
            shader,
            &info.arg_types,
            func_name,
        )?);
        self.build_count.fetch_add(1, Ordering::Relaxed);
        cache[device_id].insert(func_name.to_string(), pe.clone());
        Ok(pe)
    }
}

/// A loaded kernel module: SPIR-V shader table, function-info table, and the
/// lazily filled per-(device, kernel) pipeline cache. Pipelines die with the
/// module, before the device API they were built on.
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    pub fn new(
        api: Arc<DeviceApi>,
        smap: HashMap<String, VulkanShader>,
        fmap: HashMap<String, FunctionInfo>,
        source: String,
    ) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                api,
                smap,
                fmap,
                source,
                ecache: Mutex::new((0..MAX_DEVICES).map(|_| HashMap::new()).collect()),
                build_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Callable wrapper for a kernel, or `None` when the symbol is absent.
    pub fn get_function(&self, name: &str) -> Option<WrappedFunction> {
        let info = self.inner.fmap.get(name)?;
        let num_buffer = num_buffer_args(&info.arg_types);
        Some(WrappedFunction::new(
            self.inner.clone(),
            name.to_string(),
            num_buffer,
            info.arg_types.len() - num_buffer,
            ThreadAxisConfig::new(&info.thread_axis_tags),
        ))
    }

    /// Original kernel source, kept for diagnostics only.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn smap(&self) -> &HashMap<String, VulkanShader> {
        &self.inner.smap
    }

    pub fn fmap(&self) -> &HashMap<String, FunctionInfo> {
        &self.inner.fmap
    }

    /// Number of pipelines built so far; stays flat on cache hits.
    pub fn pipeline_build_count(&self) -> usize {
        self.inner.build_count.load(Ordering::Relaxed)
    }

    /// Stream form: format string, function-info table, shader table.
    pub fn save_to_binary(&self, w: &mut impl Write) -> Result<(), VkrtError> {
        saveload::write_stream(w, &self.inner.fmap, &self.inner.smap)
    }

    pub fn load_binary(api: Arc<DeviceApi>, r: &mut impl Read) -> Result<Self, VkrtError> {
        let (fmap, smap) = saveload::read_stream(r)?;
        Ok(Self::new(api, smap, fmap, String::new()))
    }

    /// File form: magic plus shader table, with the function-info table in a
    /// sibling JSON meta file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), VkrtError> {
        let path = path.as_ref();
        saveload::write_meta_file(&saveload::meta_file_path(path), &self.inner.fmap)?;
        let mut data = Vec::new();
        saveload::write_file_payload(&mut data, &self.inner.smap)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn load_file(api: Arc<DeviceApi>, path: impl AsRef<Path>) -> Result<Self, VkrtError> {
        let path = path.as_ref();
        let fmap = saveload::read_meta_file(&saveload::meta_file_path(path))?;
        let data = std::fs::read(path)?;
        let smap = saveload::read_file_payload(&mut data.as_slice())?;
        Ok(Self::new(api, smap, fmap, String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_args_are_counted_when_leading() {
        assert_eq!(num_buffer_args(&[]), 0);
        assert_eq!(
            num_buffer_args(&[ArgType::Handle, ArgType::Handle, ArgType::Int(32)]),
            2
        );
        assert_eq!(num_buffer_args(&[ArgType::Float(32)]), 0);
    }

    #[test]
    #[should_panic]
    fn interleaved_buffer_args_are_rejected() {
        num_buffer_args(&[ArgType::Handle, ArgType::Int(32), ArgType::Handle]);
    }

    #[test]
    fn ubo_flag_is_bit_zero() {
        let shader = VulkanShader {
            flags: VulkanShader::FLAG_USE_UBO,
            data: vec![],
        };
        assert!(shader.use_ubo());
        let shader = VulkanShader {
            flags: 1 << 1,
            data: vec![],
        };
        assert!(!shader.use_ubo());
    }
}
