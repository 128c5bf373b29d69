//! vkrt - Vulkan compute runtime for precompiled SPIR-V tensor kernels
//!
//! Loads kernel modules produced by a tensor compiler, initializes every
//! Vulkan device with a compute queue, and launches kernels through a
//! per-thread command stream with lazy pipeline construction.

mod error;
mod gpu;
mod module;
mod workspace;

pub use error::VkrtError;
pub use gpu::context::DeviceContext;
pub use gpu::device_api::{AttrValue, DeviceApi, DeviceAttr, MAX_DEVICES};
pub use gpu::memory::{DeviceBuffer, HostVisibleBuffer};
pub use gpu::stream::{Stream, StreamToken};
pub use gpu::target::{
    ENV_DISABLE_DEDICATED_ALLOCATION, ENV_DISABLE_PUSH_DESCRIPTOR, ENV_ENABLE_VALIDATION, Target,
    env_flag,
};
pub use gpu::thread_entry::ThreadEntry;
pub use module::saveload::{MODULE_FORMAT, MODULE_MAGIC};
pub use module::wrapped::{ArgUnion64, WrappedFunction};
pub use module::{ArgType, FunctionInfo, Module, VulkanShader};
pub use workspace::WorkspacePool;
