use thiserror::Error;

#[derive(Error, Debug)]
pub enum VkrtError {
    #[error("Failed to load Vulkan library: {0}")]
    Loader(String),

    #[error("Vulkan error: {0}")]
    Vulkan(String),

    #[error("Device init error: {0}")]
    DeviceInit(String),

    #[error("Module format error: {0}")]
    ModuleFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Generic(String),
}

// Convert vk::Result (raw Vulkan return codes) into VkrtError
impl From<vulkanalia::vk::Result> for VkrtError {
    fn from(r: vulkanalia::vk::Result) -> Self {
        VkrtError::Vulkan(format!("vk::Result: {:?}", r))
    }
}

impl From<vulkanalia::vk::ErrorCode> for VkrtError {
    fn from(c: vulkanalia::vk::ErrorCode) -> Self {
        VkrtError::Vulkan(format!("vk::ErrorCode: {:?}", c))
    }
}
