pub mod context;
pub mod device_api;
pub mod memory;
pub mod stream;
pub mod target;
pub mod thread_entry;
