use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use vulkanalia::vk;

use crate::error::VkrtError;
use crate::workspace::WorkspacePool;

use super::device_api::DeviceApi;
use super::memory::{DeviceBuffer, HostVisibleBuffer};
use super::stream::Stream;

thread_local! {
    static THREAD_ENTRY: RefCell<Option<ThreadEntry>> = const { RefCell::new(None) };
}

/// Per-OS-thread runtime state: the selected device, one stream per device,
/// the size-elastic staging and uniform buffer caches, and the workspace
/// pool. Created on first use and torn down at thread exit; the held
/// `Arc<DeviceApi>` keeps device teardown ordered after this entry's.
pub struct ThreadEntry {
    api: Arc<DeviceApi>,
    device_id: usize,
    streams: HashMap<usize, Stream>,
    staging_buffers: HashMap<usize, HostVisibleBuffer>,
    uniform_buffers: HashMap<usize, HostVisibleBuffer>,
    workspace: WorkspacePool,
}

impl ThreadEntry {
    fn new(api: Arc<DeviceApi>) -> Self {
        Self {
            api,
            device_id: 0,
            streams: HashMap::new(),
            staging_buffers: HashMap::new(),
            uniform_buffers: HashMap::new(),
            workspace: WorkspacePool::new(),
        }
    }

    /// Run `f` with the calling thread's entry, creating it on first use.
    pub fn with<R>(api: &Arc<DeviceApi>, f: impl FnOnce(&mut ThreadEntry) -> R) -> R {
        THREAD_ENTRY.with(|cell| {
            let mut slot = cell.borrow_mut();
            let entry = slot.get_or_insert_with(|| ThreadEntry::new(api.clone()));
            debug_assert!(
                Arc::ptr_eq(&entry.api, api),
                "thread entry bound to a different DeviceApi"
            );
            f(entry)
        })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn set_device(&mut self, device_id: usize) {
        assert!(
            device_id < self.api.num_devices(),
            "Invalid device id {}",
            device_id
        );
        self.device_id = device_id;
    }

    /// The calling thread's stream for a device, created lazily.
    pub fn stream(&mut self, device_id: usize) -> Result<&mut Stream, VkrtError> {
        if !self.streams.contains_key(&device_id) {
            let stream = Stream::new(self.api.context(device_id).clone())?;
            self.streams.insert(device_id, stream);
        }
        Ok(self.streams.get_mut(&device_id).unwrap())
    }

    /// Staging buffer of at least `size` bytes for a device. A too-small
    /// buffer is dropped and reallocated without a prior synchronize; both
    /// copy directions already synchronize around staging use.
    pub fn staging_buffer(
        &mut self,
        device_id: usize,
        size: vk::DeviceSize,
    ) -> Result<&HostVisibleBuffer, VkrtError> {
        let needs_alloc = self
            .staging_buffers
            .get(&device_id)
            .map(|b| b.size < size.max(1))
            .unwrap_or(true);
        if needs_alloc {
            let ctx = self.api.context(device_id).clone();
            let staging_mtype_index = ctx.staging_mtype_index;
            let buf = HostVisibleBuffer::new(
                ctx,
                size,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                staging_mtype_index,
            )?;
            self.staging_buffers.insert(device_id, buf);
        }
        Ok(self.staging_buffers.get(&device_id).unwrap())
    }

    /// Ensure the device's uniform buffer holds at least `size` bytes.
    ///
    /// Unlike staging, a growing UBO synchronizes the owning stream before
    /// the old buffer is freed: its contents are referenced until queued
    /// dispatches complete.
    pub fn allocate_uniform_buffer(
        &mut self,
        device_id: usize,
        size: vk::DeviceSize,
    ) -> Result<(), VkrtError> {
        let size = size.max(1);
        let existing_size = self.uniform_buffers.get(&device_id).map(|b| b.size);
        if let Some(existing_size) = existing_size {
            if existing_size >= size {
                return Ok(());
            }
            self.stream(device_id)?.synchronize()?;
            self.uniform_buffers.remove(&device_id);
        }
        let ctx = self.api.context(device_id).clone();
        let buf = HostVisibleBuffer::with_properties(
            ctx,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        self.uniform_buffers.insert(device_id, buf);
        Ok(())
    }

    /// The device's uniform buffer, which must have been provisioned by
    /// [`allocate_uniform_buffer`](Self::allocate_uniform_buffer) during
    /// pipeline construction.
    pub fn uniform_buffer(&self, device_id: usize, size: vk::DeviceSize) -> &HostVisibleBuffer {
        let buf = self
            .uniform_buffers
            .get(&device_id)
            .expect("The uniform buffer is not allocated");
        assert!(buf.size >= size.max(1));
        buf
    }

    pub fn alloc_workspace(
        &mut self,
        device_id: usize,
        nbytes: vk::DeviceSize,
    ) -> Result<DeviceBuffer, VkrtError> {
        self.workspace.alloc(&self.api, device_id, nbytes)
    }

    pub fn free_workspace(&mut self, buffer: DeviceBuffer) {
        self.workspace.free(buffer);
    }
}
