use std::collections::HashMap;
use std::sync::Arc;

use vulkanalia::vk;

use crate::error::VkrtError;
use crate::gpu::device_api::DeviceApi;
use crate::gpu::memory::DeviceBuffer;

/// Smallest retired buffer that still fits the request.
fn best_fit(sizes: &[vk::DeviceSize], nbytes: vk::DeviceSize) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &size) in sizes.iter().enumerate() {
        if size >= nbytes && best.map(|j| sizes[j] > size).unwrap_or(true) {
            best = Some(i);
        }
    }
    best
}

/// Per-device recycling pool for short-lived kernel scratch buffers.
/// Freed workspaces are retained and handed back to later allocations that
/// fit, avoiding device allocations in steady state.
pub struct WorkspacePool {
    retired: HashMap<usize, Vec<DeviceBuffer>>,
}

impl WorkspacePool {
    pub fn new() -> Self {
        Self {
            retired: HashMap::new(),
        }
    }

    pub fn alloc(
        &mut self,
        api: &Arc<DeviceApi>,
        device_id: usize,
        nbytes: vk::DeviceSize,
    ) -> Result<DeviceBuffer, VkrtError> {
        if let Some(list) = self.retired.get_mut(&device_id) {
            let sizes: Vec<vk::DeviceSize> = list.iter().map(|b| b.size).collect();
            if let Some(i) = best_fit(&sizes, nbytes.max(1)) {
                return Ok(list.swap_remove(i));
            }
        }
        api.alloc_data_space(device_id, nbytes)
    }

    pub fn free(&mut self, buffer: DeviceBuffer) {
        self.retired
            .entry(buffer.device_id())
            .or_default()
            .push(buffer);
    }
}

impl Default for WorkspacePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit_picks_smallest_that_fits() {
        assert_eq!(best_fit(&[4096, 1024, 2048], 1000), Some(1));
        assert_eq!(best_fit(&[4096, 1024, 2048], 1500), Some(2));
        assert_eq!(best_fit(&[4096, 1024, 2048], 4096), Some(0));
    }

    #[test]
    fn best_fit_rejects_all_too_small() {
        assert_eq!(best_fit(&[512, 256], 1024), None);
        assert_eq!(best_fit(&[], 1), None);
    }
}
