use std::ptr;
use std::sync::Arc;

use vulkanalia::vk::{self, DeviceV1_0, Handle};

use crate::error::VkrtError;

use super::context::DeviceContext;

/// Heaps smaller than this are never considered when picking memory types.
const MIN_HEAP_SIZE: vk::DeviceSize = 1024;

/// Tie-break score for staging memory types: prefer host-cached.
pub(crate) fn staging_memory_rank(flags: vk::MemoryPropertyFlags) -> u32 {
    flags.contains(vk::MemoryPropertyFlags::HOST_CACHED) as u32
}

/// Tie-break score for compute memory types: prefer not host-visible.
pub(crate) fn compute_memory_rank(flags: vk::MemoryPropertyFlags) -> u32 {
    !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) as u32
}

/// Pick the staging memory type: host-visible, compatible with `type_bits`,
/// on a heap of usable size, ranked by [`staging_memory_rank`]. Also reports
/// whether the winner is host-coherent.
pub(crate) fn select_staging_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
) -> Option<(u32, bool)> {
    let mut win: Option<(u32, bool)> = None;
    let mut win_rank = None;
    for k in 0..props.memory_type_count {
        let ty = props.memory_types[k as usize];
        if !ty.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            continue;
        }
        if type_bits & (1 << k) == 0 {
            continue;
        }
        if props.memory_heaps[ty.heap_index as usize].size < MIN_HEAP_SIZE {
            continue;
        }
        let rank = staging_memory_rank(ty.property_flags);
        if win_rank.map(|w| rank > w).unwrap_or(true) {
            win_rank = Some(rank);
            win = Some((
                k,
                ty.property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            ));
        }
    }
    win
}

/// Pick the compute memory type: device-local, compatible with `type_bits`,
/// on a heap of usable size, ranked by [`compute_memory_rank`].
pub(crate) fn select_compute_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
) -> Option<u32> {
    let mut win = None;
    let mut win_rank = None;
    for k in 0..props.memory_type_count {
        let ty = props.memory_types[k as usize];
        if !ty.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            continue;
        }
        if type_bits & (1 << k) == 0 {
            continue;
        }
        if props.memory_heaps[ty.heap_index as usize].size < MIN_HEAP_SIZE {
            continue;
        }
        let rank = compute_memory_rank(ty.property_flags);
        if win_rank.map(|w| rank > w).unwrap_or(true) {
            win_rank = Some(rank);
            win = Some(k);
        }
    }
    win
}

/// First memory type compatible with `type_bits` that has all of `required`.
pub(crate) fn first_matching_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&k| {
        type_bits & (1 << k) != 0
            && props.memory_types[k as usize].property_flags.contains(required)
    })
}

/// Create a buffer and back it with memory of the given type.
///
/// When the device supports dedicated allocation the driver is asked whether
/// this buffer wants its own allocation; in that case the requirement-reported
/// size is used and the allocation is tied to the buffer. Otherwise the
/// allocation uses the buffer's own create-info size.
pub(crate) fn create_buffer(
    ctx: &DeviceContext,
    nbytes: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    mem_type_index: u32,
) -> Result<(vk::Buffer, vk::DeviceMemory), VkrtError> {
    unsafe {
        let buffer_info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            next: ptr::null(),
            flags: vk::BufferCreateFlags::empty(),
            size: nbytes,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_family_index_count: 0,
            queue_family_indices: ptr::null(),
        };

        let buffer = ctx.device().create_buffer(&buffer_info, None)?;

        let dedicated = if ctx.use_dedicated_allocation() {
            let (size, wants_dedicated) = ctx.buffer_dedicated_requirements(buffer);
            wants_dedicated.then_some(size)
        } else {
            None
        };

        let memory = match dedicated {
            None => {
                let alloc_info = vk::MemoryAllocateInfo {
                    s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                    next: ptr::null(),
                    allocation_size: buffer_info.size,
                    memory_type_index: mem_type_index,
                };
                ctx.device().allocate_memory(&alloc_info, None)
            }
            Some(required_size) => {
                let dedicated_info = vk::MemoryDedicatedAllocateInfo {
                    s_type: vk::StructureType::MEMORY_DEDICATED_ALLOCATE_INFO,
                    next: ptr::null(),
                    image: vk::Image::null(),
                    buffer,
                };
                let alloc_info = vk::MemoryAllocateInfo {
                    s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                    next: &dedicated_info as *const _ as *const std::ffi::c_void,
                    allocation_size: required_size,
                    memory_type_index: mem_type_index,
                };
                ctx.device().allocate_memory(&alloc_info, None)
            }
        };

        let memory = match memory {
            Ok(m) => m,
            Err(e) => {
                ctx.device().destroy_buffer(buffer, None);
                return Err(e.into());
            }
        };

        if let Err(e) = ctx.device().bind_buffer_memory(buffer, memory, 0) {
            ctx.device().free_memory(memory, None);
            ctx.device().destroy_buffer(buffer, None);
            return Err(e.into());
        }

        Ok((buffer, memory))
    }
}

/// A buffer plus its memory allocation, on the device's compute memory type.
/// Ownership is exclusive; the holder must not drop it while commands that
/// reference it are still in flight (the facade's free path synchronizes
/// the calling thread's stream first).
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub(crate) memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub(crate) ctx: Arc<DeviceContext>,
}

impl DeviceBuffer {
    pub(crate) fn new(
        ctx: Arc<DeviceContext>,
        nbytes: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        mem_type_index: u32,
    ) -> Result<Self, VkrtError> {
        let (buffer, memory) = create_buffer(&ctx, nbytes, usage, mem_type_index)?;
        Ok(Self {
            buffer,
            memory,
            size: nbytes,
            ctx,
        })
    }

    pub fn device_id(&self) -> usize {
        self.ctx.device_id
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_buffer(self.buffer, None);
            self.ctx.device().free_memory(self.memory, None);
        }
    }
}

/// A host-visible buffer with a persistent mapping, used for staging and for
/// the UBO that carries scalar arguments past the push-constant limit.
pub struct HostVisibleBuffer {
    pub buffer: vk::Buffer,
    pub(crate) memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    host_ptr: *mut u8,
    pub(crate) ctx: Arc<DeviceContext>,
}

impl HostVisibleBuffer {
    /// Allocate on an explicit memory type (staging path: the context's
    /// pre-ranked staging type).
    pub(crate) fn new(
        ctx: Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        mem_type_index: u32,
    ) -> Result<Self, VkrtError> {
        let size = size.max(1);
        let (buffer, memory) = create_buffer(&ctx, size, usage, mem_type_index)?;
        let host_ptr = unsafe {
            match ctx
                .device()
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
            {
                Ok(p) => p as *mut u8,
                Err(e) => {
                    ctx.device().free_memory(memory, None);
                    ctx.device().destroy_buffer(buffer, None);
                    return Err(e.into());
                }
            }
        };
        Ok(Self {
            buffer,
            memory,
            size,
            host_ptr,
            ctx,
        })
    }

    /// Allocate on the first memory type satisfying `required` (UBO path:
    /// host-visible and host-coherent).
    pub(crate) fn with_properties(
        ctx: Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        required: vk::MemoryPropertyFlags,
    ) -> Result<Self, VkrtError> {
        let mem_type_index = ctx.probe_memory_type(usage, required)?;
        Self::new(ctx, size, usage, mem_type_index)
    }

    pub fn host_ptr(&self) -> *mut u8 {
        self.host_ptr
    }

    /// Copy bytes into the mapping at the given offset.
    pub(crate) fn write_bytes(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset as u64 + data.len() as u64 <= self.size);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.host_ptr.add(offset), data.len());
        }
    }

    /// Copy bytes out of the mapping at the given offset.
    pub(crate) fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset as u64 + out.len() as u64 <= self.size);
        unsafe {
            ptr::copy_nonoverlapping(self.host_ptr.add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// Host-side flush so CPU writes become visible to the device. Needed on
    /// non-coherent staging memory before recording the copy.
    pub(crate) fn flush(&self) -> Result<(), VkrtError> {
        let range = vk::MappedMemoryRange {
            s_type: vk::StructureType::MAPPED_MEMORY_RANGE,
            next: ptr::null(),
            memory: self.memory,
            offset: 0,
            size: vk::WHOLE_SIZE as u64,
        };
        unsafe { self.ctx.device().flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    /// Host-side invalidate so device writes become visible to the CPU.
    pub(crate) fn invalidate(&self) -> Result<(), VkrtError> {
        let range = vk::MappedMemoryRange {
            s_type: vk::StructureType::MAPPED_MEMORY_RANGE,
            next: ptr::null(),
            memory: self.memory,
            offset: 0,
            size: vk::WHOLE_SIZE as u64,
        };
        unsafe {
            self.ctx
                .device()
                .invalidate_mapped_memory_ranges(&[range])?
        };
        Ok(())
    }
}

impl Drop for HostVisibleBuffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().unmap_memory(self.memory);
            self.ctx.device().destroy_buffer(self.buffer, None);
            self.ctx.device().free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(
        types: &[(vk::MemoryPropertyFlags, u32)],
        heaps: &[vk::DeviceSize],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties::default();
        p.memory_type_count = types.len() as u32;
        for (i, &(flags, heap_index)) in types.iter().enumerate() {
            p.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index,
            };
        }
        p.memory_heap_count = heaps.len() as u32;
        for (i, &size) in heaps.iter().enumerate() {
            p.memory_heaps[i] = vk::MemoryHeap {
                size,
                flags: vk::MemoryHeapFlags::empty(),
            };
        }
        p
    }

    const HV: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HC: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_CACHED;
    const CO: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const DL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    #[test]
    fn staging_pick_prefers_host_cached() {
        let p = props(
            &[(HV | CO, 0), (HV | HC, 0), (HV, 0)],
            &[1 << 30],
        );
        let (index, coherent) = select_staging_memory_type(&p, 0b111).unwrap();
        assert_eq!(index, 1);
        assert!(!coherent);
    }

    #[test]
    fn staging_pick_reports_coherence() {
        let p = props(&[(HV | CO, 0)], &[1 << 30]);
        assert_eq!(select_staging_memory_type(&p, 0b1), Some((0, true)));
    }

    #[test]
    fn staging_pick_honours_type_bits_and_heap_size() {
        let p = props(&[(HV | HC, 0), (HV, 1)], &[512, 1 << 30]);
        // type 0 sits on a sub-1KiB heap, type 1 wins despite the lower rank
        assert_eq!(select_staging_memory_type(&p, 0b11), Some((1, false)));
        // type bits can exclude the only host-visible candidate
        assert_eq!(select_staging_memory_type(&p, 0b01), None);
    }

    #[test]
    fn staging_pick_requires_host_visible() {
        let p = props(&[(DL, 0)], &[1 << 30]);
        assert_eq!(select_staging_memory_type(&p, 0b1), None);
    }

    #[test]
    fn compute_pick_prefers_not_host_visible() {
        let p = props(&[(DL | HV | CO, 0), (DL, 0)], &[1 << 30]);
        assert_eq!(select_compute_memory_type(&p, 0b11), Some(1));
        // with only the host-visible one compatible, it still qualifies
        assert_eq!(select_compute_memory_type(&p, 0b01), Some(0));
    }

    #[test]
    fn compute_pick_requires_device_local() {
        let p = props(&[(HV | CO, 0)], &[1 << 30]);
        assert_eq!(select_compute_memory_type(&p, 0b1), None);
    }

    #[test]
    fn first_match_takes_lowest_index() {
        let p = props(&[(DL, 0), (HV | CO, 0), (HV | CO | HC, 0)], &[1 << 30]);
        assert_eq!(first_matching_memory_type(&p, 0b111, HV | CO), Some(1));
        assert_eq!(first_matching_memory_type(&p, 0b100, HV | CO), Some(2));
        assert_eq!(first_matching_memory_type(&p, 0b001, HV | CO), None);
    }

    #[test]
    fn rank_functions_are_binary_scores() {
        assert_eq!(staging_memory_rank(HV), 0);
        assert_eq!(staging_memory_rank(HV | HC), 1);
        assert_eq!(compute_memory_rank(DL), 1);
        assert_eq!(compute_memory_rank(DL | HV), 0);
    }
}
