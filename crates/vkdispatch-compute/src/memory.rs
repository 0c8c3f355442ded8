use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{vk_call, SetupError};

/// Properties the storage buffer's memory must have for the upload and
/// readback paths to work without explicit flushes.
pub const HOST_ACCESSIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Lowest memory type index allowed by `type_bits` whose property flags
/// include all of `required`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = (properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(i, mt)| (type_bits & (1 << i)) != 0 && mt.property_flags.contains(required))
        .map(|(i, _)| i as u32)
}

/// Whether an allocation currently has a host mapping. Vulkan forbids
/// mapping memory that is already mapped.
#[derive(Debug, Default)]
pub struct MapState(AtomicBool);

impl MapState {
    /// Claim the mapping, failing with [`SetupError::AlreadyMapped`] while
    /// another claim is live.
    pub fn acquire(&self) -> Result<(), SetupError> {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| SetupError::AlreadyMapped)
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_mapped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A storage buffer of `f32` elements bound to host-visible, host-coherent
/// memory.
pub struct StorageBuffer {
    ctx: Arc<DeviceContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    element_count: usize,
    memory_flags: vk::MemoryPropertyFlags,
    mapped: MapState,
}

impl StorageBuffer {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn size(&self) -> vk::DeviceSize {
        (self.element_count * std::mem::size_of::<f32>()) as vk::DeviceSize
    }

    /// Property flags of the memory type backing the buffer.
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    fn require_host_visible(&self) -> Result<(), SetupError> {
        if self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            Ok(())
        } else {
            Err(SetupError::NotHostVisible {
                flags: self.memory_flags,
            })
        }
    }

    /// Map the buffer for reading. Only one mapping may be live at a time;
    /// a second call before the first guard drops returns
    /// [`SetupError::AlreadyMapped`].
    pub fn map(&self) -> Result<MappedFloats<'_>, SetupError> {
        self.require_host_visible()?;
        self.mapped.acquire()?;
        // SAFETY: the memory is host-visible, sized for `element_count`
        // floats, and not mapped elsewhere per `self.mapped`.
        match unsafe { map_floats(self.ctx.device(), self.memory, self.element_count) } {
            Ok(mut guard) => {
                guard.state = Some(&self.mapped);
                Ok(guard)
            }
            Err(e) => {
                self.mapped.release();
                Err(e)
            }
        }
    }
}

impl Drop for StorageBuffer {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
        debug!("destroyed storage buffer ({} elements)", self.element_count);
    }
}

/// Create a storage buffer large enough for `element_count` floats and back
/// it with memory satisfying `required`.
pub fn create_buffer(
    ctx: &Arc<DeviceContext>,
    element_count: usize,
    required: vk::MemoryPropertyFlags,
) -> Result<StorageBuffer, SetupError> {
    let device = ctx.device();
    let size = (element_count * std::mem::size_of::<f32>()) as vk::DeviceSize;

    let create_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { device.create_buffer(&create_info, None) }
        .map_err(vk_call("vkCreateBuffer"))?;

    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let memory_type_index = match find_memory_type(
        ctx.memory_properties(),
        requirements.memory_type_bits,
        required,
    ) {
        Some(index) => index,
        None => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(SetupError::NoSuitableMemoryType {
                type_bits: requirements.memory_type_bits,
                required,
            });
        }
    };

    let memory_flags = ctx.memory_properties().memory_types[memory_type_index as usize].property_flags;
    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(vk_call("vkAllocateMemory")(e));
        }
    };

    // From here on the wrapper owns both handles.
    let storage = StorageBuffer {
        ctx: Arc::clone(ctx),
        buffer,
        memory,
        element_count,
        memory_flags,
        mapped: MapState::default(),
    };
    unsafe { device.bind_buffer_memory(buffer, memory, 0) }
        .map_err(vk_call("vkBindBufferMemory"))?;

    debug!(
        "allocated {} bytes for {} elements (memory type {})",
        requirements.size, element_count, memory_type_index
    );
    Ok(storage)
}

/// Copy `data` into the start of the buffer's memory.
pub fn fill_buffer(storage: &StorageBuffer, data: &[f32]) -> Result<(), SetupError> {
    if data.len() > storage.element_count {
        return Err(SetupError::Params(vkdispatch_core::CoreError::InvalidParams(format!(
            "{} values do not fit a buffer of {} elements",
            data.len(),
            storage.element_count
        ))));
    }

    let device = storage.ctx.device();
    let bytes: &[u8] = bytemuck::cast_slice(data);
    storage.require_host_visible()?;
    storage.mapped.acquire()?;
    let result = unsafe {
        device
            .map_memory(
                storage.memory,
                0,
                bytes.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
            .map(|ptr| {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
                device.unmap_memory(storage.memory);
            })
            .map_err(vk_call("vkMapMemory"))
    };
    storage.mapped.release();
    result?;
    debug!("uploaded {} bytes", bytes.len());
    Ok(())
}

/// Read-only view of mapped device memory as `f32` values. Unmaps on drop.
pub struct MappedFloats<'a> {
    device: &'a ash::Device,
    memory: vk::DeviceMemory,
    values: &'a [f32],
    state: Option<&'a MapState>,
}

impl Deref for MappedFloats<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.values
    }
}

impl Drop for MappedFloats<'_> {
    fn drop(&mut self) {
        unsafe { self.device.unmap_memory(self.memory) };
        if let Some(state) = self.state {
            state.release();
        }
    }
}

/// Map the first `element_count` floats of `memory`.
///
/// Prefer [`StorageBuffer::map`], which upholds the requirements below.
///
/// # Safety
///
/// - `memory` must have been allocated from `device` with a host-visible
///   memory type and must not be freed while the guard is alive.
/// - The allocation must hold at least `element_count * 4` bytes.
/// - `memory` must not be mapped already, and must not be mapped again until
///   the returned guard is dropped.
/// - The device must not write the memory while the guard is alive.
pub unsafe fn map_floats(
    device: &ash::Device,
    memory: vk::DeviceMemory,
    element_count: usize,
) -> Result<MappedFloats<'_>, SetupError> {
    let size = element_count
        .checked_mul(std::mem::size_of::<f32>())
        .ok_or_else(|| {
            SetupError::Params(vkdispatch_core::CoreError::InvalidParams(format!(
                "cannot map {} elements",
                element_count
            )))
        })? as vk::DeviceSize;
    let ptr = unsafe { device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()) }
        .map_err(vk_call("vkMapMemory"))?;
    // SAFETY: the mapping covers `size` bytes and minMemoryMapAlignment
    // (at least 64) satisfies f32 alignment.
    let values = unsafe { std::slice::from_raw_parts(ptr as *const f32, element_count) };
    Ok(MappedFloats {
        device,
        memory,
        values,
        state: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *f,
                heap_index: 0,
            };
        }
        props
    }

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;

    #[test]
    fn picks_first_type_with_all_required_flags() {
        let p = props(&[DEVICE_LOCAL, VISIBLE, HOST_ACCESSIBLE, HOST_ACCESSIBLE | DEVICE_LOCAL]);
        assert_eq!(find_memory_type(&p, 0b1111, HOST_ACCESSIBLE), Some(2));
        assert_eq!(find_memory_type(&p, 0b1111, VISIBLE), Some(1));
    }

    #[test]
    fn respects_compatible_type_mask() {
        let p = props(&[HOST_ACCESSIBLE, DEVICE_LOCAL, HOST_ACCESSIBLE | DEVICE_LOCAL]);
        // Type 0 matches on flags but the driver excluded it.
        assert_eq!(find_memory_type(&p, 0b110, HOST_ACCESSIBLE), Some(2));
        assert_eq!(find_memory_type(&p, 0b010, HOST_ACCESSIBLE), None);
    }

    #[test]
    fn ignores_bits_beyond_reported_type_count() {
        let mut p = props(&[DEVICE_LOCAL]);
        // Stale entry past memory_type_count must never be chosen.
        p.memory_types[1].property_flags = HOST_ACCESSIBLE;
        assert_eq!(find_memory_type(&p, u32::MAX, HOST_ACCESSIBLE), None);
    }

    #[test]
    fn mapping_is_exclusive_until_released() {
        let state = MapState::default();
        state.acquire().unwrap();
        assert!(state.is_mapped());
        assert!(matches!(state.acquire(), Err(SetupError::AlreadyMapped)));

        state.release();
        assert!(!state.is_mapped());
        state.acquire().unwrap();
    }

    #[test]
    fn empty_requirement_matches_any_allowed_type() {
        let p = props(&[DEVICE_LOCAL, VISIBLE]);
        assert_eq!(
            find_memory_type(&p, 0b10, vk::MemoryPropertyFlags::empty()),
            Some(1)
        );
    }
}
