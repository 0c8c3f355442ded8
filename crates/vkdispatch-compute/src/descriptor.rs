use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{vk_call, SetupError};
use crate::memory::StorageBuffer;

/// Binding slot the storage buffer occupies in set 0.
pub const STORAGE_BINDING: u32 = 0;

/// Descriptor set layout with a single compute-visible storage buffer at
/// [`STORAGE_BINDING`].
pub fn create_descriptor_set_layout(
    device: &ash::Device,
) -> Result<vk::DescriptorSetLayout, SetupError> {
    let bindings = [vk::DescriptorSetLayoutBinding::default()
        .binding(STORAGE_BINDING)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::COMPUTE)];
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&create_info, None) }
        .map_err(vk_call("vkCreateDescriptorSetLayout"))
}

/// Layout, pool and the one descriptor set pointing at the storage buffer.
pub struct StorageBinding {
    ctx: Arc<DeviceContext>,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

impl StorageBinding {
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }
}

impl Drop for StorageBinding {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            // Destroying the pool frees the set allocated from it.
            if self.pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.pool, None);
            }
            device.destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("destroyed descriptor set, pool and layout");
    }
}

/// Allocate one descriptor set from a dedicated pool and point its storage
/// binding at the whole of `storage`.
pub fn create_descriptor_set(
    ctx: &Arc<DeviceContext>,
    storage: &StorageBuffer,
) -> Result<StorageBinding, SetupError> {
    let device = ctx.device();
    let layout = create_descriptor_set_layout(device)?;
    let mut binding = StorageBinding {
        ctx: Arc::clone(ctx),
        layout,
        pool: vk::DescriptorPool::null(),
        set: vk::DescriptorSet::null(),
    };

    let pool_sizes = [vk::DescriptorPoolSize::default()
        .ty(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(1)];
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(1)
        .pool_sizes(&pool_sizes);
    binding.pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
        .map_err(vk_call("vkCreateDescriptorPool"))?;

    let set_layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(binding.pool)
        .set_layouts(&set_layouts);
    let sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
        .map_err(vk_call("vkAllocateDescriptorSets"))?;
    binding.set = sets[0];

    let buffer_infos = [vk::DescriptorBufferInfo::default()
        .buffer(storage.buffer())
        .offset(0)
        .range(vk::WHOLE_SIZE)];
    let write = vk::WriteDescriptorSet::default()
        .dst_set(binding.set)
        .dst_binding(STORAGE_BINDING)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .buffer_info(&buffer_infos);
    unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };

    debug!("bound storage buffer to set 0, binding {}", STORAGE_BINDING);
    Ok(binding)
}
