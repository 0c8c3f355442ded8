use std::ffi::CStr;

use ash::vk;
use serde::Serialize;
use tracing::{info, warn};

use crate::context::{create_instance, dispatch_queue_family, is_compute_family, InstanceOptions};
use crate::error::{vk_call, SetupError};
use crate::memory::{find_memory_type, HOST_ACCESSIBLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceType {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    Cpu,
    Other,
}

impl From<vk::PhysicalDeviceType> for DeviceType {
    fn from(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::DISCRETE_GPU => DeviceType::DiscreteGpu,
            vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceType::IntegratedGpu,
            vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceType::VirtualGpu,
            vk::PhysicalDeviceType::CPU => DeviceType::Cpu,
            _ => DeviceType::Other,
        }
    }
}

/// What a dispatch needs to know about one physical device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub device_name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: DeviceType,
    /// Sum of device-local heap sizes, in bytes
    pub device_local_memory: u64,
    /// "major.minor.patch"
    pub api_version: String,
    /// Queue families with the compute bit set and at least one queue
    pub compute_queue_families: Vec<u32>,
    /// Whether any memory type is both host-visible and host-coherent
    pub host_coherent_memory: bool,
    /// Family a dispatcher would create its queue from, if it accepts the device
    pub dispatch_queue_family: Option<u32>,
    pub max_workgroup_size: [u32; 3],
    pub max_workgroup_invocations: u32,
}

impl DeviceInfo {
    /// Whether a dispatcher would accept this device.
    pub fn supports_dispatch(&self) -> bool {
        self.dispatch_queue_family.is_some()
    }
}

/// Enumerate every physical device visible to the Vulkan loader.
pub fn discover_devices(options: &InstanceOptions) -> Result<Vec<DeviceInfo>, SetupError> {
    let vulkan = create_instance(options)?;
    let instance = vulkan.raw();

    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(vk_call("vkEnumeratePhysicalDevices"))?;

    let mut devices = Vec::new();
    for (idx, &pd) in physical_devices.iter().enumerate() {
        let props = unsafe { instance.get_physical_device_properties(pd) };
        let mem_props = unsafe { instance.get_physical_device_memory_properties(pd) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(pd) };

        let device_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let heap_count = (mem_props.memory_heap_count as usize).min(vk::MAX_MEMORY_HEAPS);
        let device_local_memory = mem_props.memory_heaps[..heap_count]
            .iter()
            .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|h| h.size)
            .sum::<u64>();

        let compute_queue_families = queue_families
            .iter()
            .enumerate()
            .filter(|(_, qf)| is_compute_family(qf))
            .map(|(i, _)| i as u32)
            .collect();

        let info = DeviceInfo {
            index: idx as u32,
            device_name,
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            device_type: props.device_type.into(),
            device_local_memory,
            api_version: format!(
                "{}.{}.{}",
                vk::api_version_major(props.api_version),
                vk::api_version_minor(props.api_version),
                vk::api_version_patch(props.api_version)
            ),
            compute_queue_families,
            host_coherent_memory: find_memory_type(&mem_props, u32::MAX, HOST_ACCESSIBLE)
                .is_some(),
            dispatch_queue_family: dispatch_queue_family(&queue_families, &mem_props),
            max_workgroup_size: props.limits.max_compute_work_group_size,
            max_workgroup_invocations: props.limits.max_compute_work_group_invocations,
        };

        info!(
            "device {}: {} ({:?}, {}MB device-local, compute families {:?})",
            idx,
            info.device_name,
            info.device_type,
            info.device_local_memory / (1024 * 1024),
            info.compute_queue_families,
        );
        devices.push(info);
    }

    if devices.is_empty() {
        warn!("no Vulkan devices discovered");
    }
    Ok(devices)
}
