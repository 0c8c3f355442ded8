use std::ffi::{c_void, CStr, CString};

use ash::{ext::debug_utils, vk};
use tracing::{debug, error, info, warn};

use vkdispatch_core::config::InstanceConfig;

use crate::error::{vk_call, SetupError};
use crate::memory::{find_memory_type, HOST_ACCESSIBLE};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance-level choices made before any device exists.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub app_name: String,
    /// Request the Khronos validation layer and route its messages to tracing.
    pub validation: bool,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            app_name: "vkdispatch".to_string(),
            validation: cfg!(debug_assertions),
        }
    }
}

impl From<&InstanceConfig> for InstanceOptions {
    fn from(config: &InstanceConfig) -> Self {
        Self {
            app_name: config.app_name.clone(),
            validation: config.validation.enabled(),
        }
    }
}

/// Owned Vulkan instance, plus the debug messenger when validation is on.
pub struct VulkanInstance {
    // Entry must outlive the instance: the loader library is unloaded on drop.
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug.is_some()
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("destroyed Vulkan instance");
    }
}

/// Create a Vulkan instance, enabling the validation layer when requested and
/// installed.
pub fn create_instance(options: &InstanceOptions) -> Result<VulkanInstance, SetupError> {
    let entry = unsafe { ash::Entry::load()? };

    let validation = options.validation && validation_layer_available(&entry);

    let app_name = CString::new(options.app_name.as_str()).unwrap_or_default();
    let app_info = vk::ApplicationInfo::default()
        .application_name(app_name.as_c_str())
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"vkdispatch")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::make_api_version(0, 1, 0, 0));

    let mut layer_names = Vec::new();
    let mut extension_names = Vec::new();
    if validation {
        layer_names.push(VALIDATION_LAYER.as_ptr());
        extension_names.push(debug_utils::NAME.as_ptr());
    }

    let mut messenger_info = messenger_create_info();
    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layer_names)
        .enabled_extension_names(&extension_names);
    if validation {
        create_info = create_info.push_next(&mut messenger_info);
    }

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(vk_call("vkCreateInstance"))?;

    let messenger = if validation {
        let loader = debug_utils::Instance::new(&entry, &instance);
        match unsafe { loader.create_debug_utils_messenger(&messenger_create_info(), None) } {
            Ok(messenger) => Some((loader, messenger)),
            Err(e) => {
                warn!("debug messenger unavailable: {:?}", e);
                None
            }
        }
    } else {
        None
    };

    let validation_on = messenger.is_some();
    info!(
        "created Vulkan instance (validation {})",
        if validation_on { "on" } else { "off" }
    );

    Ok(VulkanInstance {
        entry,
        instance,
        debug: messenger,
    })
}

fn validation_layer_available(entry: &ash::Entry) -> bool {
    let layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(e) => {
            warn!("cannot enumerate instance layers: {:?}", e);
            return false;
        }
    };

    let found = layers
        .iter()
        .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);
    if !found {
        warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
    }
    found
}

fn messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: non-null callback data is valid for the duration of the call
    let data = unsafe { &*data };
    let message = if data.p_message.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(data.p_message) }
            .to_string_lossy()
            .into_owned()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!(target: "vulkan", "{}", message);
    } else {
        debug!(target: "vulkan", "{}", message);
    }
    vk::FALSE
}

/// Whether a queue family can take compute submissions.
pub fn is_compute_family(family: &vk::QueueFamilyProperties) -> bool {
    family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::COMPUTE)
}

/// Queue family a dispatch would use on a device with these properties:
/// the first compute family, provided the device also has host-visible,
/// host-coherent memory for the storage buffer.
pub fn dispatch_queue_family(
    families: &[vk::QueueFamilyProperties],
    memory: &vk::PhysicalDeviceMemoryProperties,
) -> Option<u32> {
    find_memory_type(memory, u32::MAX, HOST_ACCESSIBLE)?;
    families.iter().position(is_compute_family).map(|i| i as u32)
}

/// First enumerated physical device that can run a dispatch (see
/// [`dispatch_queue_family`]), together with its compute family index.
pub fn pick_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, u32), SetupError> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(vk_call("vkEnumeratePhysicalDevices"))?;
    if physical_devices.is_empty() {
        return Err(SetupError::NoPhysicalDevice);
    }
    debug!("enumerated {} physical devices", physical_devices.len());

    physical_devices
        .into_iter()
        .find_map(|pd| {
            let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
            let memory = unsafe { instance.get_physical_device_memory_properties(pd) };
            dispatch_queue_family(&families, &memory).map(|family| (pd, family))
        })
        .ok_or(SetupError::NoCapableDevice)
}

/// Create a logical device with a single queue from `queue_family_index`.
pub fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> Result<(ash::Device, vk::Queue), SetupError> {
    let priorities = [1.0f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities);
    let create_info =
        vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));

    let device = unsafe { instance.create_device(physical_device, &create_info, None) }
        .map_err(vk_call("vkCreateDevice"))?;
    let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
    Ok((device, queue))
}

/// Instance, chosen physical device, logical device and its compute queue.
/// Shared behind an `Arc` by every resource created from the device, so the
/// device is destroyed only after all of them.
pub struct DeviceContext {
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_name: String,
    // Dropped after `device` is destroyed in `Drop::drop`.
    instance: VulkanInstance,
}

impl DeviceContext {
    pub fn new(options: &InstanceOptions) -> Result<Self, SetupError> {
        let instance = create_instance(options)?;
        let (physical_device, queue_family_index) = pick_physical_device(instance.raw())?;

        let props = unsafe { instance.raw().get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let memory_properties = unsafe {
            instance
                .raw()
                .get_physical_device_memory_properties(physical_device)
        };

        let (device, queue) = create_device(instance.raw(), physical_device, queue_family_index)?;
        info!(
            "using {} (compute queue family {})",
            device_name, queue_family_index
        );

        Ok(Self {
            device,
            queue,
            queue_family_index,
            physical_device,
            memory_properties,
            device_name,
            instance,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &VulkanInstance {
        &self.instance
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("vkDeviceWaitIdle before teardown failed: {:?}", e);
            }
            self.device.destroy_device(None);
        }
        debug!("destroyed logical device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, queue_count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count,
            ..Default::default()
        }
    }

    fn memory(flags: vk::MemoryPropertyFlags) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 1,
            ..Default::default()
        };
        props.memory_types[0].property_flags = flags;
        props
    }

    #[test]
    fn first_populated_compute_family_is_chosen() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE, 0),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 2),
        ];
        assert_eq!(dispatch_queue_family(&families, &memory(HOST_ACCESSIBLE)), Some(2));
    }

    #[test]
    fn device_without_host_coherent_memory_is_skipped() {
        let families = [family(vk::QueueFlags::COMPUTE, 1)];
        assert_eq!(
            dispatch_queue_family(&families, &memory(vk::MemoryPropertyFlags::DEVICE_LOCAL)),
            None
        );
        assert_eq!(
            dispatch_queue_family(&families, &memory(vk::MemoryPropertyFlags::HOST_VISIBLE)),
            None
        );
    }

    #[test]
    fn empty_compute_family_does_not_count() {
        assert!(!is_compute_family(&family(vk::QueueFlags::COMPUTE, 0)));
        assert!(is_compute_family(&family(vk::QueueFlags::COMPUTE, 1)));
    }
}
