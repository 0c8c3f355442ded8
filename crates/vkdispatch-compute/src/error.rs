use std::path::PathBuf;

use ash::vk;
use vkdispatch_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("{call} failed: {result:?} ({})", .result.as_raw())]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("no physical device available")]
    NoPhysicalDevice,

    #[error("no physical device exposes a compute queue family and host-coherent memory")]
    NoCapableDevice,

    #[error("no memory type in mask 0x{type_bits:x} supports {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("cannot read shader {}: {source}", .path.display())]
    ShaderRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid SPIR-V in {}: {reason}", .path.display())]
    InvalidSpirv { path: PathBuf, reason: String },

    #[error("cannot compile shader {}: {reason}", .path.display())]
    ShaderCompile { path: PathBuf, reason: String },

    #[error("buffer memory is already mapped")]
    AlreadyMapped,

    #[error("buffer memory ({flags:?}) is not host-visible")]
    NotHostVisible { flags: vk::MemoryPropertyFlags },

    #[error(transparent)]
    Params(#[from] CoreError),
}

impl SetupError {
    /// True when the host simply has no usable Vulkan implementation, as
    /// opposed to a failure in the dispatch itself.
    pub fn is_unavailable(&self) -> bool {
        match self {
            SetupError::Loading(_) | SetupError::NoPhysicalDevice | SetupError::NoCapableDevice => true,
            SetupError::Vulkan { call, result } => {
                *call == "vkCreateInstance" && *result == vk::Result::ERROR_INCOMPATIBLE_DRIVER
            }
            _ => false,
        }
    }
}

/// Adapter for `map_err` that tags a raw `vk::Result` with the failing call.
pub(crate) fn vk_call(call: &'static str) -> impl FnOnce(vk::Result) -> SetupError {
    move |result| {
        tracing::error!("{} returned {:?}", call, result);
        SetupError::Vulkan { call, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_error_names_call_and_code() {
        let err = vk_call("vkAllocateMemory")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let msg = err.to_string();
        assert!(msg.contains("vkAllocateMemory"));
        assert!(msg.contains("-2"));
        assert!(!err.is_unavailable());
    }

    #[test]
    fn missing_driver_is_unavailable() {
        assert!(SetupError::NoPhysicalDevice.is_unavailable());
        assert!(SetupError::Vulkan {
            call: "vkCreateInstance",
            result: vk::Result::ERROR_INCOMPATIBLE_DRIVER,
        }
        .is_unavailable());
    }
}
