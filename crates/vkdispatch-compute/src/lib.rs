//! One-shot Vulkan compute dispatch.
//!
//! [`ComputeDispatcher`] walks a fixed sequence: instance, physical device,
//! logical device and queue, host-visible storage buffer, descriptor set,
//! shader module and compute pipeline, one recorded dispatch, submit and
//! wait. Every step is also exposed as a free function in its module so
//! callers can drive the sequence themselves.

pub mod command;
pub mod context;
pub mod descriptor;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod shader;

pub use context::{DeviceContext, InstanceOptions};
pub use dispatcher::{ComputeDispatcher, DispatchStage};
pub use error::SetupError;
pub use memory::{find_memory_type, map_floats, MappedFloats};
pub use vkdispatch_core::{DispatchParams, Extent3};
