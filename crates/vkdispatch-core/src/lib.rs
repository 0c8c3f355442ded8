//! Vulkan-free building blocks for vkdispatch: configuration, dispatch
//! parameters and workgroup grid arithmetic.

pub mod config;
pub mod error;
pub mod params;

pub use error::CoreError;
pub use params::{check_element_count, workgroup_counts, DispatchParams, Extent3};
