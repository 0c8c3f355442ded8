use std::fmt;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, info_span};

use vkdispatch_core::{DispatchParams, Extent3};

use crate::command::{record_dispatch, submit, wait, DispatchCommand};
use crate::context::{DeviceContext, InstanceOptions};
use crate::descriptor::{create_descriptor_set, StorageBinding};
use crate::error::SetupError;
use crate::memory::{create_buffer, fill_buffer, MappedFloats, StorageBuffer, HOST_ACCESSIBLE};
use crate::pipeline::{create_compute_pipeline, ComputePipeline};

/// Progress of a dispatcher through its one-way setup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DispatchStage {
    Uninitialized,
    DeviceReady,
    BufferReady,
    DescriptorsReady,
    PipelineReady,
    Dispatched,
    Completed,
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchStage::Uninitialized => "uninitialized",
            DispatchStage::DeviceReady => "device ready",
            DispatchStage::BufferReady => "buffer ready",
            DispatchStage::DescriptorsReady => "descriptors ready",
            DispatchStage::PipelineReady => "pipeline ready",
            DispatchStage::Dispatched => "dispatched",
            DispatchStage::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Runs one compute shader over one `f32` storage buffer.
///
/// Construction performs the whole sequence and returns only after the
/// dispatch has completed on the device; afterwards the buffer can be mapped
/// and read. All Vulkan objects are released when the dispatcher is dropped,
/// in reverse creation order.
pub struct ComputeDispatcher {
    // Field order is drop order: reverse of creation.
    command: DispatchCommand,
    pipeline: ComputePipeline,
    binding: StorageBinding,
    storage: StorageBuffer,
    ctx: Arc<DeviceContext>,
    stage: DispatchStage,
}

impl ComputeDispatcher {
    /// Set up everything, dispatch, and block until the device is done.
    pub fn new(params: &DispatchParams, options: &InstanceOptions) -> Result<Self, SetupError> {
        let span = info_span!("dispatch", shader = %params.shader.display());
        let _enter = span.enter();

        params.validate()?;
        let workgroups = params.workgroups()?;
        let mut stage = DispatchStage::Uninitialized;

        let ctx = Arc::new(DeviceContext::new(options)?);
        advance(&mut stage, DispatchStage::DeviceReady);

        let storage = create_buffer(&ctx, params.element_count(), HOST_ACCESSIBLE)?;
        fill_buffer(&storage, &params.data)?;
        advance(&mut stage, DispatchStage::BufferReady);

        let binding = create_descriptor_set(&ctx, &storage)?;
        advance(&mut stage, DispatchStage::DescriptorsReady);

        let pipeline = create_compute_pipeline(
            &ctx,
            params.shader_path(),
            &params.entry_point,
            binding.layout(),
        )?;
        advance(&mut stage, DispatchStage::PipelineReady);

        let command = record_dispatch(
            &ctx,
            pipeline.pipeline(),
            pipeline.layout(),
            binding.set(),
            workgroups,
        )?;
        submit(&ctx, &command)?;
        advance(&mut stage, DispatchStage::Dispatched);

        wait(&ctx, &command)?;
        advance(&mut stage, DispatchStage::Completed);

        info!(
            "dispatched {} workgroups of {} over {} elements",
            workgroups,
            params.local_size,
            params.element_count()
        );

        Ok(Self {
            command,
            pipeline,
            binding,
            storage,
            ctx,
            stage,
        })
    }

    pub fn device(&self) -> &ash::Device {
        self.ctx.device()
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.storage.memory()
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.storage.buffer()
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn device_name(&self) -> &str {
        self.ctx.device_name()
    }

    pub fn element_count(&self) -> usize {
        self.storage.element_count()
    }

    pub fn workgroups(&self) -> Extent3 {
        self.command.workgroups()
    }

    pub fn stage(&self) -> DispatchStage {
        self.stage
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline.pipeline()
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.binding.set()
    }

    /// Map the result buffer. Unmapped when the guard drops; mapping again
    /// while a guard is alive returns [`SetupError::AlreadyMapped`].
    pub fn map(&self) -> Result<MappedFloats<'_>, SetupError> {
        self.storage.map()
    }

    /// Copy the result buffer into a `Vec`.
    pub fn read_back(&self) -> Result<Vec<f32>, SetupError> {
        Ok(self.map()?.to_vec())
    }
}

fn advance(stage: &mut DispatchStage, next: DispatchStage) {
    debug_assert!(next > *stage, "stage must move forward");
    debug!("{} -> {}", stage, next);
    *stage = next;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_strictly_ordered() {
        let order = [
            DispatchStage::Uninitialized,
            DispatchStage::DeviceReady,
            DispatchStage::BufferReady,
            DispatchStage::DescriptorsReady,
            DispatchStage::PipelineReady,
            DispatchStage::Dispatched,
            DispatchStage::Completed,
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn advance_moves_forward() {
        let mut stage = DispatchStage::Uninitialized;
        advance(&mut stage, DispatchStage::DeviceReady);
        assert_eq!(stage, DispatchStage::DeviceReady);
        assert_eq!(stage.to_string(), "device ready");
    }

    #[test]
    fn invalid_params_fail_before_touching_vulkan() {
        let params = DispatchParams::new("unused.spv", vec![1.0; 4], [4, 1, 1], [0, 1, 1]);
        let err = ComputeDispatcher::new(&params, &InstanceOptions::default())
            .err()
            .expect("zero local size must be rejected");
        assert!(matches!(err, SetupError::Params(_)));
    }
}
