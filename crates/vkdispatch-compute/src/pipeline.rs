use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::context::DeviceContext;
use crate::error::{vk_call, SetupError};
use crate::shader::{create_shader_module, load_shader};
use vkdispatch_core::CoreError;

/// Shader module, pipeline layout and compute pipeline built around one
/// descriptor set layout.
pub struct ComputePipeline {
    ctx: Arc<DeviceContext>,
    shader_module: vk::ShaderModule,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl ComputePipeline {
    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn shader_module(&self) -> vk::ShaderModule {
        self.shader_module
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.layout, None);
            }
            device.destroy_shader_module(self.shader_module, None);
        }
        debug!("destroyed compute pipeline");
    }
}

/// Load the shader at `shader_path` and build a compute pipeline whose
/// only descriptor set uses `set_layout`.
pub fn create_compute_pipeline(
    ctx: &Arc<DeviceContext>,
    shader_path: &Path,
    entry_point: &str,
    set_layout: vk::DescriptorSetLayout,
) -> Result<ComputePipeline, SetupError> {
    let entry_point = CString::new(entry_point).map_err(|_| {
        CoreError::InvalidParams(format!("invalid entry point name {:?}", entry_point))
    })?;
    let code = load_shader(shader_path)?;

    let device = ctx.device();
    let shader_module = create_shader_module(device, &code)?;
    let mut pipeline = ComputePipeline {
        ctx: Arc::clone(ctx),
        shader_module,
        layout: vk::PipelineLayout::null(),
        pipeline: vk::Pipeline::null(),
    };

    let set_layouts = [set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    pipeline.layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(vk_call("vkCreatePipelineLayout"))?;

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader_module)
        .name(entry_point.as_c_str());
    let create_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(pipeline.layout);

    let pipelines = unsafe {
        device.create_compute_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&create_info),
            None,
        )
    }
    .map_err(|(_, e)| vk_call("vkCreateComputePipelines")(e))?;
    pipeline.pipeline = pipelines[0];

    info!(
        "built compute pipeline from {} ({} words, entry '{}')",
        shader_path.display(),
        code.len(),
        entry_point.to_string_lossy()
    );
    Ok(pipeline)
}
