// SPDX-License-Identifier: CEPL-1.0
//! Shaders, render pass, graphics pipeline and the pre-recorded draw
//! command buffers (one per swapchain image).

use std::ffi::CStr;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use tracing::debug;

use crate::error::GfxError;
use crate::geometry::{GeometryBuffers, Vertex};
use crate::swapchain::SwapchainState;
use crate::teardown::{destroy_if_live, Destroyer, GpuObject, TeardownRecord};

pub const ENTRY_POINT: &CStr = c"main";

const VERT_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/vert.spv"));
const FRAG_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/frag.spv"));

const OP_ENTRY_POINT: u32 = 15;
const SPIRV_HEADER_WORDS: usize = 5;

/// Whether the module declares an `OpEntryPoint` called `name`.
pub fn has_entry_point(code: &[u32], name: &CStr) -> bool {
    let want = name.to_bytes();
    let mut i = SPIRV_HEADER_WORDS;
    while i < code.len() {
        let words = (code[i] >> 16) as usize;
        let opcode = code[i] & 0xffff;
        if words == 0 || i + words > code.len() {
            return false;
        }
        // OpEntryPoint: execution model, function id, then the literal name.
        if opcode == OP_ENTRY_POINT && words > 3 {
            let bytes: Vec<u8> = code[i + 3..i + words]
                .iter()
                .flat_map(|w| w.to_le_bytes())
                .collect();
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            if &bytes[..end] == want {
                return true;
            }
        }
        i += words;
    }
    false
}

/// SPIR-V for `file`, read from `dir` when one is configured and from the
/// copy compiled into the binary otherwise.
pub fn load_spirv(dir: Option<&Path>, file: &str, embedded: &[u8]) -> Result<Vec<u32>, GfxError> {
    let (path, code) = match dir {
        Some(dir) => {
            let path = dir.join(file);
            let code = File::open(&path).and_then(|mut f| read_spv(&mut f));
            (path, code)
        }
        None => (PathBuf::from(file), read_spv(&mut Cursor::new(embedded))),
    };
    let code = code.map_err(|source| GfxError::ShaderLoad {
        path: path.clone(),
        source,
    })?;
    if !has_entry_point(&code, ENTRY_POINT) {
        return Err(GfxError::MissingEntryPoint);
    }
    debug!(path = %path.display(), words = code.len(), "loaded shader");
    Ok(code)
}

/// Vertex and fragment modules. Created once and kept until teardown.
#[derive(Debug, Default)]
pub struct ShaderModules {
    pub vert: vk::ShaderModule,
    pub frag: vk::ShaderModule,
}

impl ShaderModules {
    pub(crate) unsafe fn create(&mut self, device: &ash::Device, dir: Option<&Path>) -> Result<()> {
        let vert = load_spirv(dir, "vert.spv", VERT_SPV)?;
        let frag = load_spirv(dir, "frag.spv", FRAG_SPV)?;
        self.vert = unsafe { create_module(device, &vert) }?;
        self.frag = unsafe { create_module(device, &frag) }?;
        Ok(())
    }

    pub fn hand_over(&mut self, record: &mut TeardownRecord) {
        let old = std::mem::take(self);
        record.shader_modules.extend([old.vert, old.frag]);
    }
}

unsafe fn create_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    unsafe { device.create_shader_module(&ci, None) }.context("create_shader_module")
}

/// One uniform buffer at binding 0, read by the vertex stage.
pub(crate) unsafe fn create_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let binding = vk::DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::VERTEX,
        ..Default::default()
    };
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: 1,
        p_bindings: &binding,
        ..Default::default()
    };
    unsafe { device.create_descriptor_set_layout(&ci, None) }
        .context("create_descriptor_set_layout")
}

/// Everything that depends on the swapchain's format, extent or image count
/// and is not owned by [`SwapchainState`].
#[derive(Debug, Default)]
pub struct PipelineState {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub command_buffers: Vec<vk::CommandBuffer>,
}

/// Every per-image array recorded against must have the same length N.
pub fn per_image_count(framebuffers: usize, command_buffers: usize, sets: usize) -> Result<usize> {
    if framebuffers != command_buffers || command_buffers != sets {
        return Err(anyhow!(
            "{command_buffers} command buffers for {framebuffers} framebuffers and {sets} descriptor sets"
        ));
    }
    Ok(command_buffers)
}

pub struct PipelineInputs<'a> {
    pub pool: vk::CommandPool,
    pub swapchain: &'a SwapchainState,
    pub shaders: &'a ShaderModules,
    pub set_layout: vk::DescriptorSetLayout,
    pub geometry: &'a GeometryBuffers,
    pub clear: [f32; 4],
}

impl PipelineState {
    pub(crate) unsafe fn build(&mut self, device: &ash::Device, inp: &PipelineInputs<'_>) -> Result<()> {
        let sc = inp.swapchain;
        unsafe {
            self.render_pass = create_render_pass(device, sc.format.format)?;

            let layout_info = vk::PipelineLayoutCreateInfo {
                s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
                set_layout_count: 1,
                p_set_layouts: &inp.set_layout,
                ..Default::default()
            };
            self.layout = device
                .create_pipeline_layout(&layout_info, None)
                .context("create_pipeline_layout")?;
            self.pipeline =
                create_pipeline(device, self.render_pass, self.layout, inp.shaders, sc.extent)?;

            for &view in &sc.views {
                let fb_info = vk::FramebufferCreateInfo {
                    s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                    render_pass: self.render_pass,
                    attachment_count: 1,
                    p_attachments: &view,
                    width: sc.extent.width,
                    height: sc.extent.height,
                    layers: 1,
                    ..Default::default()
                };
                let fb = device
                    .create_framebuffer(&fb_info, None)
                    .context("create_framebuffer")?;
                self.framebuffers.push(fb);
            }

            let alloc_info = vk::CommandBufferAllocateInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
                command_pool: inp.pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: sc.image_count() as u32,
                ..Default::default()
            };
            self.command_buffers = device
                .allocate_command_buffers(&alloc_info)
                .context("allocate_command_buffers")?;

            self.record(device, inp)
        }
    }

    /// Records the whole frame for every image: clear, bind, one indexed draw
    /// over the full index buffer. The buffers must not be in flight.
    pub(crate) unsafe fn record(&self, device: &ash::Device, inp: &PipelineInputs<'_>) -> Result<()> {
        let sc = inp.swapchain;
        per_image_count(
            self.framebuffers.len(),
            self.command_buffers.len(),
            sc.descriptor_sets.len(),
        )?;
        let clears = [vk::ClearValue {
            color: vk::ClearColorValue { float32: inp.clear },
        }];
        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            let begin = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                ..Default::default()
            };
            let rp_begin = vk::RenderPassBeginInfo {
                s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                render_pass: self.render_pass,
                framebuffer: self.framebuffers[i],
                render_area: vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: sc.extent,
                },
                clear_value_count: clears.len() as u32,
                p_clear_values: clears.as_ptr(),
                ..Default::default()
            };
            unsafe {
                device
                    .begin_command_buffer(cmd, &begin)
                    .context("begin_command_buffer")?;
                device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.layout,
                    0,
                    &[sc.descriptor_sets[i]],
                    &[],
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[inp.geometry.vertex], &[0]);
                device.cmd_bind_index_buffer(cmd, inp.geometry.index, 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(cmd, inp.geometry.index_count(), 1, 0, 0, 0);
                device.cmd_end_render_pass(cmd);
                device
                    .end_command_buffer(cmd)
                    .context("end_command_buffer")?;
            }
        }
        debug!(buffers = self.command_buffers.len(), "recorded draw commands");
        Ok(())
    }

    pub fn command_buffer(&self, image: u32) -> Option<vk::CommandBuffer> {
        self.command_buffers.get(image as usize).copied()
    }

    /// Framebuffers, command buffers, pipeline, layout, render pass.
    pub fn destroy(&mut self, pool: vk::CommandPool, d: &mut dyn Destroyer) -> usize {
        let old = std::mem::take(self);
        let mut calls = 0;
        let mut kill = |o| calls += usize::from(destroy_if_live(d, o));
        for fb in old.framebuffers {
            kill(GpuObject::Framebuffer(fb));
        }
        for cb in old.command_buffers {
            kill(GpuObject::CommandBuffer(pool, cb));
        }
        kill(GpuObject::Pipeline(old.pipeline));
        kill(GpuObject::PipelineLayout(old.layout));
        kill(GpuObject::RenderPass(old.render_pass));
        calls
    }

    /// Command buffers go with their pool.
    pub fn hand_over(&mut self, record: &mut TeardownRecord) {
        let old = std::mem::take(self);
        record.framebuffers = old.framebuffers;
        record.pipeline = old.pipeline;
        record.pipeline_layout = old.layout;
        record.render_pass = old.render_pass;
    }
}

unsafe fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let color_att = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let att_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &att_ref,
        ..Default::default()
    };
    // The acquire semaphore is waited on at this stage; the layout transition
    // must not start before it.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_att,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    unsafe { device.create_render_pass(&rp_info, None) }.context("create_render_pass")
}

unsafe fn create_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    shaders: &ShaderModules,
    extent: vk::Extent2D,
) -> Result<vk::Pipeline> {
    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: shaders.vert,
            p_name: ENTRY_POINT.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: shaders.frag,
            p_name: ENTRY_POINT.as_ptr(),
            ..Default::default()
        },
    ];

    let vb = vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let va = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: 0,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: std::mem::size_of::<[f32; 2]>() as u32,
        },
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    // Baked into the pipeline; a resize rebuilds it.
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        p_viewports: &viewport,
        scissor_count: 1,
        p_scissors: &scissor,
        ..Default::default()
    };
    // Quads wind clockwise on screen.
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };
    let pipelines = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    }
    .map_err(|(_, code)| GfxError::unexpected("create_graphics_pipelines", code))?;
    pipelines
        .first()
        .copied()
        .ok_or_else(|| anyhow!("create_graphics_pipelines returned nothing"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::teardown::tests::Recorder;
    use ash::vk::Handle;

    const MAGIC: u32 = 0x0723_0203;

    fn module_with_entry(name: &[u8; 4]) -> Vec<u32> {
        vec![
            MAGIC,
            0x0001_0000,
            0,
            8,
            0,
            (5 << 16) | OP_ENTRY_POINT,
            0,
            1,
            u32::from_le_bytes(*name),
            0,
        ]
    }

    #[test]
    fn entry_point_is_found_by_name() {
        let code = module_with_entry(b"main");
        assert!(has_entry_point(&code, c"main"));
        assert!(!has_entry_point(&code, c"mai"));
        assert!(!has_entry_point(&module_with_entry(b"frag"), c"main"));
    }

    #[test]
    fn truncated_or_empty_modules_have_no_entry_point() {
        assert!(!has_entry_point(&[], c"main"));
        let mut code = module_with_entry(b"main");
        code.truncate(7);
        assert!(!has_entry_point(&code, c"main"));
    }

    #[test]
    fn embedded_shaders_declare_main() {
        assert!(load_spirv(None, "vert.spv", VERT_SPV).is_ok());
        assert!(load_spirv(None, "frag.spv", FRAG_SPV).is_ok());
    }

    #[test]
    fn missing_shader_dir_reports_the_path() {
        let dir = Path::new("/nonexistent/tilemerge-shaders");
        match load_spirv(Some(dir), "vert.spv", VERT_SPV) {
            Err(GfxError::ShaderLoad { path, .. }) => assert_eq!(path, dir.join("vert.spv")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn garbage_bytes_fail_to_load() {
        assert!(matches!(
            load_spirv(None, "bad.spv", &[1, 2, 3]),
            Err(GfxError::ShaderLoad { .. })
        ));
    }

    #[test]
    fn recording_needs_one_of_everything_per_image() {
        assert_eq!(per_image_count(3, 3, 3).unwrap(), 3);
        assert_eq!(per_image_count(0, 0, 0).unwrap(), 0);
        assert!(per_image_count(3, 2, 3).is_err());
        assert!(per_image_count(3, 3, 4).is_err());
    }

    #[test]
    fn destroy_frees_buffers_before_pipeline_objects() {
        let pool = vk::CommandPool::from_raw(99);
        let mut rec = Recorder::default();
        let mut state = PipelineState {
            render_pass: vk::RenderPass::from_raw(1),
            layout: vk::PipelineLayout::from_raw(2),
            pipeline: vk::Pipeline::from_raw(3),
            framebuffers: vec![vk::Framebuffer::from_raw(4), vk::Framebuffer::from_raw(5)],
            command_buffers: vec![vk::CommandBuffer::from_raw(6), vk::CommandBuffer::from_raw(7)],
        };
        assert_eq!(state.destroy(pool, &mut rec), 7);
        assert_eq!(
            rec.calls.last(),
            Some(&GpuObject::RenderPass(vk::RenderPass::from_raw(1)))
        );
        assert_eq!(
            rec.calls[2],
            GpuObject::CommandBuffer(pool, vk::CommandBuffer::from_raw(6))
        );
        assert!(state.framebuffers.is_empty());
        assert_eq!(state.destroy(pool, &mut rec), 0);
    }

    #[test]
    fn hand_over_leaves_command_buffers_to_the_pool() {
        let mut state = PipelineState {
            pipeline: vk::Pipeline::from_raw(3),
            command_buffers: vec![vk::CommandBuffer::from_raw(6)],
            ..Default::default()
        };
        let mut record = TeardownRecord::default();
        state.hand_over(&mut record);
        assert_eq!(record.pipeline, vk::Pipeline::from_raw(3));
        assert!(state.command_buffers.is_empty());
    }
}
