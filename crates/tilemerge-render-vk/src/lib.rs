// SPDX-License-Identifier: CEPL-1.0
//! Vulkan 1.0 backend for the tile renderer.
//!
//! [`VkRenderer`] pairs a [`FrameScheduler`] (ordering rules) with a `Gpu`
//! (every handle, plus the driver calls the scheduler asks for). The `Gpu`
//! starts out null and is filled one step at a time; dropping it at any point
//! hands whatever exists to the teardown sweep.
#![deny(unsafe_op_in_unsafe_fn)]

mod context;
mod debug;
pub mod device_select;
mod error;
pub mod frame;
pub mod geometry;
mod memory;
pub mod pipeline;
pub mod swapchain;
pub mod teardown;

use anyhow::{anyhow, Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tilemerge_render::{FrameOutcome, RenderSettings, RenderSize, Renderer, TileGrid};
use tracing::{debug, info, warn};

use context::GraphicsContext;
use frame::{
    classify_acquire, classify_present, hand_over_slots, Acquire, FrameOps, FrameScheduler,
    FrameSlot, Present,
};
use geometry::{
    build_tile_mesh, GeometryBuffers, UniformBlock, QUAD_INDEX_BYTES, QUAD_VERTEX_BYTES,
};
use pipeline::{create_set_layout, PipelineInputs, PipelineState, ShaderModules};
use swapchain::{negotiate_capabilities, SwapchainState};
use teardown::{sweep, AshDestroyer, TeardownRecord};

pub use error::GfxError;

pub struct VkRenderer {
    scheduler: FrameScheduler,
    gpu: Gpu,
}

struct Gpu {
    ctx: GraphicsContext,
    command_pool: vk::CommandPool,
    set_layout: vk::DescriptorSetLayout,
    shaders: ShaderModules,
    geometry: GeometryBuffers,
    slots: Vec<FrameSlot>,
    swapchain: SwapchainState,
    pipeline: PipelineState,
    settings: RenderSettings,
    size: RenderSize,
    clear: [f32; 4],
}

impl Drop for Gpu {
    fn drop(&mut self) {
        let mut record = TeardownRecord::default();
        hand_over_slots(&mut self.slots, &mut record);
        record.command_pool = std::mem::take(&mut self.command_pool);
        self.pipeline.hand_over(&mut record);
        self.swapchain.hand_over(&mut record);
        self.shaders.hand_over(&mut record);
        record.descriptor_set_layout = std::mem::take(&mut self.set_layout);
        record.buffers.extend(std::mem::take(&mut self.geometry).handles());
        self.ctx.hand_over(&mut record);
        sweep(&mut record, &mut self.ctx.destroyer());
    }
}

impl Gpu {
    fn empty(settings: RenderSettings, size: RenderSize) -> Self {
        let clear = settings.clear_color;
        Self {
            ctx: GraphicsContext::empty(),
            command_pool: vk::CommandPool::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            shaders: ShaderModules::default(),
            geometry: GeometryBuffers::default(),
            slots: Vec::new(),
            swapchain: SwapchainState::default(),
            pipeline: PipelineState::default(),
            settings,
            size,
            clear,
        }
    }

    /// Everything that outlives a swapchain rebuild.
    unsafe fn init(
        &mut self,
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
    ) -> Result<()> {
        let s = &self.settings;
        unsafe {
            self.ctx
                .create_instance(display, &s.app_name, &s.validation_layers)?;
            self.ctx.create_surface(window, display)?;
            self.ctx.create_device(&s.device_extensions)?;
            self.command_pool = self.ctx.create_command_pool()?;

            let device = self.ctx.device()?;
            self.set_layout = create_set_layout(device)?;
            self.shaders.create(device, s.shader_dir.as_deref())?;
            self.geometry
                .create(&self.ctx, s.vertex_buffer_bytes, s.index_buffer_bytes)?;
            for _ in 0..s.frames_in_flight {
                self.slots.push(FrameSlot::default());
                if let Some(slot) = self.slots.last_mut() {
                    slot.create(device)?;
                }
            }
        }
        Ok(())
    }

    fn slot(&self, i: usize) -> Result<FrameSlot> {
        self.slots
            .get(i)
            .copied()
            .ok_or_else(|| anyhow!("frame slot {i} does not exist"))
    }

    /// Destroys the swapchain set and builds a new one for the current size.
    /// `None` when the surface currently has no area.
    unsafe fn rebuild_swapchain(&mut self) -> Result<Option<usize>> {
        let device = self.ctx.device()?;
        unsafe { device.device_wait_idle() }.context("device_wait_idle")?;
        {
            let mut d = AshDestroyer::device_only(device, Some(self.ctx.swapchain_loader()?));
            let calls =
                self.pipeline.destroy(self.command_pool, &mut d) + self.swapchain.destroy(&mut d);
            debug!(calls, "old swapchain set destroyed");
        }

        if self.size.is_zero_area() {
            debug!("surface has no area; swapchain deferred");
            return Ok(None);
        }
        let negotiated =
            unsafe { negotiate_capabilities(&self.ctx, self.size, self.settings.present_mode) }?;
        if negotiated.extent.width == 0 || negotiated.extent.height == 0 {
            debug!("surface reports a zero extent; swapchain deferred");
            return Ok(None);
        }

        unsafe {
            self.swapchain
                .create(&self.ctx, &negotiated, self.set_layout)?;
            let inputs = PipelineInputs {
                pool: self.command_pool,
                swapchain: &self.swapchain,
                shaders: &self.shaders,
                set_layout: self.set_layout,
                geometry: &self.geometry,
                clear: self.clear,
            };
            self.pipeline.build(device, &inputs)?;
        }
        info!(
            "swapchain rebuilt: {}x{}, {} images",
            self.swapchain.extent.width,
            self.swapchain.extent.height,
            self.swapchain.image_count()
        );
        Ok(Some(self.swapchain.image_count()))
    }

    unsafe fn rerecord(&self) -> Result<()> {
        if !self.swapchain.is_live() {
            return Ok(());
        }
        let device = self.ctx.device()?;
        let inputs = PipelineInputs {
            pool: self.command_pool,
            swapchain: &self.swapchain,
            shaders: &self.shaders,
            set_layout: self.set_layout,
            geometry: &self.geometry,
            clear: self.clear,
        };
        unsafe {
            device.device_wait_idle().context("device_wait_idle")?;
            self.pipeline.record(device, &inputs)
        }
    }
}

impl FrameOps for Gpu {
    fn wait_fence(&mut self, slot: usize) -> Result<()> {
        let fence = self.slot(slot)?.in_flight;
        unsafe { self.ctx.device()?.wait_for_fences(&[fence], true, u64::MAX) }
            .context("wait_for_fences")
    }

    fn reset_fence(&mut self, slot: usize) -> Result<()> {
        let fence = self.slot(slot)?.in_flight;
        unsafe { self.ctx.device()?.reset_fences(&[fence]) }.context("reset_fences")
    }

    fn acquire(&mut self, slot: usize) -> Result<Acquire> {
        let s = self.slot(slot)?;
        let r = unsafe {
            self.ctx.swapchain_loader()?.acquire_next_image(
                self.swapchain.swapchain,
                u64::MAX,
                s.image_available,
                vk::Fence::null(),
            )
        };
        Ok(classify_acquire(r)?)
    }

    fn upload_geometry(&mut self, _slot: usize, image: u32, grid: &dyn TileGrid) -> Result<()> {
        let extent = self.swapchain.extent;
        let mesh = build_tile_mesh(
            grid,
            extent,
            self.geometry.vertex_bytes,
            self.geometry.index_bytes,
        )?;
        unsafe {
            self.geometry.upload(&self.ctx, self.command_pool, &mesh)?;
            self.swapchain.write_uniform(
                self.ctx.device()?,
                image as usize,
                &UniformBlock::for_extent(extent),
            )
        }
    }

    fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
        let s = self.slot(slot)?;
        let cmd = self
            .pipeline
            .command_buffer(image)
            .ok_or_else(|| anyhow!("no command buffer for image {image}"))?;
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &s.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &s.render_finished,
            ..Default::default()
        };
        unsafe {
            self.ctx.device()?.queue_submit(
                self.ctx.graphics_queue,
                std::slice::from_ref(&si),
                s.in_flight,
            )
        }
        .context("queue_submit")
    }

    fn present(&mut self, slot: usize, image: u32) -> Result<Present> {
        let s = self.slot(slot)?;
        let pi = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &s.render_finished,
            swapchain_count: 1,
            p_swapchains: &self.swapchain.swapchain,
            p_image_indices: &image,
            ..Default::default()
        };
        let r = unsafe {
            self.ctx
                .swapchain_loader()?
                .queue_present(self.ctx.present_queue, &pi)
        };
        Ok(classify_present(r)?)
    }

    fn rebuild(&mut self) -> Result<Option<usize>> {
        unsafe { self.rebuild_swapchain() }
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
    ) -> Result<Self> {
        let settings = settings
            .clone()
            .normalized(QUAD_VERTEX_BYTES, QUAD_INDEX_BYTES);
        let mut gpu = Gpu::empty(settings, size);
        unsafe {
            gpu.init(window, display)?;
        }
        let frames = gpu.settings.frames_in_flight;
        let scheduler = match unsafe { gpu.rebuild_swapchain() }? {
            Some(n) => FrameScheduler::new(frames, n),
            None => {
                let mut s = FrameScheduler::new(frames, 0);
                s.request_rebuild();
                s
            }
        };
        info!(
            "vulkan renderer ready ({} frames in flight, vsync={})",
            scheduler.frames_in_flight(),
            gpu.swapchain.vsync
        );
        Ok(Self { scheduler, gpu })
    }

    fn resize(&mut self, size: RenderSize) {
        if size == self.gpu.size && !self.scheduler.rebuild_pending() {
            return;
        }
        debug!("resize to {}x{}", size.width, size.height);
        self.gpu.size = size;
        self.scheduler.request_rebuild();
    }

    fn render(&mut self, grid: &dyn TileGrid) -> Result<FrameOutcome> {
        if self.gpu.size.is_zero_area() {
            return Ok(FrameOutcome::Paused);
        }
        self.scheduler.run_frame(&mut self.gpu, grid)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        if self.gpu.clear == rgba {
            return;
        }
        debug!(?rgba, "clear color changed");
        self.gpu.clear = rgba;
        if let Err(e) = unsafe { self.gpu.rerecord() } {
            warn!("re-recording with new clear color failed: {e:#}");
        }
    }

    fn device_does_vsync(&self) -> bool {
        self.gpu.swapchain.vsync
    }
}
