// SPDX-License-Identifier: CEPL-1.0
//! Ordered destruction of every GPU object the renderer owns.
//!
//! All handles are gathered into one flat [`TeardownRecord`]; [`sweep`] walks
//! it dependents-first and skips anything still null, so a record from a
//! half-finished init is as safe to sweep as a complete one.

use ash::khr::{surface, swapchain};
use ash::vk::{self, Handle};
use tracing::{debug, info};

/// One destructive call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuObject {
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
    CommandPool(vk::CommandPool),
    CommandBuffer(vk::CommandPool, vk::CommandBuffer),
    Framebuffer(vk::Framebuffer),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    RenderPass(vk::RenderPass),
    ShaderModule(vk::ShaderModule),
    ImageView(vk::ImageView),
    Swapchain(vk::SwapchainKHR),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    Buffer(vk::Buffer),
    Memory(vk::DeviceMemory),
    DescriptorPool(vk::DescriptorPool),
    Surface(vk::SurfaceKHR),
    Device(vk::Device),
    DebugMessenger(vk::DebugUtilsMessengerEXT),
    Instance(vk::Instance),
}

impl GpuObject {
    pub fn is_null(&self) -> bool {
        match *self {
            Self::Semaphore(h) => h.is_null(),
            Self::Fence(h) => h.is_null(),
            Self::CommandPool(h) => h.is_null(),
            Self::CommandBuffer(p, h) => p.is_null() || h.is_null(),
            Self::Framebuffer(h) => h.is_null(),
            Self::Pipeline(h) => h.is_null(),
            Self::PipelineLayout(h) => h.is_null(),
            Self::RenderPass(h) => h.is_null(),
            Self::ShaderModule(h) => h.is_null(),
            Self::ImageView(h) => h.is_null(),
            Self::Swapchain(h) => h.is_null(),
            Self::DescriptorSetLayout(h) => h.is_null(),
            Self::Buffer(h) => h.is_null(),
            Self::Memory(h) => h.is_null(),
            Self::DescriptorPool(h) => h.is_null(),
            Self::Surface(h) => h.is_null(),
            Self::Device(h) => h.is_null(),
            Self::DebugMessenger(h) => h.is_null(),
            Self::Instance(h) => h.is_null(),
        }
    }
}

/// Receiver of destructive calls. The ash implementation talks to the driver;
/// tests substitute a recorder.
pub trait Destroyer {
    fn wait_idle(&mut self);
    fn destroy(&mut self, object: GpuObject);
}

/// Destroys `object` unless it is null. Returns whether a call was made.
pub fn destroy_if_live(d: &mut dyn Destroyer, object: GpuObject) -> bool {
    if object.is_null() {
        return false;
    }
    d.destroy(object);
    true
}

#[derive(Debug, Default)]
pub struct TeardownRecord {
    pub instance: vk::Instance,
    pub debug_messenger: vk::DebugUtilsMessengerEXT,
    pub surface: vk::SurfaceKHR,
    pub device: vk::Device,
    pub semaphores: Vec<vk::Semaphore>,
    pub fences: Vec<vk::Fence>,
    pub command_pool: vk::CommandPool,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub shader_modules: Vec<vk::ShaderModule>,
    pub image_views: Vec<vk::ImageView>,
    pub swapchain: vk::SwapchainKHR,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    /// Vertex, index and uniform buffers with their backing memory.
    pub buffers: Vec<(vk::Buffer, vk::DeviceMemory)>,
    pub descriptor_pool: vk::DescriptorPool,
}

/// Destroys everything in `record`, leaving it empty. Returns the number of
/// destructive calls issued.
pub fn sweep(record: &mut TeardownRecord, d: &mut dyn Destroyer) -> usize {
    let r = std::mem::take(record);
    if !r.instance.is_null() {
        info!("teardown");
    }
    if !r.device.is_null() {
        d.wait_idle();
    }

    let mut order: Vec<GpuObject> = Vec::new();
    order.extend(r.semaphores.into_iter().map(GpuObject::Semaphore));
    order.extend(r.fences.into_iter().map(GpuObject::Fence));
    order.push(GpuObject::CommandPool(r.command_pool));
    order.extend(r.framebuffers.into_iter().map(GpuObject::Framebuffer));
    order.push(GpuObject::Pipeline(r.pipeline));
    order.push(GpuObject::PipelineLayout(r.pipeline_layout));
    order.push(GpuObject::RenderPass(r.render_pass));
    order.extend(r.shader_modules.into_iter().map(GpuObject::ShaderModule));
    order.extend(r.image_views.into_iter().map(GpuObject::ImageView));
    order.push(GpuObject::Swapchain(r.swapchain));
    order.push(GpuObject::DescriptorSetLayout(r.descriptor_set_layout));
    for (buf, mem) in r.buffers {
        order.push(GpuObject::Buffer(buf));
        order.push(GpuObject::Memory(mem));
    }
    order.push(GpuObject::DescriptorPool(r.descriptor_pool));
    order.push(GpuObject::Surface(r.surface));
    order.push(GpuObject::Device(r.device));
    order.push(GpuObject::DebugMessenger(r.debug_messenger));
    order.push(GpuObject::Instance(r.instance));

    let calls = order
        .into_iter()
        .filter(|&o| destroy_if_live(d, o))
        .count();
    debug!(calls, "teardown sweep done");
    calls
}

/// Routes destructive calls to the driver through whichever loaders exist.
/// A missing loader turns the corresponding calls into no-ops.
pub struct AshDestroyer<'a> {
    pub instance: Option<&'a ash::Instance>,
    pub device: Option<&'a ash::Device>,
    pub surface: Option<&'a surface::Instance>,
    pub swapchain: Option<&'a swapchain::Device>,
    pub debug_utils: Option<&'a ash::ext::debug_utils::Instance>,
}

impl<'a> AshDestroyer<'a> {
    pub fn device_only(device: &'a ash::Device, swapchain: Option<&'a swapchain::Device>) -> Self {
        Self {
            instance: None,
            device: Some(device),
            surface: None,
            swapchain,
            debug_utils: None,
        }
    }
}

impl Destroyer for AshDestroyer<'_> {
    fn wait_idle(&mut self) {
        if let Some(d) = self.device {
            // Best-effort: a lost device still has to be torn down.
            let _ = unsafe { d.device_wait_idle() };
        }
    }

    fn destroy(&mut self, object: GpuObject) {
        use GpuObject as O;
        unsafe {
            match (object, self.device) {
                (O::Semaphore(h), Some(d)) => d.destroy_semaphore(h, None),
                (O::Fence(h), Some(d)) => d.destroy_fence(h, None),
                (O::CommandPool(h), Some(d)) => d.destroy_command_pool(h, None),
                (O::CommandBuffer(p, h), Some(d)) => d.free_command_buffers(p, &[h]),
                (O::Framebuffer(h), Some(d)) => d.destroy_framebuffer(h, None),
                (O::Pipeline(h), Some(d)) => d.destroy_pipeline(h, None),
                (O::PipelineLayout(h), Some(d)) => d.destroy_pipeline_layout(h, None),
                (O::RenderPass(h), Some(d)) => d.destroy_render_pass(h, None),
                (O::ShaderModule(h), Some(d)) => d.destroy_shader_module(h, None),
                (O::ImageView(h), Some(d)) => d.destroy_image_view(h, None),
                (O::DescriptorSetLayout(h), Some(d)) => d.destroy_descriptor_set_layout(h, None),
                (O::Buffer(h), Some(d)) => d.destroy_buffer(h, None),
                (O::Memory(h), Some(d)) => d.free_memory(h, None),
                (O::DescriptorPool(h), Some(d)) => d.destroy_descriptor_pool(h, None),
                (O::Device(_), Some(d)) => d.destroy_device(None),
                (O::Swapchain(h), _) => {
                    if let Some(s) = self.swapchain {
                        s.destroy_swapchain(h, None);
                    }
                }
                (O::Surface(h), _) => {
                    if let Some(s) = self.surface {
                        s.destroy_surface(h, None);
                    }
                }
                (O::DebugMessenger(h), _) => {
                    if let Some(du) = self.debug_utils {
                        du.destroy_debug_utils_messenger(h, None);
                    }
                }
                (O::Instance(_), _) => {
                    if let Some(i) = self.instance {
                        i.destroy_instance(None);
                    }
                }
                (_, None) => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct Recorder {
        pub waits: usize,
        pub calls: Vec<GpuObject>,
    }

    impl Destroyer for Recorder {
        fn wait_idle(&mut self) {
            self.waits += 1;
        }
        fn destroy(&mut self, object: GpuObject) {
            self.calls.push(object);
        }
    }

    fn h<T: Handle>(raw: u64) -> T {
        T::from_raw(raw)
    }

    fn full_record() -> TeardownRecord {
        TeardownRecord {
            instance: h(1),
            debug_messenger: h(2),
            surface: h(3),
            device: h(4),
            semaphores: vec![h(10), h(11)],
            fences: vec![h(12)],
            command_pool: h(20),
            framebuffers: vec![h(30), h(31)],
            pipeline: h(40),
            pipeline_layout: h(41),
            render_pass: h(42),
            shader_modules: vec![h(50), h(51)],
            image_views: vec![h(60), h(61)],
            swapchain: h(70),
            descriptor_set_layout: h(80),
            buffers: vec![(h(90), h(91)), (h(92), h(93))],
            descriptor_pool: h(100),
        }
    }

    fn position(calls: &[GpuObject], pred: impl Fn(&GpuObject) -> bool) -> usize {
        calls.iter().position(pred).unwrap()
    }

    #[test]
    fn empty_record_makes_no_calls() {
        let mut rec = Recorder::default();
        let n = sweep(&mut TeardownRecord::default(), &mut rec);
        assert_eq!(n, 0);
        assert!(rec.calls.is_empty());
        assert_eq!(rec.waits, 0);
    }

    #[test]
    fn full_record_is_destroyed_dependents_first() {
        let mut rec = Recorder::default();
        let mut record = full_record();
        let n = sweep(&mut record, &mut rec);
        assert_eq!(n, rec.calls.len());
        assert_eq!(n, 24);
        assert_eq!(rec.waits, 1);

        let c = &rec.calls;
        let sync = position(c, |o| matches!(o, GpuObject::Fence(_)));
        let pool = position(c, |o| matches!(o, GpuObject::CommandPool(_)));
        let fb = position(c, |o| matches!(o, GpuObject::Framebuffer(_)));
        let pipe = position(c, |o| matches!(o, GpuObject::Pipeline(_)));
        let rp = position(c, |o| matches!(o, GpuObject::RenderPass(_)));
        let view = position(c, |o| matches!(o, GpuObject::ImageView(_)));
        let sc = position(c, |o| matches!(o, GpuObject::Swapchain(_)));
        let dpool = position(c, |o| matches!(o, GpuObject::DescriptorPool(_)));
        let surf = position(c, |o| matches!(o, GpuObject::Surface(_)));
        let dev = position(c, |o| matches!(o, GpuObject::Device(_)));
        let inst = position(c, |o| matches!(o, GpuObject::Instance(_)));
        assert!(sync < pool && pool < fb && fb < pipe && pipe < rp);
        assert!(rp < view && view < sc && sc < dpool && dpool < surf);
        assert!(surf < dev && dev < inst);
        assert_eq!(inst, c.len() - 1);
    }

    #[test]
    fn sweep_empties_the_record() {
        let mut rec = Recorder::default();
        let mut record = full_record();
        sweep(&mut record, &mut rec);
        let before = rec.calls.len();
        assert_eq!(sweep(&mut record, &mut rec), 0);
        assert_eq!(rec.calls.len(), before);
    }

    #[test]
    fn partial_init_only_touches_what_exists() {
        let mut rec = Recorder::default();
        let mut record = TeardownRecord {
            instance: h(1),
            surface: h(3),
            ..Default::default()
        };
        assert_eq!(sweep(&mut record, &mut rec), 2);
        assert_eq!(rec.waits, 0);
        assert_eq!(
            rec.calls,
            vec![GpuObject::Surface(h(3)), GpuObject::Instance(h(1))]
        );
    }

    #[test]
    fn null_entries_inside_lists_are_skipped() {
        let mut rec = Recorder::default();
        let mut record = TeardownRecord {
            device: h(4),
            image_views: vec![h(60), vk::ImageView::null()],
            buffers: vec![(h(90), vk::DeviceMemory::null())],
            ..Default::default()
        };
        assert_eq!(sweep(&mut record, &mut rec), 3);
        assert!(!rec.calls.iter().any(|o| o.is_null()));
    }
}
