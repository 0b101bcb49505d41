// SPDX-License-Identifier: CEPL-1.0
//! Swapchain negotiation and the per-image resource set.
//!
//! Everything sized by the image count lives in [`SwapchainState`] and is
//! created and destroyed together; nothing else may hold on to per-image
//! handles across a rebuild.

use anyhow::{anyhow, Context, Result};
use ash::vk::{self, Handle};
use tilemerge_render::{PresentPreference, RenderSize};
use tracing::info;

use crate::context::GraphicsContext;
use crate::geometry::UniformBlock;
use crate::memory::{align_up, create_buffer_and_memory, write_mapped};
use crate::teardown::{destroy_if_live, Destroyer, GpuObject, TeardownRecord};

#[derive(Clone, Copy, Debug)]
pub struct SurfaceCapabilities {
    pub caps: vk::SurfaceCapabilitiesKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub vsync: bool,
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    pref: PresentPreference,
) -> vk::PresentModeKHR {
    let order: &[vk::PresentModeKHR] = match pref {
        PresentPreference::Mailbox => &[vk::PresentModeKHR::MAILBOX],
        PresentPreference::Fifo => &[],
        PresentPreference::Immediate => {
            &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
        }
    };
    // FIFO is always supported and is the fallback for everything.
    order
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn mode_does_vsync(mode: vk::PresentModeKHR) -> bool {
    mode == vk::PresentModeKHR::FIFO || mode == vk::PresentModeKHR::FIFO_RELAXED
}

/// The surface's fixed extent when it has one, otherwise the drawable size;
/// clamped to the surface limits either way.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    let base = if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want.width,
            height: want.height,
        }
    };
    vk::Extent2D {
        width: clamp_axis(
            base.width,
            caps.min_image_extent.width,
            caps.max_image_extent.width,
        ),
        height: clamp_axis(
            base.height,
            caps.min_image_extent.height,
            caps.max_image_extent.height,
        ),
    }
}

fn clamp_axis(v: u32, min: u32, max: u32) -> u32 {
    v.clamp(min, max.max(min))
}

/// One more than the minimum, capped by the maximum (0 means uncapped).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

pub fn negotiate(
    caps: vk::SurfaceCapabilitiesKHR,
    formats: &[vk::SurfaceFormatKHR],
    modes: &[vk::PresentModeKHR],
    want: RenderSize,
    pref: PresentPreference,
) -> Result<SurfaceCapabilities> {
    let format = choose_surface_format(formats).ok_or_else(|| anyhow!("surface reports no formats"))?;
    let present_mode = choose_present_mode(modes, pref);
    Ok(SurfaceCapabilities {
        caps,
        format,
        present_mode,
        extent: choose_extent(&caps, want),
        image_count: choose_image_count(&caps),
        vsync: mode_does_vsync(present_mode),
    })
}

/// Reads the current surface state and negotiates against it.
pub(crate) unsafe fn negotiate_capabilities(
    ctx: &GraphicsContext,
    want: RenderSize,
    pref: PresentPreference,
) -> Result<SurfaceCapabilities> {
    let loader = ctx.surface_loader()?;
    let surface = ctx.surface();
    let (caps, formats, modes) = unsafe {
        (
            loader
                .get_physical_device_surface_capabilities(ctx.phys, surface)
                .context("get_physical_device_surface_capabilities")?,
            loader
                .get_physical_device_surface_formats(ctx.phys, surface)
                .context("get_physical_device_surface_formats")?,
            loader
                .get_physical_device_surface_present_modes(ctx.phys, surface)
                .context("get_physical_device_surface_present_modes")?,
        )
    };
    negotiate(caps, &formats, &modes, want, pref)
}

#[derive(Debug, Default)]
pub struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub vsync: bool,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub uniform_buffer: vk::Buffer,
    pub uniform_memory: vk::DeviceMemory,
    /// Byte distance between per-image uniform slices.
    pub uniform_stride: vk::DeviceSize,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
}

impl SwapchainState {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn is_live(&self) -> bool {
        !self.swapchain.is_null()
    }

    /// Builds the swapchain and its per-image views, uniform slices and
    /// descriptor sets. Handles land in `self` as they are created.
    pub(crate) unsafe fn create(
        &mut self,
        ctx: &GraphicsContext,
        negotiated: &SurfaceCapabilities,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<()> {
        let device = ctx.device()?;
        let loader = ctx.swapchain_loader()?;
        let caps = &negotiated.caps;

        let family_indices = [ctx.families.graphics, ctx.families.present];
        let (sharing_mode, index_count) = if ctx.families.shared() {
            (vk::SharingMode::EXCLUSIVE, 0)
        } else {
            (vk::SharingMode::CONCURRENT, 2)
        };
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface(),
            min_image_count: negotiated.image_count,
            image_format: negotiated.format.format,
            image_color_space: negotiated.format.color_space,
            image_extent: negotiated.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: index_count,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: negotiated.present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        self.swapchain =
            unsafe { loader.create_swapchain(&info, None) }.context("create_swapchain")?;
        self.format = negotiated.format;
        self.extent = negotiated.extent;
        self.present_mode = negotiated.present_mode;
        self.vsync = negotiated.vsync;

        // The platform may hand back more images than requested; from here on
        // its count is the only one that matters.
        self.images = unsafe { loader.get_swapchain_images(self.swapchain) }
            .context("get_swapchain_images")?;
        let n = self.images.len();

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: self.format.format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = unsafe { device.create_image_view(&view_info, None) }
                .context("create_image_view")?;
            self.views.push(view);
        }

        self.uniform_stride = align_up(
            std::mem::size_of::<UniformBlock>() as vk::DeviceSize,
            ctx.min_uniform_offset_alignment,
        );
        let (buf, mem) = unsafe {
            create_buffer_and_memory(
                ctx.instance()?,
                device,
                ctx.phys,
                self.uniform_stride * n as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
        }?;
        self.uniform_buffer = buf;
        self.uniform_memory = mem;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: n as u32,
        }];
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: n as u32,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        self.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_ci, None) }
            .context("create_descriptor_pool")?;

        let layouts = vec![set_layout; n];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: n as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        self.descriptor_sets =
            unsafe { device.allocate_descriptor_sets(&alloc) }.context("allocate_descriptor_sets")?;

        let infos: Vec<vk::DescriptorBufferInfo> = (0..n)
            .map(|i| vk::DescriptorBufferInfo {
                buffer: self.uniform_buffer,
                offset: self.uniform_stride * i as vk::DeviceSize,
                range: std::mem::size_of::<UniformBlock>() as vk::DeviceSize,
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .zip(&self.descriptor_sets)
            .map(|(info, &set)| vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        info!(
            "swapchain: {:?} / {:?}, {:?} (vsync={}), {}x{}, images requested {} got {}",
            self.format.format,
            self.format.color_space,
            self.present_mode,
            self.vsync,
            self.extent.width,
            self.extent.height,
            negotiated.image_count,
            n
        );
        Ok(())
    }

    pub(crate) unsafe fn write_uniform(
        &self,
        device: &ash::Device,
        image: usize,
        block: &UniformBlock,
    ) -> Result<()> {
        if image >= self.image_count() {
            return Err(anyhow!("uniform slice {image} out of range"));
        }
        unsafe {
            write_mapped(
                device,
                self.uniform_memory,
                self.uniform_stride * image as vk::DeviceSize,
                bytemuck::bytes_of(block),
            )
        }
    }

    /// Descriptor pool, uniform buffer and memory, image views, swapchain.
    /// Leaves `self` empty; calling it again does nothing.
    pub fn destroy(&mut self, d: &mut dyn Destroyer) -> usize {
        let old = std::mem::take(self);
        let mut calls = 0;
        let mut kill = |o| calls += usize::from(destroy_if_live(d, o));
        kill(GpuObject::DescriptorPool(old.descriptor_pool));
        kill(GpuObject::Buffer(old.uniform_buffer));
        kill(GpuObject::Memory(old.uniform_memory));
        for v in old.views {
            kill(GpuObject::ImageView(v));
        }
        kill(GpuObject::Swapchain(old.swapchain));
        calls
    }

    pub fn hand_over(&mut self, record: &mut TeardownRecord) {
        let old = std::mem::take(self);
        record.image_views = old.views;
        record.swapchain = old.swapchain;
        record.buffers.push((old.uniform_buffer, old.uniform_memory));
        record.descriptor_pool = old.descriptor_pool;
    }
}
