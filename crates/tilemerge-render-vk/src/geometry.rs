// SPDX-License-Identifier: CEPL-1.0
//! Per-frame tile geometry.
//!
//! The vertex and index buffers have a fixed capacity and are rewritten in
//! full every frame: the mesh goes first and the remainder is zero-filled, so
//! the unused tail of the index buffer only produces degenerate triangles.

use anyhow::Result;
use ash::vk::{self, Handle};
use bytemuck::{Pod, Zeroable};
use tilemerge_math::{pixel_to_ndc, GridLayout, Mat4};
use tilemerge_render::TileGrid;
use tracing::trace;

use crate::context::GraphicsContext;
use crate::error::GfxError;
use crate::memory::{create_buffer_and_memory, one_shot, write_mapped};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformBlock {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

impl UniformBlock {
    pub fn for_extent(extent: vk::Extent2D) -> Self {
        Self {
            model: pixel_to_ndc(extent.width, extent.height).to_cols_array_2d(),
            view: Mat4::IDENTITY.to_cols_array_2d(),
            proj: Mat4::IDENTITY.to_cols_array_2d(),
        }
    }
}

pub const VERTICES_PER_QUAD: usize = 4;
pub const INDICES_PER_QUAD: usize = 6;
pub const QUAD_VERTEX_BYTES: u64 = (VERTICES_PER_QUAD * std::mem::size_of::<Vertex>()) as u64;
pub const QUAD_INDEX_BYTES: u64 = (INDICES_PER_QUAD * std::mem::size_of::<u32>()) as u64;

pub const PALETTE_LEN: usize = 12;

/// White for the empty cell, then a blue→red→green ramp for values 1..=11.
pub fn palette() -> [[f32; 3]; PALETTE_LEN] {
    let mut colors = [[0.0; 3]; PALETTE_LEN];
    colors[0] = [1.0, 1.0, 1.0];
    for (i, c) in colors.iter_mut().enumerate().skip(1) {
        let t = (i as f32 - 1.0) / (PALETTE_LEN as f32 - 2.0);
        *c = if t <= 0.5 {
            let t = t * 2.0;
            [t, 0.0, 1.0 - t]
        } else {
            let t = 2.0 * t - 1.0;
            [1.0 - t, t, 0.0]
        };
    }
    colors
}

pub fn tile_color(value: u32) -> [f32; 3] {
    palette()[(value as usize).min(PALETTE_LEN - 1)]
}

#[derive(Debug, Default, PartialEq)]
pub struct TileMesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl TileMesh {
    pub fn quads(&self) -> usize {
        self.vertices.len() / VERTICES_PER_QUAD
    }
}

/// One quad per non-empty cell, laid out for a surface of `extent`.
pub fn build_tile_mesh(
    grid: &dyn TileGrid,
    extent: vk::Extent2D,
    vertex_capacity: u64,
    index_capacity: u64,
) -> Result<TileMesh, GfxError> {
    let (gw, gh) = grid.dims();
    let layout = GridLayout::new(extent.width, extent.height, gw.max(gh));
    let colors = palette();

    let mut mesh = TileMesh::default();
    for y in 0..gh {
        for x in 0..gw {
            let v = grid.value(x, y);
            if v == 0 {
                continue;
            }
            let color = colors[(v as usize).min(PALETTE_LEN - 1)];
            let base = mesh.vertices.len() as u32;
            mesh.vertices.extend(
                layout
                    .quad_corners(x, y)
                    .map(|p| Vertex { pos: p.to_array(), color }),
            );
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }
    }

    let vbytes = (mesh.vertices.len() * std::mem::size_of::<Vertex>()) as u64;
    if vbytes > vertex_capacity {
        return Err(GfxError::GeometryOverflow {
            needed: vbytes,
            capacity: vertex_capacity,
        });
    }
    let ibytes = (mesh.indices.len() * std::mem::size_of::<u32>()) as u64;
    if ibytes > index_capacity {
        return Err(GfxError::GeometryOverflow {
            needed: ibytes,
            capacity: index_capacity,
        });
    }
    Ok(mesh)
}

/// `bytes` followed by zeros up to `capacity`.
fn padded(bytes: &[u8], capacity: usize) -> Vec<u8> {
    let mut out = vec![0u8; capacity];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// Device-local vertex and index buffers shared by every swapchain image.
#[derive(Debug, Default)]
pub struct GeometryBuffers {
    pub vertex: vk::Buffer,
    pub vertex_memory: vk::DeviceMemory,
    pub index: vk::Buffer,
    pub index_memory: vk::DeviceMemory,
    pub vertex_bytes: u64,
    pub index_bytes: u64,
}

impl GeometryBuffers {
    /// Indices the pre-recorded draw covers: the whole index buffer.
    pub fn index_count(&self) -> u32 {
        (self.index_bytes / std::mem::size_of::<u32>() as u64) as u32
    }

    pub(crate) unsafe fn create(
        &mut self,
        ctx: &GraphicsContext,
        vertex_bytes: u64,
        index_bytes: u64,
    ) -> Result<()> {
        let instance = ctx.instance()?;
        let device = ctx.device()?;
        let (vb, vm) = unsafe {
            create_buffer_and_memory(
                instance,
                device,
                ctx.phys,
                vertex_bytes,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
        }?;
        self.vertex = vb;
        self.vertex_memory = vm;
        self.vertex_bytes = vertex_bytes;

        let (ib, im) = unsafe {
            create_buffer_and_memory(
                instance,
                device,
                ctx.phys,
                index_bytes,
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
        }?;
        self.index = ib;
        self.index_memory = im;
        self.index_bytes = index_bytes;
        Ok(())
    }

    /// Stages `mesh` through two throwaway host-visible buffers and copies
    /// both into the device-local pair, waiting for the copy to finish.
    pub(crate) unsafe fn upload(
        &self,
        ctx: &GraphicsContext,
        pool: vk::CommandPool,
        mesh: &TileMesh,
    ) -> Result<()> {
        let vdata = padded(bytemuck::cast_slice(&mesh.vertices), self.vertex_bytes as usize);
        let idata = padded(bytemuck::cast_slice(&mesh.indices), self.index_bytes as usize);

        let mut staging = Staging::default();
        let out = unsafe { self.upload_inner(ctx, pool, &vdata, &idata, &mut staging) };
        if let Ok(device) = ctx.device() {
            unsafe { staging.release(device) };
        }
        trace!(quads = mesh.quads(), "geometry uploaded");
        out
    }

    unsafe fn upload_inner(
        &self,
        ctx: &GraphicsContext,
        pool: vk::CommandPool,
        vdata: &[u8],
        idata: &[u8],
        staging: &mut Staging,
    ) -> Result<()> {
        let instance = ctx.instance()?;
        let device = ctx.device()?;
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        for (data, slot) in [(vdata, 0), (idata, 1)] {
            let (buf, mem) = unsafe {
                create_buffer_and_memory(
                    instance,
                    device,
                    ctx.phys,
                    data.len() as u64,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    host,
                )
            }?;
            staging.pairs[slot] = (buf, mem);
            unsafe { write_mapped(device, mem, 0, data) }?;
        }

        let (sv, si) = (staging.pairs[0].0, staging.pairs[1].0);
        let (vbytes, ibytes) = (self.vertex_bytes, self.index_bytes);
        let (dv, di) = (self.vertex, self.index);
        let record = |cmd: vk::CommandBuffer| unsafe {
            // Draws already queued may still be reading the old contents.
            let before = vk::MemoryBarrier {
                s_type: vk::StructureType::MEMORY_BARRIER,
                src_access_mask: vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ,
                dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                ..Default::default()
            };
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[before],
                &[],
                &[],
            );
            device.cmd_copy_buffer(
                cmd,
                sv,
                dv,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: vbytes,
                }],
            );
            device.cmd_copy_buffer(
                cmd,
                si,
                di,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: ibytes,
                }],
            );
            let after = vk::MemoryBarrier {
                s_type: vk::StructureType::MEMORY_BARRIER,
                src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                dst_access_mask: vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ,
                ..Default::default()
            };
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::DependencyFlags::empty(),
                &[after],
                &[],
                &[],
            );
        };
        unsafe { one_shot(device, ctx.graphics_queue, pool, record) }
    }

    pub fn handles(&self) -> [(vk::Buffer, vk::DeviceMemory); 2] {
        [
            (self.vertex, self.vertex_memory),
            (self.index, self.index_memory),
        ]
    }
}

#[derive(Default)]
struct Staging {
    pairs: [(vk::Buffer, vk::DeviceMemory); 2],
}

impl Staging {
    unsafe fn release(&mut self, device: &ash::Device) {
        for (buf, mem) in std::mem::take(&mut self.pairs) {
            unsafe {
                if !buf.is_null() {
                    device.destroy_buffer(buf, None);
                }
                if !mem.is_null() {
                    device.free_memory(mem, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Board {
        w: u32,
        h: u32,
        cells: Vec<u32>,
    }

    impl TileGrid for Board {
        fn dims(&self) -> (u32, u32) {
            (self.w, self.h)
        }
        fn value(&self, x: u32, y: u32) -> u32 {
            self.cells[(x + self.w * y) as usize]
        }
    }

    fn board(cells: &[u32]) -> Board {
        Board {
            w: 4,
            h: 4,
            cells: cells.to_vec(),
        }
    }

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1200,
        height: 800,
    };
    const MIB: u64 = 1024 * 1024;

    #[test]
    fn one_quad_per_nonzero_cell() {
        let mut cells = vec![0; 16];
        cells[0] = 1;
        cells[5] = 3;
        cells[15] = 11;
        let mesh = build_tile_mesh(&board(&cells), EXTENT, MIB, MIB).unwrap();
        assert_eq!(mesh.vertices.len(), 12);
        assert_eq!(mesh.indices.len(), 18);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
    }

    #[test]
    fn quad_indices_form_two_triangles() {
        let mut cells = vec![0; 16];
        cells[1] = 2;
        cells[2] = 2;
        let mesh = build_tile_mesh(&board(&cells), EXTENT, MIB, MIB).unwrap();
        assert_eq!(&mesh.indices[6..], &[4, 5, 6, 6, 7, 4]);
    }

    #[test]
    fn empty_board_emits_nothing() {
        let mesh = build_tile_mesh(&board(&[0; 16]), EXTENT, MIB, MIB).unwrap();
        assert!(mesh.vertices.is_empty());
        assert!(mesh.indices.is_empty());
    }

    #[test]
    fn quads_follow_the_grid_layout() {
        let mut cells = vec![0; 16];
        cells[4 + 1] = 1; // (1, 1)
        let mesh = build_tile_mesh(&board(&cells), EXTENT, MIB, MIB).unwrap();
        assert_eq!(mesh.vertices[0].pos, [210.0, 210.0]);
        assert_eq!(mesh.vertices[2].pos, [390.0, 390.0]);
    }

    #[test]
    fn colors_clamp_to_palette_end() {
        let mut cells = vec![0; 16];
        cells[0] = 40;
        let mesh = build_tile_mesh(&board(&cells), EXTENT, MIB, MIB).unwrap();
        assert_eq!(mesh.vertices[0].color, palette()[PALETTE_LEN - 1]);
        assert_eq!(tile_color(99), tile_color(11));
    }

    #[test]
    fn palette_ramp_endpoints() {
        let p = palette();
        assert_eq!(p[0], [1.0, 1.0, 1.0]);
        assert_eq!(p[1], [0.0, 0.0, 1.0]);
        assert_eq!(p[6], [1.0, 0.0, 0.0]);
        assert_eq!(p[11], [0.0, 1.0, 0.0]);
    }

    #[test]
    fn overflow_is_reported() {
        let cells = vec![1; 16];
        let err = build_tile_mesh(&board(&cells), EXTENT, QUAD_VERTEX_BYTES * 15, MIB).unwrap_err();
        assert!(matches!(
            err,
            GfxError::GeometryOverflow {
                needed: 1280,
                capacity: 1200
            }
        ));
    }

    #[test]
    fn padding_zero_fills_to_capacity() {
        let p = padded(&[1, 2, 3], 8);
        assert_eq!(p, vec![1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn layouts_match_shader_interface() {
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
        assert_eq!(std::mem::size_of::<UniformBlock>(), 192);
        assert_eq!(QUAD_VERTEX_BYTES, 80);
        assert_eq!(QUAD_INDEX_BYTES, 24);
    }

    #[test]
    fn index_count_covers_whole_buffer() {
        let g = GeometryBuffers {
            index_bytes: MIB,
            ..Default::default()
        };
        assert_eq!(g.index_count(), (MIB / 4) as u32);
    }
}
