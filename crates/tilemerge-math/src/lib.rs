// SPDX-License-Identifier: CEPL-1.0
//! Screen-space layout for the tile grid.
//!
//! Quads are laid out in pixel coordinates inside the largest square that fits
//! the window; [`pixel_to_ndc`] then maps that square to the centre of clip
//! space.

pub use glam::{Mat4, Vec2, Vec3, Vec4};

/// Gap in pixels left around every quad inside its cell (split evenly).
pub const CELL_MARGIN: f32 = 20.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridLayout {
    /// Distance between neighbouring cell origins.
    pub pitch: f32,
    /// Edge length of a drawn quad.
    pub quad: f32,
}

impl GridLayout {
    /// `grid_dim` is the number of cells along the longer grid axis.
    pub fn new(width: u32, height: u32, grid_dim: u32) -> Self {
        let side = width.min(height) as f32;
        let pitch = (side / grid_dim.max(1) as f32).floor();
        Self {
            pitch,
            quad: (pitch - CELL_MARGIN).max(0.0),
        }
    }

    pub fn cell_origin(&self, x: u32, y: u32) -> Vec2 {
        let inset = CELL_MARGIN * 0.5;
        Vec2::new(self.pitch * x as f32 + inset, self.pitch * y as f32 + inset)
    }

    /// Corners in the order top-left, top-right, bottom-right, bottom-left.
    pub fn quad_corners(&self, x: u32, y: u32) -> [Vec2; 4] {
        let o = self.cell_origin(x, y);
        let s = self.quad;
        [
            o,
            o + Vec2::new(s, 0.0),
            o + Vec2::new(s, s),
            o + Vec2::new(0.0, s),
        ]
    }
}

/// Maps pixel coordinates of a `width`×`height` surface to normalized device
/// coordinates, shifting the square play area so it sits centred along the
/// longer axis.
pub fn pixel_to_ndc(width: u32, height: u32) -> Mat4 {
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    let centre = if w >= h {
        Vec3::new((w - h) * 0.5, 0.0, 0.0)
    } else {
        Vec3::new(0.0, (h - w) * 0.5, 0.0)
    };
    Mat4::from_translation(Vec3::new(-1.0, -1.0, 0.0))
        * Mat4::from_scale(Vec3::new(2.0 / w, 2.0 / h, 1.0))
        * Mat4::from_translation(centre)
}
