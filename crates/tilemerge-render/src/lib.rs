// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero_area(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Read-only view of the board a renderer draws each frame.
pub trait TileGrid {
    /// `(width, height)` in cells.
    fn dims(&self) -> (u32, u32);
    /// Tile value at a cell, 0 for empty. Cells are addressed row-major.
    fn value(&self, x: u32, y: u32) -> u32;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentPreference {
    #[default]
    Mailbox,
    Fifo,
    Immediate,
}

impl std::str::FromStr for PresentPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mailbox" => Ok(Self::Mailbox),
            "fifo" => Ok(Self::Fifo),
            "immediate" => Ok(Self::Immediate),
            other => Err(format!("unknown present mode `{other}`")),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderSettings {
    /// Reported to the driver as the application name. The app fills it in
    /// from the window title.
    #[serde(skip)]
    pub app_name: String,
    pub frames_in_flight: usize,
    pub vertex_buffer_bytes: u64,
    pub index_buffer_bytes: u64,
    pub device_extensions: Vec<String>,
    /// Only honoured in debug builds.
    pub validation_layers: Vec<String>,
    pub present_mode: PresentPreference,
    pub clear_color: [f32; 4],
    /// Directory holding `vert.spv` and `frag.spv`; the built-in shaders are
    /// used when unset.
    pub shader_dir: Option<PathBuf>,
    pub fallback_fps: u32,
}

pub const MIB: u64 = 1024 * 1024;

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            app_name: "game".into(),
            frames_in_flight: 2,
            vertex_buffer_bytes: MIB,
            index_buffer_bytes: MIB,
            device_extensions: vec!["VK_KHR_swapchain".into()],
            validation_layers: vec!["VK_LAYER_KHRONOS_validation".into()],
            present_mode: PresentPreference::Mailbox,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            shader_dir: None,
            fallback_fps: 60,
        }
    }
}

impl RenderSettings {
    /// Clamps the frame count to at least one and trims both geometry
    /// capacities down to a whole number of quads (never below one).
    pub fn normalized(mut self, vertex_quad_bytes: u64, index_quad_bytes: u64) -> Self {
        self.frames_in_flight = self.frames_in_flight.max(1);
        self.vertex_buffer_bytes = whole_quads(self.vertex_buffer_bytes, vertex_quad_bytes);
        self.index_buffer_bytes = whole_quads(self.index_buffer_bytes, index_quad_bytes);
        self.fallback_fps = self.fallback_fps.max(1);
        self
    }
}

fn whole_quads(bytes: u64, quad: u64) -> u64 {
    let quad = quad.max(1);
    (bytes / quad).max(1) * quad
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// The frame was shown, then the swapchain was rebuilt because present
    /// reported it stale.
    PresentedThenRebuilt,
    /// Acquire found the swapchain out of date; it was rebuilt and nothing was
    /// drawn this frame.
    SkippedForRebuild,
    /// Zero-area surface: no GPU work was issued.
    Paused,
}

impl FrameOutcome {
    pub fn presented(self) -> bool {
        matches!(self, Self::Presented | Self::PresentedThenRebuilt)
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Records the new drawable size; the swapchain is rebuilt before the
    /// next acquire.
    fn resize(&mut self, size: RenderSize);
    fn render(&mut self, grid: &dyn TileGrid) -> Result<FrameOutcome>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn device_does_vsync(&self) -> bool;
}
