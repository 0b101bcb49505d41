// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use tracing::debug;
use winit::event::WindowEvent;

/// Tracks whether the window is currently worth drawing into.
///
/// A window renders while it is visible, not occluded and has a non-zero
/// drawable area. Resizes are always recorded so the latest size is known
/// when drawing resumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowGate {
    visible: bool,
    occluded: bool,
    width: u32,
    height: u32,
}

impl WindowGate {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            visible: true,
            occluded: false,
            width,
            height,
        }
    }

    pub fn should_render(&self) -> bool {
        self.visible && !self.occluded && self.width > 0 && self.height > 0
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn set_visible(&mut self, visible: bool) -> bool {
        self.update(|g| g.visible = visible)
    }

    /// Applies the visibility the platform reports for the window. Platforms
    /// that cannot tell report `None`, which leaves the gate as it is.
    pub fn sync_visibility(&mut self, reported: Option<bool>) -> bool {
        match reported {
            Some(visible) => self.set_visible(visible),
            None => false,
        }
    }

    pub fn set_occluded(&mut self, occluded: bool) -> bool {
        self.update(|g| g.occluded = occluded)
    }

    pub fn set_size(&mut self, width: u32, height: u32) -> bool {
        self.update(|g| {
            g.width = width;
            g.height = height;
        })
    }

    /// Feeds a window event through the gate. Returns `true` when the
    /// should-render flag flipped.
    pub fn observe(&mut self, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::Resized(size) => self.set_size(size.width, size.height),
            WindowEvent::Occluded(occluded) => self.set_occluded(*occluded),
            _ => false,
        }
    }

    fn update(&mut self, f: impl FnOnce(&mut Self)) -> bool {
        let before = self.should_render();
        f(self);
        let after = self.should_render();
        if before != after {
            debug!(
                render = after,
                w = self.width,
                h = self.height,
                "window gate changed"
            );
        }
        before != after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::PhysicalSize;

    #[test]
    fn starts_open_for_non_empty_window() {
        assert!(WindowGate::new(1200, 800).should_render());
        assert!(!WindowGate::new(0, 800).should_render());
    }

    #[test]
    fn minimize_closes_and_restore_reopens() {
        let mut g = WindowGate::new(1200, 800);
        assert!(g.observe(&WindowEvent::Resized(PhysicalSize::new(0, 0))));
        assert!(!g.should_render());
        assert!(g.observe(&WindowEvent::Resized(PhysicalSize::new(640, 480))));
        assert!(g.should_render());
        assert_eq!(g.size(), (640, 480));
    }

    #[test]
    fn occlusion_and_hiding_both_close() {
        let mut g = WindowGate::new(100, 100);
        assert!(g.observe(&WindowEvent::Occluded(true)));
        assert!(!g.set_visible(false));
        assert!(!g.observe(&WindowEvent::Occluded(false)));
        assert!(!g.should_render());
        assert!(g.set_visible(true));
    }

    #[test]
    fn resize_while_hidden_is_remembered() {
        let mut g = WindowGate::new(100, 100);
        g.set_visible(false);
        assert!(!g.observe(&WindowEvent::Resized(PhysicalSize::new(300, 200))));
        assert_eq!(g.size(), (300, 200));
        g.set_visible(true);
        assert!(g.should_render());
    }

    #[test]
    fn reported_visibility_drives_the_gate() {
        let mut g = WindowGate::new(100, 100);
        assert!(!g.sync_visibility(None));
        assert!(g.should_render());
        assert!(g.sync_visibility(Some(false)));
        assert!(!g.should_render());
        assert!(!g.sync_visibility(None));
        assert!(!g.should_render());
        assert!(g.sync_visibility(Some(true)));
        assert!(g.should_render());
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let mut g = WindowGate::new(100, 100);
        assert!(!g.observe(&WindowEvent::Focused(false)));
        assert!(g.should_render());
    }
}
