//! Scroll-driven camera track.
//!
//! The showcase section is a virtual strip of page `section_height` pixels
//! tall starting `section_top` pixels down the page. Scrolling through it
//! moves the camera from `start` to `end` with a power2 in-out ease.

use cgmath::{EuclideanSpace, Point3, Vector3, VectorSpace};
use serde::{Deserialize, Serialize};

/// How far (0..=1) a section has been scrolled past, given its bounding box
/// relative to the top of the viewport.
pub fn section_progress(top: f32, bottom: f32, viewport_height: f32) -> f32 {
    let end = bottom - viewport_height;
    if end <= 0.0 {
        // The whole section fits on screen
        return if top > 0.0 { 0.0 } else { 1.0 };
    }
    (-top / end).clamp(0.0, 1.0)
}

pub fn power2_in_out(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        2.0 * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollTrackConfig {
    pub enabled: bool,
    pub section_top: f32,
    pub section_height: f32,
    pub start: [f32; 3],
    pub end: [f32; 3],
    /// Page pixels scrolled per wheel line.
    pub wheel_step: f32,
}

impl Default for ScrollTrackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            section_top: 0.0,
            section_height: 3000.0,
            start: [0.0, 0.0, 5.0],
            end: [5.0, 5.0, 10.0],
            wheel_step: 40.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrollTrack {
    config: ScrollTrackConfig,
    offset: f32,
}

impl ScrollTrack {
    pub fn new(config: ScrollTrackConfig) -> Self {
        Self { config, offset: 0.0 }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }

    /// Scrolls by `delta` page pixels; positive scrolls down the page.
    pub fn scroll_by(&mut self, delta: f32, viewport_height: f32) {
        let max = (self.config.section_top + self.config.section_height - viewport_height).max(0.0);
        self.offset = (self.offset + delta).clamp(0.0, max);
    }

    pub fn scroll_lines(&mut self, lines: f32, viewport_height: f32) {
        self.scroll_by(lines * self.config.wheel_step, viewport_height);
    }

    pub fn progress(&self, viewport_height: f32) -> f32 {
        let top = self.config.section_top - self.offset;
        let bottom = top + self.config.section_height;
        section_progress(top, bottom, viewport_height)
    }

    /// Camera position for the current scroll offset, or `None` when the
    /// track is disabled.
    pub fn camera_position(&self, viewport_height: f32) -> Option<Point3<f32>> {
        if !self.config.enabled {
            return None;
        }
        let t = power2_in_out(self.progress(viewport_height));
        let start = Vector3::from(self.config.start);
        let end = Vector3::from(self.config.end);
        Some(Point3::from_vec(start.lerp(end, t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped() {
        // Section still below the fold
        assert_eq!(section_progress(500.0, 2500.0, 800.0), 0.0);
        assert!((section_progress(-600.0, 2000.0, 800.0) - 0.5).abs() < 1e-6);
        assert_eq!(section_progress(-850.0, 1650.0, 800.0), 1.0);
        // Scrolled well past
        assert_eq!(section_progress(-5000.0, -3000.0, 800.0), 1.0);
    }

    #[test]
    fn short_sections_snap() {
        assert_eq!(section_progress(100.0, 400.0, 800.0), 0.0);
        assert_eq!(section_progress(-10.0, 300.0, 800.0), 1.0);
    }

    #[test]
    fn easing_endpoints_and_midpoint() {
        assert_eq!(power2_in_out(0.0), 0.0);
        assert_eq!(power2_in_out(1.0), 1.0);
        assert_eq!(power2_in_out(0.5), 0.5);
        assert!((power2_in_out(0.25) - 0.125).abs() < 1e-6);
        assert!((power2_in_out(0.75) - 0.875).abs() < 1e-6);
    }

    #[test]
    fn camera_moves_from_start_to_end() {
        let config = ScrollTrackConfig {
            section_top: 0.0,
            section_height: 1800.0,
            ..Default::default()
        };
        let mut track = ScrollTrack::new(config);
        assert_eq!(track.camera_position(800.0), Some(Point3::new(0.0, 0.0, 5.0)));

        track.scroll_by(10_000.0, 800.0);
        assert_eq!(track.offset(), 1000.0);
        assert_eq!(track.camera_position(800.0), Some(Point3::new(5.0, 5.0, 10.0)));

        // 250px down: progress 250 / 750, eased to 2/9
        track.scroll_by(-750.0, 800.0);
        assert!((track.progress(800.0) - 1.0 / 3.0).abs() < 1e-5);
        let camera = track.camera_position(800.0).unwrap();
        assert!((camera.x - 10.0 / 9.0).abs() < 1e-4);
        assert!((camera.z - (5.0 + 10.0 / 9.0)).abs() < 1e-4);
    }

    #[test]
    fn disabled_track_leaves_camera_alone() {
        let track = ScrollTrack::new(ScrollTrackConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(track.camera_position(800.0).is_none());
    }
}
