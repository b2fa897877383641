//! Pointer sink: maps view coordinates onto the host monitor and drives
//! the system cursor through synthetic input.

use anyhow::{Context, Result};
use enigo::{Button, Coordinate, Direction, Enigo, Mouse as _, Settings};
use nalgebra::Vector2;
use opencv::core::{Point, Size};

/// Below this distance the cursor creeps, suppressing jitter while the
/// finger holds still.
const DRAG_THRESHOLD: f32 = 20.0;
/// Above this distance smoothing is bypassed entirely.
const JUMP_THRESHOLD: f32 = 150.0;
const STOP_RATE: f32 = 0.05;
const DRAG_RATE: f32 = 0.8;

pub struct Mouse {
    enigo: Enigo,
    input_offset: Vector2<f32>,
    input_scaling: Vector2<f32>,
    mouse_coord: Vector2<f32>,
    left_down: bool,
    right_down: bool,
}

impl Mouse {
    /// Creates the pointer sink for the monitor the projector mirrors.
    /// `input_region` is the view resolution; view points are scaled into
    /// the monitor rectangle and offset into virtual-desktop coordinates.
    pub fn new(input_region: Size, monitor_offset: (i32, i32)) -> Result<Self> {
        let enigo =
            Enigo::new(&Settings::default()).context("Failed to open the input injector")?;

        let display =
            scrap::Display::primary().context("Failed to query the primary display")?;

        let input_scaling = Vector2::new(
            display.width() as f32 / input_region.width as f32,
            display.height() as f32 / input_region.height as f32,
        );

        Ok(Self {
            enigo,
            input_offset: Vector2::new(monitor_offset.0 as f32, monitor_offset.1 as f32),
            input_scaling,
            mouse_coord: Vector2::zeros(),
            left_down: false,
            right_down: false,
        })
    }

    /// Moves the cursor to a view point, optionally smoothed. Smoothing
    /// passes large deltas through unchanged, follows medium deltas at
    /// the drag rate and damps small ones to a crawl.
    pub fn move_to(&mut self, coord: Point, smoothing: bool) {
        let target = Vector2::new(
            coord.x as f32 * self.input_scaling.x + self.input_offset.x,
            coord.y as f32 * self.input_scaling.y + self.input_offset.y,
        );

        self.mouse_coord = if smoothing {
            smooth(self.mouse_coord, target)
        } else {
            target
        };

        if let Err(e) = self.enigo.move_mouse(
            self.mouse_coord.x as i32,
            self.mouse_coord.y as i32,
            Coordinate::Abs,
        ) {
            log::warn!("Cursor move failed: {e}");
        }
    }

    pub fn hold_left(&mut self) {
        if let Err(e) = self.enigo.button(Button::Left, Direction::Press) {
            log::warn!("Left button press failed: {e}");
        }
        self.left_down = true;
    }

    pub fn hold_right(&mut self) {
        if let Err(e) = self.enigo.button(Button::Right, Direction::Press) {
            log::warn!("Right button press failed: {e}");
        }
        self.right_down = true;
    }

    /// Releases every button currently held.
    pub fn release_hold(&mut self) {
        if self.left_down {
            if let Err(e) = self.enigo.button(Button::Left, Direction::Release) {
                log::warn!("Left button release failed: {e}");
            }
            self.left_down = false;
        }

        if self.right_down {
            if let Err(e) = self.enigo.button(Button::Right, Direction::Release) {
                log::warn!("Right button release failed: {e}");
            }
            self.right_down = false;
        }
    }
}

/// Cursor smoothing curve in host screen coordinates.
fn smooth(current: Vector2<f32>, target: Vector2<f32>) -> Vector2<f32> {
    let delta = target - current;
    let distance = delta.norm();

    if distance > JUMP_THRESHOLD {
        target
    } else if distance > DRAG_THRESHOLD {
        current + delta * DRAG_RATE
    } else {
        current + delta * STOP_RATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_deltas_jump_straight_to_the_target() {
        let current = Vector2::new(0.0, 0.0);
        let target = Vector2::new(200.0, 0.0);
        assert_eq!(smooth(current, target), target);
    }

    #[test]
    fn medium_deltas_follow_at_the_drag_rate() {
        let current = Vector2::new(0.0, 0.0);
        let target = Vector2::new(100.0, 0.0);
        let next = smooth(current, target);
        assert!((next.x - 80.0).abs() < 1e-4);
        assert_eq!(next.y, 0.0);
    }

    #[test]
    fn small_deltas_crawl() {
        let current = Vector2::new(0.0, 0.0);
        let target = Vector2::new(10.0, 0.0);
        let next = smooth(current, target);
        assert!((next.x - 0.5).abs() < 1e-4);
    }

    #[test]
    fn threshold_boundaries_stay_smoothed() {
        // Exactly at the jump threshold the drag rate still applies, and
        // exactly at the drag threshold the crawl rate still applies.
        let at_jump = smooth(Vector2::zeros(), Vector2::new(150.0, 0.0));
        assert!((at_jump.x - 120.0).abs() < 1e-3);

        let at_drag = smooth(Vector2::zeros(), Vector2::new(20.0, 0.0));
        assert!((at_drag.x - 1.0).abs() < 1e-4);
    }
}
