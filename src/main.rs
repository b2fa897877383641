//! Turns a projected image into a touch surface using a single webcam.
//!
//! The webcam view is rectified into projector coordinates through an
//! interactive calibration, the projected content is predicted and
//! subtracted to segment anything physically in front of the screen, and
//! fingertip-shaped contour peaks drive the host pointer with a
//! shadow-ratio touch test.

mod calibration;
mod config;
mod finger_tracker;
mod helpers;
mod mask_generator;
mod mouse;
mod screen_capture;
mod view_calibrator;
mod webcam;

use std::time::Instant;

use anyhow::{bail, Context, Result};
use opencv::core::{self, Mat, Point, Rect, Size};
use opencv::prelude::*;

use crate::config::Config;
use crate::finger_tracker::{FingerTracker, Fingertip};
use crate::mask_generator::MaskGenerator;
use crate::mouse::Mouse;
use crate::view_calibrator::ViewCalibrator;
use crate::webcam::Webcam;

/// A fingertip must survive this many frames before it can drive the
/// pointer.
const MIN_FINGER_AGE: usize = 5;

/// Shadow-to-foreground ratio at or below which contact registers.
const TOUCH_RATIO: f32 = 0.20;
/// Ratio at or below which the finger hovers (move without press).
const HOVER_RATIO: f32 = 0.30;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load_or_default("config.json")?;

    // Single optional positional argument: the webcam hardware id.
    let webcam_id = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<i32>()
            .with_context(|| format!("Webcam id must be an integer, got '{arg}'"))?,
        None => 1,
    };

    let Some(mut webcam) =
        Webcam::try_create(webcam_id, config.webcam_size(), config.webcam_fps)?
    else {
        bail!("Failed to load webcam with hardware id {webcam_id}");
    };
    log::info!(
        "Loaded webcam ({}x{}@{})",
        webcam.width,
        webcam.height,
        webcam.framerate
    );

    // Calibrate the webcam view.
    let calibrator = ViewCalibrator::new(config.view_size());
    let calibration = calibrator.calibrate(&mut webcam, &config)?;

    // Initialize the touchscreen systems.
    let mut mask_generator = MaskGenerator::new(&calibration, &config)?;
    let mut finger_tracker = FingerTracker::new(config.view_size());
    let mut mouse = Mouse::new(config.view_size(), config.monitor_offset)?;
    let mut decider = TouchDecider::default();

    mask_generator.start(&calibration);

    let mut raw_frame = Mat::default();
    let mut screen_frame = Mat::default();
    let mut foreground_mask = Mat::default();
    let mut shadow_mask = Mat::default();

    let mut frame_start = Instant::now();
    while webcam.next_frame(&mut raw_frame)? {
        let process_start = Instant::now();

        calibration.correct(&raw_frame, &mut screen_frame)?;
        mask_generator.segment(&screen_frame, &mut foreground_mask, &mut shadow_mask)?;

        let fingertips = finger_tracker.detect(&foreground_mask)?;
        if let Some((point, touch)) =
            decider.find_touch_action(&fingertips, &foreground_mask, &shadow_mask)?
        {
            finger_tracker.focus(point, Size::new(256, 256));
            mouse.move_to(point, config.smoothing);

            if touch {
                mouse.hold_left();
            }
        } else {
            mouse.release_hold();
        }

        log::debug!(
            "Latency: {:.1}/{:.1} ms",
            process_start.elapsed().as_secs_f32() * 1000.0,
            frame_start.elapsed().as_secs_f32() * 1000.0
        );
        frame_start = Instant::now();
    }

    // End of the camera stream: shut down cleanly.
    mask_generator.stop();
    Ok(())
}

/// Picks the fingertip to act on and classifies touch vs. hover by the
/// shadow ratio in a window around it.
#[derive(Default)]
struct TouchDecider {
    last_id: Option<u64>,
}

impl TouchDecider {
    /// Returns the pointer action for this frame: the view point plus
    /// whether it is a touch (`true`) or a hover (`false`).
    fn find_touch_action(
        &mut self,
        fingertips: &[Fingertip],
        foreground_mask: &Mat,
        shadow_mask: &Mat,
    ) -> Result<Option<(Point, bool)>> {
        // Prefer the fingertip acted on last frame; otherwise take the
        // oldest one that has proven itself. Noise is not consistent
        // across frames so it never grows an age, while a solid
        // fingertip easily lives on for many.
        let mut chosen: Option<&Fingertip> = None;
        let mut oldest_age = MIN_FINGER_AGE;
        for fingertip in fingertips {
            if Some(fingertip.id) == self.last_id {
                chosen = Some(fingertip);
                break;
            }

            if fingertip.age >= oldest_age {
                oldest_age = fingertip.age;
                chosen = Some(fingertip);
            }
        }

        let Some(fingertip) = chosen else {
            return Ok(None);
        };
        self.last_id = Some(fingertip.id);

        // On contact the shadow coincides with the finger casting it, so
        // the ratio should be minimal, though never zero: the shadow
        // still outlines the rest of the hand.
        let offset = fingertip.com - fingertip.point;
        let radius =
            (f64::from(offset.x).powi(2) + f64::from(offset.y).powi(2)).sqrt() as i32 + 7;

        let tl = Point::new(
            (fingertip.com.x - radius).max(0),
            (fingertip.com.y - radius).max(0),
        );
        let br = Point::new(
            (fingertip.com.x + radius).min(shadow_mask.cols() - 2),
            (fingertip.com.y + radius).min(shadow_mask.rows() - 2),
        );
        let roi = Rect::new(tl.x, tl.y, br.x - tl.x, br.y - tl.y);

        let shadow = core::count_non_zero(&Mat::roi(shadow_mask, roi)?)?;
        let foreground = core::count_non_zero(&Mat::roi(foreground_mask, roi)?)?;
        let ratio = shadow as f32 / foreground as f32;

        if ratio <= TOUCH_RATIO {
            return Ok(Some((fingertip.point, true)));
        }
        if ratio <= HOVER_RATIO {
            return Ok(Some((fingertip.point, false)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Scalar;

    fn mask(size: Size, value: f64) -> Mat {
        Mat::new_size_with_default(size, core::CV_8UC1, Scalar::all(value)).unwrap()
    }

    fn fingertip(id: u64, age: usize, point: Point, com: Point) -> Fingertip {
        Fingertip { point, com, age, id }
    }

    #[test]
    fn empty_masks_produce_no_action() {
        let size = Size::new(640, 480);
        let mut decider = TouchDecider::default();

        let action = decider
            .find_touch_action(&[], &mask(size, 0.0), &mask(size, 0.0))
            .unwrap();
        assert!(action.is_none());
    }

    #[test]
    fn shadowless_finger_registers_a_touch() {
        let size = Size::new(640, 480);
        let mut decider = TouchDecider::default();

        let tip = fingertip(3, 5, Point::new(320, 240), Point::new(320, 260));
        let action = decider
            .find_touch_action(&[tip], &mask(size, 255.0), &mask(size, 0.0))
            .unwrap();

        assert_eq!(action, Some((Point::new(320, 240), true)));
    }

    #[test]
    fn partial_shadow_registers_a_hover() {
        let size = Size::new(640, 480);
        let mut decider = TouchDecider::default();

        // radius = 20 + 7; the roi is 54x54 around the centre of mass.
        // Twelve shadowed rows put the ratio just past the touch
        // threshold.
        let tip = fingertip(3, 5, Point::new(320, 240), Point::new(320, 260));
        let mut shadow = mask(size, 0.0);
        Mat::roi_mut(&mut shadow, Rect::new(293, 233, 54, 12))
            .unwrap()
            .set_to(&Scalar::all(255.0), &core::no_array())
            .unwrap();

        let action = decider
            .find_touch_action(&[tip], &mask(size, 255.0), &shadow)
            .unwrap();

        assert_eq!(action, Some((Point::new(320, 240), false)));
    }

    #[test]
    fn heavy_shadow_suppresses_the_action() {
        let size = Size::new(640, 480);
        let mut decider = TouchDecider::default();

        let tip = fingertip(3, 5, Point::new(320, 240), Point::new(320, 260));
        let action = decider
            .find_touch_action(&[tip], &mask(size, 255.0), &mask(size, 255.0))
            .unwrap();

        assert!(action.is_none());
    }

    #[test]
    fn young_fingertips_are_ignored() {
        let size = Size::new(640, 480);
        let mut decider = TouchDecider::default();

        let tip = fingertip(3, 4, Point::new(320, 240), Point::new(320, 260));
        let action = decider
            .find_touch_action(&[tip], &mask(size, 255.0), &mask(size, 0.0))
            .unwrap();
        assert!(action.is_none());
    }

    #[test]
    fn remembered_id_wins_over_age() {
        let size = Size::new(640, 480);
        let mut decider = TouchDecider::default();

        // First frame establishes id 5 as the acted-on finger.
        let a = fingertip(5, 6, Point::new(100, 100), Point::new(100, 120));
        decider
            .find_touch_action(&[a], &mask(size, 255.0), &mask(size, 0.0))
            .unwrap();

        // Next frame, id 5 is younger than a competing finger but is
        // still the one chosen.
        let a = fingertip(5, 3, Point::new(104, 100), Point::new(104, 120));
        let b = fingertip(6, 9, Point::new(400, 300), Point::new(400, 320));
        let action = decider
            .find_touch_action(&[a, b], &mask(size, 255.0), &mask(size, 0.0))
            .unwrap();

        assert_eq!(action, Some((Point::new(104, 100), true)));
    }
}
