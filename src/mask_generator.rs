//! Foreground and shadow segmentation by prediction subtraction.
//!
//! A producer thread captures the screen buffer, predicts its appearance
//! through the projector-camera loop and publishes it into a fixed-size
//! delay queue. The consumer subtracts the delayed prediction from the
//! rectified webcam view to isolate anything physically in front of the
//! projection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use opencv::core::{self, Mat, Point, Rect, Scalar, Size};
use opencv::prelude::*;
use opencv::{highgui, imgproc};

use crate::config::Config;
use crate::helpers::hconcat3;
use crate::screen_capture::ScreenCapture;
use crate::view_calibrator::ViewCalibration;

/// Pixels darker than ambient plus this offset classify as shadow.
const SHADOW_OFFSET: f64 = 50.0;
/// Foreground threshold offset above the measured noise floor.
const NOISE_OFFSET: f64 = 15.0;

const PREDICTION_RATE_HZ: u64 = 60;
const PREDICTION_RATE_MS: u64 = 1000 / PREDICTION_RATE_HZ;

/// Fixed-latency sample-and-hold of predicted background frames.
///
/// The read slot coincides with the write slot: the producer writes and
/// then advances, so from the consumer's side the write index always
/// points at the oldest held frame. A queue of depth D therefore delays
/// the background by D-1 producer ticks, matching the camera pipeline
/// latency.
struct PredictionQueue {
    frames: Vec<Mat>,
    write_index: usize,
}

impl PredictionQueue {
    fn new(size: Size, depth: usize) -> Result<Self> {
        debug_assert!(depth > 0);

        let mut frames = Vec::with_capacity(depth);
        for _ in 0..depth {
            frames.push(Mat::new_size_with_default(size, core::CV_32FC3, Scalar::default())?);
        }
        Ok(Self { frames, write_index: 0 })
    }

    /// Overwrites the oldest slot and advances the ring.
    fn push(&mut self, src: &Mat) -> Result<()> {
        let index = self.write_index;
        src.copy_to(&mut self.frames[index])?;
        self.write_index = (index + 1) % self.frames.len();
        Ok(())
    }

    /// Copies the oldest held frame into `dst`.
    fn read_into(&self, dst: &mut Mat) -> Result<()> {
        self.frames[self.write_index].copy_to(dst)?;
        Ok(())
    }
}

pub struct MaskGenerator {
    sharpening_kernel: Mat,
    channel_weights: Mat,
    morph_kernel: Mat,
    border_mask: Mat,
    background_mask: Mat,
    ambient_intensity: f32,
    show_diagnostics: bool,

    // Scratch buffers reused across frames.
    view: Mat,
    background: Mat,
    difference: Mat,
    score: Mat,
    score_mask: Mat,
    fg_a: Mat,
    fg_b: Mat,
    noise_mask: Mat,
    foreground_view: Mat,

    queue: Arc<Mutex<PredictionQueue>>,
    runflag: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl MaskGenerator {
    pub fn new(calibration: &ViewCalibration, config: &Config) -> Result<Self> {
        let input_size = calibration.output_resolution;

        // Light sharpening recovers edges softened by the remap.
        let sharpening_kernel = Mat::from_slice_2d(&[
            [0.00f32, -0.25, 0.00],
            [-0.25, 2.00, -0.25],
            [0.00, -0.25, 0.00],
        ])?;

        let channel_weights = Mat::from_slice_2d(&[[0.75f32, 0.75, 1.00]])?;

        let morph_kernel = imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            Size::new(3, 3),
            Point::new(-1, -1),
        )?;

        // A 3 px frame rectangle; anything a finger drags in must cross it.
        let mut border_mask =
            Mat::new_size_with_default(input_size, core::CV_8UC1, Scalar::default())?;
        let (w, h) = (input_size.width - 1, input_size.height - 1);
        for (from, to) in [((0, 0), (w, 0)), ((w, 0), (w, h)), ((w, h), (0, h)), ((0, h), (0, 0))] {
            imgproc::line(
                &mut border_mask,
                Point::new(from.0, from.1),
                Point::new(to.0, to.1),
                Scalar::all(255.0),
                3,
                imgproc::LINE_8,
                0,
            )?;
        }

        // Everything counts as background until the first segmentation.
        let background_mask =
            Mat::new_size_with_default(input_size, core::CV_8UC1, Scalar::all(255.0))?;

        Ok(Self {
            sharpening_kernel,
            channel_weights,
            morph_kernel,
            border_mask,
            background_mask,
            ambient_intensity: calibration.ambient_intensity(),
            show_diagnostics: config.show_diagnostics,
            view: Mat::default(),
            background: Mat::default(),
            difference: Mat::default(),
            score: Mat::default(),
            score_mask: Mat::default(),
            fg_a: Mat::default(),
            fg_b: Mat::default(),
            noise_mask: Mat::default(),
            foreground_view: Mat::default(),
            queue: Arc::new(Mutex::new(PredictionQueue::new(
                input_size,
                config.prediction_delay,
            )?)),
            runflag: Arc::new(AtomicBool::new(false)),
            producer: None,
        })
    }

    /// Starts the prediction producer thread. The thread receives its own
    /// clone of the calibration so each side keeps its own GPU context;
    /// only host-memory frames cross the queue.
    pub fn start(&mut self, calibration: &ViewCalibration) {
        debug_assert!(self.producer.is_none());

        let calibration = calibration.clone();
        let queue = Arc::clone(&self.queue);
        let runflag = Arc::clone(&self.runflag);

        self.runflag.store(true, Ordering::Relaxed);
        self.producer = Some(thread::spawn(move || {
            if let Err(e) = predictor_process(calibration, queue, &runflag) {
                log::error!("Predictor thread failed: {e:#}");
            }
        }));
    }

    /// Stops and joins the producer thread.
    pub fn stop(&mut self) {
        self.runflag.store(false, Ordering::Relaxed);
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }

    /// Segments the rectified view into foreground and shadow masks by
    /// subtracting the delayed background prediction.
    pub fn segment(
        &mut self,
        view: &Mat,
        foreground_mask: &mut Mat,
        shadow_mask: &mut Mat,
    ) -> Result<()> {
        imgproc::filter_2d(
            view,
            &mut self.view,
            core::CV_32F,
            &self.sharpening_kernel,
            Point::new(-1, -1),
            0.0,
            core::BORDER_DEFAULT,
        )?;

        self.queue.lock().unwrap().read_into(&mut self.background)?;

        // Dynamic background subtraction against the prediction, with the
        // channels collapsed into a single weighted score.
        core::absdiff(&self.background, &self.view, &mut self.difference)?;
        core::transform(&self.difference, &mut self.score, &self.channel_weights)?;

        // Minimal differences belong to the background; the floor is
        // estimated from wherever the previous frame saw nothing.
        let noise_floor = core::mean(&self.score, &self.background_mask)?;
        imgproc::threshold(
            &self.score,
            &mut self.score_mask,
            noise_floor[0] + NOISE_OFFSET,
            255.0,
            imgproc::THRESH_BINARY,
        )?;
        self.score_mask.convert_to(&mut self.fg_a, core::CV_8U, 1.0, 0.0)?;

        if self.show_diagnostics {
            let mut view_8u = Mat::default();
            let mut background_8u = Mat::default();
            let mut mask_bgr = Mat::default();
            self.view.convert_to(&mut view_8u, core::CV_8U, 1.0, 0.0)?;
            self.background.convert_to(&mut background_8u, core::CV_8U, 1.0, 0.0)?;
            imgproc::cvt_color(&self.fg_a, &mut mask_bgr, imgproc::COLOR_GRAY2BGR, 0)?;

            highgui::imshow(
                "View vs. Prediction vs. Raw Mask",
                &hconcat3(&view_8u, &background_8u, &mask_bgr)?,
            )?;
            highgui::poll_key()?;
        }

        // Erode away small noise and thin lines.
        imgproc::erode(
            &self.fg_a,
            &mut self.fg_b,
            &self.morph_kernel,
            Point::new(-1, -1),
            2,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        // Remove components not connected to the screen border; fingers
        // and hands always enter the view from outside.
        core::add(&self.fg_b, &self.border_mask, &mut self.noise_mask, &core::no_array(), -1)?;
        imgproc::flood_fill(
            &mut self.noise_mask,
            Point::new(0, 0),
            Scalar::all(0.0),
            &mut Rect::default(),
            Scalar::default(),
            Scalar::default(),
            4,
        )?;
        core::subtract(&self.fg_b, &self.noise_mask, &mut self.fg_a, &core::no_array(), -1)?;
        core::subtract(&self.fg_a, &self.border_mask, &mut self.fg_b, &core::no_array(), -1)?;

        // Dilate back and smooth out jagged edges.
        imgproc::dilate(
            &self.fg_b,
            &mut self.fg_a,
            &self.morph_kernel,
            Point::new(-1, -1),
            2,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;
        imgproc::box_filter(
            &self.fg_a,
            &mut self.fg_b,
            -1,
            Size::new(5, 5),
            Point::new(-1, -1),
            true,
            core::BORDER_DEFAULT,
        )?;
        imgproc::threshold(&self.fg_b, foreground_mask, 192.0, 255.0, imgproc::THRESH_BINARY)?;

        // The complement feeds the next frame's noise floor estimate.
        core::bitwise_not(foreground_mask, &mut self.background_mask, &core::no_array())?;

        // Shadows are darker than the ambient response. The background
        // region is forced white so only the foreground neighbourhood
        // can classify as shadow.
        imgproc::cvt_color(view, &mut self.foreground_view, imgproc::COLOR_BGR2GRAY, 0)?;
        self.foreground_view.set_to(&Scalar::all(255.0), &self.background_mask)?;
        imgproc::threshold(
            &self.foreground_view,
            shadow_mask,
            f64::from(self.ambient_intensity) + SHADOW_OFFSET,
            255.0,
            imgproc::THRESH_BINARY_INV,
        )?;

        Ok(())
    }

    #[cfg(test)]
    fn push_prediction(&self, frame: &Mat) -> Result<()> {
        self.queue.lock().unwrap().push(frame)
    }
}

impl Drop for MaskGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Producer loop: captures the screen buffer, predicts its appearance and
/// publishes into the delay queue at a fixed 60 Hz cadence. When no new
/// screen frame arrives within a tick the previous prediction is
/// re-published, making the queue a time-domain buffer.
fn predictor_process(
    calibration: ViewCalibration,
    queue: Arc<Mutex<PredictionQueue>>,
    runflag: &AtomicBool,
) -> Result<()> {
    let mut screen_capture = match ScreenCapture::open_primary() {
        Ok(capture) => capture,
        Err(e) => {
            log::error!("Failed to start screen capture: {e:#}");
            std::process::exit(1);
        }
    };

    let buffer_size = calibration.output_resolution;
    let mut raw_capture = Mat::default();
    let mut resize_buffer = Mat::default();
    let mut frame_buffer = Mat::default();
    let mut prediction_buffer =
        Mat::new_size_with_default(buffer_size, core::CV_32FC3, Scalar::default())?;

    log::info!("Predictor thread running at {} Hz", PREDICTION_RATE_HZ);

    while runflag.load(Ordering::Relaxed) {
        let start_time = Instant::now();

        match screen_capture.read(&mut raw_capture, PREDICTION_RATE_MS - 1) {
            Ok(true) => {
                imgproc::cvt_color(
                    &raw_capture,
                    &mut resize_buffer,
                    imgproc::COLOR_BGRA2BGR,
                    0,
                )?;
                imgproc::resize(
                    &resize_buffer,
                    &mut frame_buffer,
                    buffer_size,
                    0.0,
                    0.0,
                    imgproc::INTER_LINEAR,
                )?;
                calibration.predict(&frame_buffer, &mut prediction_buffer)?;
            }
            Ok(false) => {}
            Err(e) => log::warn!("Screen capture read failed: {e:#}"),
        }

        // Hold the cadence so the queue stays a fixed-latency buffer.
        while start_time.elapsed() < Duration::from_millis(PREDICTION_RATE_MS) {
            thread::yield_now();
        }

        queue.lock().unwrap().push(&prediction_buffer)?;
    }

    log::info!("Predictor thread stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};
    use opencv::core::Point2f;

    fn test_calibration(size: Size) -> ViewCalibration {
        ViewCalibration {
            output_resolution: size,
            correction_map: Mat::default(),
            view_homography: Matrix3::identity(),
            screen_contour: vec![
                Point2f::new(1.0, 1.0),
                Point2f::new(1.0, 9.0),
                Point2f::new(9.0, 9.0),
                Point2f::new(9.0, 1.0),
            ],
            colour_map: vec![Vector3::zeros(); 512],
            reflectance_map: Mat::new_size_with_default(size, core::CV_32FC3, Scalar::all(1.0))
                .unwrap(),
        }
    }

    fn filled(size: Size, value: f64) -> Mat {
        Mat::new_size_with_default(size, core::CV_32FC3, Scalar::all(value)).unwrap()
    }

    #[test]
    fn queue_read_slot_is_the_oldest_frame() {
        let size = Size::new(4, 4);
        let mut queue = PredictionQueue::new(size, 3).unwrap();

        for value in [1.0, 2.0, 3.0] {
            queue.push(&filled(size, value)).unwrap();
        }

        let mut dst = Mat::default();
        queue.read_into(&mut dst).unwrap();
        assert_eq!(dst.at_2d::<core::Vec3f>(0, 0).unwrap()[0], 1.0);

        queue.push(&filled(size, 4.0)).unwrap();
        queue.read_into(&mut dst).unwrap();
        assert_eq!(dst.at_2d::<core::Vec3f>(0, 0).unwrap()[0], 2.0);
    }

    #[test]
    fn queue_starts_with_zeroed_frames() {
        let mut dst = Mat::default();
        PredictionQueue::new(Size::new(4, 4), 3)
            .unwrap()
            .read_into(&mut dst)
            .unwrap();
        assert_eq!(dst.at_2d::<core::Vec3f>(2, 2).unwrap()[0], 0.0);
    }

    #[test]
    fn view_matching_background_segments_nothing() {
        let size = Size::new(100, 100);
        let calibration = test_calibration(size);
        let mut generator = MaskGenerator::new(&calibration, &Config::default()).unwrap();

        let view = Mat::new_size_with_default(size, core::CV_8UC3, Scalar::default()).unwrap();
        generator.push_prediction(&filled(size, 0.0)).unwrap();

        let mut foreground = Mat::default();
        let mut shadow = Mat::default();
        generator.segment(&view, &mut foreground, &mut shadow).unwrap();

        assert_eq!(core::count_non_zero(&foreground).unwrap(), 0);
        assert_eq!(core::count_non_zero(&shadow).unwrap(), 0);
    }

    #[test]
    fn floating_blob_is_removed() {
        let size = Size::new(100, 100);
        let calibration = test_calibration(size);
        let mut generator = MaskGenerator::new(&calibration, &Config::default()).unwrap();

        // A bright 40x40 island in the centre, not touching any border.
        let mut view = Mat::new_size_with_default(size, core::CV_8UC3, Scalar::default()).unwrap();
        Mat::roi_mut(&mut view, Rect::new(30, 30, 40, 40))
            .unwrap()
            .set_to(&Scalar::all(255.0), &core::no_array())
            .unwrap();

        let mut foreground = Mat::default();
        let mut shadow = Mat::default();
        generator.segment(&view, &mut foreground, &mut shadow).unwrap();

        assert_eq!(core::count_non_zero(&foreground).unwrap(), 0);
    }

    #[test]
    fn border_connected_blob_survives() {
        let size = Size::new(100, 100);
        let calibration = test_calibration(size);
        let mut generator = MaskGenerator::new(&calibration, &Config::default()).unwrap();

        // A bright blob entering from the left border.
        let mut view = Mat::new_size_with_default(size, core::CV_8UC3, Scalar::default()).unwrap();
        Mat::roi_mut(&mut view, Rect::new(0, 30, 40, 40))
            .unwrap()
            .set_to(&Scalar::all(255.0), &core::no_array())
            .unwrap();

        let mut foreground = Mat::default();
        let mut shadow = Mat::default();
        generator.segment(&view, &mut foreground, &mut shadow).unwrap();

        assert!(core::count_non_zero(&foreground).unwrap() > 0);
    }
}
