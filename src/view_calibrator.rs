//! Geometric and photometric calibration of the camera-projector loop.
//!
//! The geometric stage recovers a combined lens-undistortion plus screen
//! homography remap from printed-pattern detection; the photometric stage
//! learns the per-pixel reflectance and a trilinearly interpolated colour
//! response grid so the webcam appearance of any screen buffer can be
//! predicted.

use anyhow::Result;
use nalgebra::{Matrix3, Vector3};
use opencv::calib3d::{self, UsacParams};
use opencv::core::{
    self, Mat, Point, Point2f, Point3f, Rect, Scalar, Size, TermCriteria, Vec3b, Vec3f, Vector,
};
use opencv::prelude::*;
use opencv::{highgui, imgproc};

use crate::calibration::{
    calibrate_exposure, capture_colour, capture_image, make_fullscreen_window, show_feedback,
};
use crate::config::Config;
use crate::helpers::{make_chessboard, tlerp, xyz_to_3d_index};
use crate::webcam::Webcam;

/// Colour response grid dimensions: 8x8x8 = 512 samples, colour step 1/7.
/// Grid mapping is x = B, y = G, z = R.
pub const COLOUR_MAP_SIZE: usize = 8;
const COLOUR_MAP_STEP: f32 = 1.0 / (COLOUR_MAP_SIZE as f32 - 1.0);

/// Reflectance channels are floored to keep the prediction division finite.
const REFLECTANCE_FLOOR: f32 = 1e-4;

const WINDOW_NAME: &str = "Screen Calibrator";

/// Immutable result of a full calibration run.
///
/// The predictor thread holds its own clone so each thread keeps its own
/// GPU context; all fields are plain host-memory data.
#[derive(Clone)]
pub struct ViewCalibration {
    /// Working view resolution shared by every rectified frame and mask.
    pub output_resolution: Size,
    /// Dense CV_32FC2 lookup mapping each view pixel to a raw camera
    /// sub-pixel; lens undistortion composed with the screen homography.
    pub correction_map: Mat,
    /// Homography taking lens-corrected camera points to view points.
    pub view_homography: Matrix3<f64>,
    /// Screen quad in raw camera coordinates, counter-clockwise from
    /// the top-left.
    pub screen_contour: Vec<Point2f>,
    /// Measured projector-camera colour response; entry 0 is the ambient
    /// (black) response.
    pub colour_map: Vec<Vector3<f32>>,
    /// Per-pixel per-channel white response divided by its mean, CV_32FC3.
    pub reflectance_map: Mat,
}

impl ViewCalibration {
    /// Rectifies a raw camera frame into view coordinates.
    pub fn correct(&self, src: &Mat, dst: &mut Mat) -> Result<()> {
        imgproc::remap(
            src,
            dst,
            &self.correction_map,
            &core::no_array(),
            imgproc::INTER_CUBIC,
            core::BORDER_CONSTANT,
            Scalar::default(),
        )?;
        Ok(())
    }

    /// Predicts the webcam appearance of an 8-bit BGR screen buffer.
    /// The output is CV_32FC3 with a nominal range of [0,255]; values
    /// are not clamped.
    pub fn predict(&self, src: &Mat, dst: &mut Mat) -> Result<()> {
        debug_assert_eq!(src.typ(), core::CV_8UC3);

        if dst.size()? != src.size()? || dst.typ() != core::CV_32FC3 {
            *dst = Mat::new_size_with_default(src.size()?, core::CV_32FC3, Scalar::default())?;
        }

        for r in 0..src.rows() {
            for c in 0..src.cols() {
                let colour = *src.at_2d::<Vec3b>(r, c)?;
                let norm = Vector3::new(
                    f32::from(colour[0]),
                    f32::from(colour[1]),
                    f32::from(colour[2]),
                ) / 255.0;

                // Locate the sub-cube within the colour map. Saturated
                // channels land on the last cell with a unit offset.
                let x = ((norm[0] / COLOUR_MAP_STEP) as usize).min(COLOUR_MAP_SIZE - 2);
                let y = ((norm[1] / COLOUR_MAP_STEP) as usize).min(COLOUR_MAP_SIZE - 2);
                let z = ((norm[2] / COLOUR_MAP_STEP) as usize).min(COLOUR_MAP_SIZE - 2);

                let fx = norm[0] / COLOUR_MAP_STEP - x as f32;
                let fy = norm[1] / COLOUR_MAP_STEP - y as f32;
                let fz = norm[2] / COLOUR_MAP_STEP - z as f32;

                let map = &self.colour_map;
                let prediction = tlerp(
                    map[xyz_to_3d_index(x, y, z, COLOUR_MAP_SIZE)],
                    map[xyz_to_3d_index(x, y + 1, z, COLOUR_MAP_SIZE)],
                    map[xyz_to_3d_index(x + 1, y + 1, z, COLOUR_MAP_SIZE)],
                    map[xyz_to_3d_index(x + 1, y, z, COLOUR_MAP_SIZE)],
                    map[xyz_to_3d_index(x, y, z + 1, COLOUR_MAP_SIZE)],
                    map[xyz_to_3d_index(x, y + 1, z + 1, COLOUR_MAP_SIZE)],
                    map[xyz_to_3d_index(x + 1, y + 1, z + 1, COLOUR_MAP_SIZE)],
                    map[xyz_to_3d_index(x + 1, y, z + 1, COLOUR_MAP_SIZE)],
                    fx, fy, fz,
                );

                let reflectance = *self.reflectance_map.at_2d::<Vec3f>(r, c)?;
                *dst.at_2d_mut::<Vec3f>(r, c)? = Vec3f::from([
                    prediction[0] * reflectance[0],
                    prediction[1] * reflectance[1],
                    prediction[2] * reflectance[2],
                ]);
            }
        }

        Ok(())
    }

    /// Mean channel intensity of the ambient (black screen) response.
    pub fn ambient_intensity(&self) -> f32 {
        let ambient_colour = self.colour_map[0];
        (1.0 / 3.0) * (ambient_colour[0] + ambient_colour[1] + ambient_colour[2])
    }

    /// Maps a lens-corrected camera point into view coordinates through
    /// the view homography.
    pub fn warp_point(&self, point: Point2f) -> Point2f {
        let p = self.view_homography * Vector3::new(f64::from(point.x), f64::from(point.y), 1.0);
        if p.z.abs() > 1e-10 {
            Point2f::new((p.x / p.z) as f32, (p.y / p.z) as f32)
        } else {
            point
        }
    }
}

/// Geometric stage output, produced before the photometric stage runs.
struct GeometricModel {
    correction_map: Mat,
    view_homography: Matrix3<f64>,
    screen_contour: [Point2f; 4],
}

/// Interactive calibrator for the camera-projector view.
pub struct ViewCalibrator {
    output_resolution: Size,
}

impl ViewCalibrator {
    pub fn new(output_resolution: Size) -> Self {
        debug_assert!(output_resolution.width > 0 && output_resolution.height > 0);
        Self { output_resolution }
    }

    /// Runs the full interactive calibration loop against the live
    /// webcam. Detection failures prompt the user through the projector
    /// feedback screen and restart the loop; the loop is not time bounded.
    pub fn calibrate(&self, webcam: &mut Webcam, config: &Config) -> Result<ViewCalibration> {
        debug_assert!(webcam.is_open());

        let offset = config.monitor_offset;
        make_fullscreen_window(WINDOW_NAME, offset)?;

        // Get the user to position their camera correctly.
        show_feedback(
            webcam,
            "Please ensure the entire screen is visible and in focus!",
            "Press any key to start the calibration...",
            WINDOW_NAME,
            offset,
        )?;

        // The calibration colours double as the screen detection probes
        // and the photometric white source. All four carry a strong green
        // component, which is robust under common indoor lighting.
        let calibration_colours = [
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            Scalar::new(0.0, 255.0, 0.0, 0.0),
            Scalar::new(255.0, 255.0, 0.0, 0.0),
            Scalar::new(0.0, 255.0, 255.0, 0.0),
        ];

        let chessboard_size = config.chessboard_size();
        let mut colour_samples = vec![Mat::default(); calibration_colours.len()];
        let mut chessboard_sample = Mat::default();

        let (geometric, corrected_white) = loop {
            calibrate_exposure(webcam, 250.0, WINDOW_NAME, offset)?;

            for (sample, colour) in colour_samples.iter_mut().zip(&calibration_colours) {
                capture_colour(
                    webcam,
                    sample,
                    *colour,
                    config.settle_time_ms,
                    config.capture_samples,
                    WINDOW_NAME,
                    offset,
                )?;
            }

            let chessboard_pattern =
                make_chessboard(chessboard_size, Vec3b::all(0), Vec3b::all(255))?;
            capture_image(
                webcam,
                &mut chessboard_sample,
                &chessboard_pattern,
                config.settle_time_ms,
                config.capture_samples,
                WINDOW_NAME,
                offset,
            )?;

            let Some(geometric) = self.find_geometric_model(
                &calibration_colours,
                &colour_samples,
                &chessboard_sample,
                chessboard_size,
            )?
            else {
                show_feedback(
                    webcam,
                    "Failed to find the screen or chessboard corners",
                    "Press any key to try again",
                    WINDOW_NAME,
                    offset,
                )?;
                continue;
            };

            // The screen polygon must fill enough of the camera frame for
            // the downstream detection to have usable resolution.
            let contour = Vector::<Point2f>::from_slice(&geometric.screen_contour);
            let coverage_floor =
                f64::from(config.min_coverage) * f64::from(self.output_resolution.area());
            if imgproc::contour_area(&contour, false)? < coverage_floor {
                show_feedback(
                    webcam,
                    "Please move the camera closer",
                    "Press any key to try again",
                    WINDOW_NAME,
                    offset,
                )?;
                continue;
            }

            let mut corrected_white = Mat::default();
            correct_with(&geometric.correction_map, &colour_samples[0], &mut corrected_white)?;

            break (geometric, corrected_white);
        };

        let (reflectance_map, colour_map) =
            self.find_photometric_model(webcam, config, &geometric, &corrected_white)?;

        // Show the result by drawing the screen outline on the chessboard
        // sample for a couple of seconds.
        let mut last_point = geometric.screen_contour[3];
        for &point in &geometric.screen_contour {
            imgproc::line(
                &mut chessboard_sample,
                Point::new(last_point.x as i32, last_point.y as i32),
                Point::new(point.x as i32, point.y as i32),
                Scalar::new(255.0, 0.0, 255.0, 0.0),
                2,
                imgproc::LINE_8,
                0,
            )?;
            last_point = point;
        }
        highgui::imshow(WINDOW_NAME, &chessboard_sample)?;
        highgui::wait_key(2000)?;
        highgui::destroy_window(WINDOW_NAME)?;

        log::info!("View calibration complete");

        Ok(ViewCalibration {
            output_resolution: self.output_resolution,
            correction_map: geometric.correction_map,
            view_homography: geometric.view_homography,
            screen_contour: geometric.screen_contour.to_vec(),
            colour_map,
            reflectance_map,
        })
    }

    /// Recovers the combined lens-distortion and screen-homography remap.
    /// Returns `Ok(None)` on any recoverable detection failure, with the
    /// specific reason logged.
    fn find_geometric_model(
        &self,
        colours: &[Scalar],
        samples: &[Mat],
        chessboard_sample: &Mat,
        chessboard_size: Size,
    ) -> Result<Option<GeometricModel>> {
        debug_assert!(chessboard_size.width > 2 && chessboard_size.height > 2);

        let webcam_resolution = chessboard_sample.size()?;

        // Find the raw screen contour using the colour samples.
        let Some(screen_corners) = self.detect_screen(colours, samples)? else {
            return Ok(None);
        };

        // Use the screen contour to find the chessboard corners.
        let Some(chessboard_corners) =
            self.detect_chessboard(&screen_corners, chessboard_sample, chessboard_size)?
        else {
            return Ok(None);
        };

        let ideal_chessboard_corners = self.ideal_chessboard_corners(chessboard_size);

        // Fit the intrinsics and distortion from the single chessboard view.
        let mut object_points: Vector<Vector<Point3f>> = Vector::new();
        object_points.push(
            ideal_chessboard_corners
                .iter()
                .map(|p| Point3f::new(p.x, p.y, 0.0))
                .collect(),
        );

        let mut image_points: Vector<Vector<Point2f>> = Vector::new();
        image_points.push(chessboard_corners.clone());

        let mut camera_matrix = Mat::default();
        let mut distortion_coefficients = Mat::default();
        calib3d::calibrate_camera(
            &object_points,
            &image_points,
            webcam_resolution,
            &mut camera_matrix,
            &mut distortion_coefficients,
            &mut core::no_array(),
            &mut core::no_array(),
            0,
            TermCriteria::new(
                core::TermCriteria_COUNT + core::TermCriteria_EPS,
                30,
                f64::EPSILON,
            )?,
        )?;

        // Optimize the camera matrix with alpha 1 so no pixels are lost.
        let optimal_camera_matrix = calib3d::get_optimal_new_camera_matrix(
            &camera_matrix,
            &distortion_coefficients,
            webcam_resolution,
            1.0,
            webcam_resolution,
            None,
            false,
        )?;

        let mut lens_correction_map = Mat::default();
        calib3d::init_undistort_rectify_map(
            &camera_matrix,
            &distortion_coefficients,
            &core::no_array(),
            &optimal_camera_matrix,
            webcam_resolution,
            core::CV_32FC2,
            &mut lens_correction_map,
            &mut core::no_array(),
        )?;

        // Rerun both detections on the lens-corrected samples so the
        // homography is fit against undistorted points.
        let mut corrected_chessboard = Mat::default();
        imgproc::remap(
            chessboard_sample,
            &mut corrected_chessboard,
            &lens_correction_map,
            &core::no_array(),
            imgproc::INTER_LANCZOS4,
            core::BORDER_CONSTANT,
            Scalar::default(),
        )?;

        let mut corrected_samples = Vec::with_capacity(samples.len());
        for sample in samples {
            let mut corrected = Mat::default();
            imgproc::remap(
                sample,
                &mut corrected,
                &lens_correction_map,
                &core::no_array(),
                imgproc::INTER_LANCZOS4,
                core::BORDER_CONSTANT,
                Scalar::default(),
            )?;
            corrected_samples.push(corrected);
        }

        let Some(corrected_screen_corners) = self.detect_screen(colours, &corrected_samples)?
        else {
            log::warn!("Failed to find the screen contour in lens corrected samples");
            return Ok(None);
        };

        let Some(corrected_chessboard_corners) = self.detect_chessboard(
            &corrected_screen_corners,
            &corrected_chessboard,
            chessboard_size,
        )?
        else {
            log::warn!("Failed to find corners in the lens corrected chessboard");
            return Ok(None);
        };

        // The screen quad and the chessboard grid together anchor the
        // view homography.
        let mut screen_points: Vector<Point2f> = Vector::new();
        for &corner in &corrected_screen_corners {
            screen_points.push(corner);
        }
        for corner in &corrected_chessboard_corners {
            screen_points.push(corner);
        }

        let br = Point2f::new(
            self.output_resolution.width as f32,
            self.output_resolution.height as f32,
        );
        let mut ideal_corners: Vector<Point2f> = Vector::new();
        ideal_corners.push(Point2f::new(0.0, 0.0));
        ideal_corners.push(Point2f::new(0.0, br.y));
        ideal_corners.push(Point2f::new(br.x, br.y));
        ideal_corners.push(Point2f::new(br.x, 0.0));
        for &corner in &ideal_chessboard_corners {
            ideal_corners.push(corner);
        }

        let usac_params = UsacParams {
            confidence: 0.999,
            is_parallel: false,
            lo_iterations: 10,
            lo_method: calib3d::LocalOptimMethod::LOCAL_OPTIM_SIGMA,
            lo_sample_size: 20,
            max_iterations: 1000,
            neighbors_search: calib3d::NeighborSearchMethod::NEIGH_GRID,
            random_generator_state: 0,
            sampler: calib3d::SamplingMethod::SAMPLING_UNIFORM,
            score: calib3d::ScoreMethod::SCORE_METHOD_MAGSAC,
            threshold: 3.0,
            final_polisher: calib3d::PolishingMethods::MAGSAC,
            final_polisher_iterations: 10,
        };
        let view_homography = calib3d::find_homography_1(
            &screen_points,
            &ideal_corners,
            &mut core::no_array(),
            usac_params,
        )?;

        // Warping the lens map by the homography composes the two into
        // the single correction map consumed at runtime.
        let mut correction_map = Mat::default();
        imgproc::warp_perspective(
            &lens_correction_map,
            &mut correction_map,
            &view_homography,
            self.output_resolution,
            imgproc::INTER_LANCZOS4,
            core::BORDER_CONSTANT,
            Scalar::default(),
        )?;

        Ok(Some(GeometricModel {
            correction_map,
            view_homography: homography_to_matrix(&view_homography)?,
            screen_contour: screen_corners,
        }))
    }

    /// Detects the projected screen quad from the colour samples. Each
    /// sample is thresholded by its distance to the displayed colour and
    /// only pixels matching all four survive.
    fn detect_screen(&self, colours: &[Scalar], samples: &[Mat]) -> Result<Option<[Point2f; 4]>> {
        debug_assert_eq!(samples.len(), colours.len());
        debug_assert!(!samples.is_empty());

        let mut difference = Mat::default();
        let mut gray = Mat::default();
        let mut colour_masks = Vec::with_capacity(colours.len());
        for (sample, colour) in samples.iter().zip(colours) {
            core::absdiff(sample, colour, &mut difference)?;
            imgproc::cvt_color(&difference, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;

            let mut mask = Mat::default();
            imgproc::threshold(
                &gray,
                &mut mask,
                0.0,
                255.0,
                imgproc::THRESH_OTSU | imgproc::THRESH_BINARY_INV,
            )?;
            colour_masks.push(mask);
        }

        let mut screen_mask = Mat::new_size_with_default(
            samples[0].size()?,
            core::CV_8UC1,
            Scalar::all(255.0),
        )?;
        for colour_mask in &colour_masks {
            let mut combined = Mat::default();
            core::bitwise_and(&screen_mask, colour_mask, &mut combined, &core::no_array())?;
            screen_mask = combined;
        }

        // Assume the screen region is the largest external contour.
        let mut external_contours: Vector<Vector<Point>> = Vector::new();
        imgproc::find_contours(
            &screen_mask,
            &mut external_contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::default(),
        )?;

        let mut screen_contour = Vector::<Point>::new();
        let mut max_area = 0.0;
        for contour in &external_contours {
            let area = imgproc::contour_area(&contour, false)?;
            if area > max_area {
                max_area = area;
                screen_contour = contour;
            }
        }

        if screen_contour.is_empty() {
            log::warn!("Screen detection failed - no contour was detected");
            return Ok(None);
        }

        // A properly detected screen simplifies to exactly four vertices.
        let mut quad = Vector::<Point>::new();
        imgproc::approx_poly_dp(&screen_contour, &mut quad, 4.0, true)?;
        if quad.len() != 4 {
            log::warn!("Screen detection failed - contour was {} vertices", quad.len());
            return Ok(None);
        }

        // The whole screen must be visible, so reject corners touching
        // the image border before refining them to sub-pixel accuracy.
        let mut corners = Vector::<Point2f>::new();
        for vertex in &quad {
            if vertex.x <= 0
                || vertex.y <= 0
                || vertex.x >= screen_mask.cols() - 1
                || vertex.y >= screen_mask.rows() - 1
            {
                log::warn!("Screen detection failed - screen touches the image border");
                return Ok(None);
            }
            corners.push(Point2f::new(vertex.x as f32, vertex.y as f32));
        }

        imgproc::corner_sub_pix(
            &screen_mask,
            &mut corners,
            Size::new(30, 30),
            Size::new(-1, -1),
            TermCriteria::new(core::TermCriteria_COUNT, 500, 0.0)?,
        )?;

        let corners = [corners.get(0)?, corners.get(1)?, corners.get(2)?, corners.get(3)?];
        Ok(Some(order_corners(&corners)))
    }

    /// Finds the inner chessboard corners in a captured sample. The
    /// region outside the detected screen is painted white first; the
    /// corner finder needs a quiet margin around the pattern.
    fn detect_chessboard(
        &self,
        screen_bounds: &[Point2f; 4],
        chessboard_sample: &Mat,
        chessboard_size: Size,
    ) -> Result<Option<Vector<Point2f>>> {
        let inner_pattern_size = Size::new(chessboard_size.width - 1, chessboard_size.height - 1);

        let mut screen_contour: Vector<Vector<Point>> = Vector::new();
        screen_contour.push(
            screen_bounds
                .iter()
                .map(|p| Point::new(p.x as i32, p.y as i32))
                .collect(),
        );

        let mut screen_fill = Mat::new_size_with_default(
            chessboard_sample.size()?,
            core::CV_8UC3,
            Scalar::default(),
        )?;
        imgproc::draw_contours(
            &mut screen_fill,
            &screen_contour,
            -1,
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            &core::no_array(),
            i32::MAX,
            Point::default(),
        )?;

        let mut margin = Mat::default();
        core::bitwise_not(&screen_fill, &mut margin, &core::no_array())?;

        let mut bordered_sample = Mat::default();
        core::add(&margin, chessboard_sample, &mut bordered_sample, &core::no_array(), -1)?;

        let mut corners = Vector::<Point2f>::new();
        let corners_found = calib3d::find_chessboard_corners(
            &bordered_sample,
            inner_pattern_size,
            &mut corners,
            calib3d::CALIB_CB_ADAPTIVE_THRESH + calib3d::CALIB_CB_NORMALIZE_IMAGE,
        )?;

        if corners_found {
            Ok(Some(corners))
        } else {
            log::warn!("Failed to detect chessboard corners");
            Ok(None)
        }
    }

    /// Ideal inner-corner positions of the chessboard in view coordinates.
    fn ideal_chessboard_corners(&self, chessboard_size: Size) -> Vec<Point2f> {
        let square_width = self.output_resolution.width as f32 / chessboard_size.width as f32;
        let square_height = self.output_resolution.height as f32 / chessboard_size.height as f32;

        let mut corners = Vec::new();
        for r in 1..chessboard_size.height {
            for c in 1..chessboard_size.width {
                corners.push(Point2f::new(c as f32 * square_width, r as f32 * square_height));
            }
        }
        corners
    }

    /// Learns the reflectance field and the colour response grid from
    /// the geometrically corrected captures.
    fn find_photometric_model(
        &self,
        webcam: &mut Webcam,
        config: &Config,
        geometric: &GeometricModel,
        white_sample: &Mat,
    ) -> Result<(Mat, Vec<Vector3<f32>>)> {
        // Estimate the spatial reflectance of every pixel from the white
        // sample, normalized by its own channel means.
        let white_point = core::mean(white_sample, &core::no_array())?;
        let mut white_response = Mat::default();
        white_sample.convert_to(&mut white_response, core::CV_32FC3, 1.0, 0.0)?;

        let mut reflectance_map = Mat::new_size_with_default(
            self.output_resolution,
            core::CV_32FC3,
            Scalar::default(),
        )?;
        for r in 0..reflectance_map.rows() {
            for c in 0..reflectance_map.cols() {
                let response = *white_response.at_2d::<Vec3f>(r, c)?;
                *reflectance_map.at_2d_mut::<Vec3f>(r, c)? = Vec3f::from([
                    (response[0] / white_point[0] as f32).max(REFLECTANCE_FLOOR),
                    (response[1] / white_point[1] as f32).max(REFLECTANCE_FLOOR),
                    (response[2] / white_point[2] as f32).max(REFLECTANCE_FLOOR),
                ]);
            }
        }

        let map_entries = COLOUR_MAP_SIZE * COLOUR_MAP_SIZE * COLOUR_MAP_SIZE;
        let mut colour_map = vec![Vector3::zeros(); map_entries];

        let mut capture_buffer = Mat::default();
        let mut sample_buffer = Mat::default();
        let mut cpu_buffer = Mat::default();

        // Two 16x16 tiles cover all 512 grid entries.
        const PATTERN_ROWS: i32 = 16;
        const PATTERN_COLS: i32 = 16;
        let cells_per_pattern = (PATTERN_ROWS * PATTERN_COLS) as usize;

        for k in 0..map_entries / cells_per_pattern {
            let mut pattern = Mat::new_rows_cols_with_default(
                PATTERN_ROWS,
                PATTERN_COLS,
                core::CV_8UC3,
                Scalar::default(),
            )?;
            for i in 0..cells_per_pattern {
                let map_index = k * cells_per_pattern + i;

                let x = map_index % COLOUR_MAP_SIZE;
                let y = (map_index / COLOUR_MAP_SIZE) % COLOUR_MAP_SIZE;
                let z = map_index / (COLOUR_MAP_SIZE * COLOUR_MAP_SIZE);

                *pattern.at_2d_mut::<Vec3b>(
                    i as i32 / PATTERN_COLS,
                    i as i32 % PATTERN_COLS,
                )? = Vec3b::from([
                    (x as f32 * COLOUR_MAP_STEP * 255.0).round() as u8,
                    (y as f32 * COLOUR_MAP_STEP * 255.0).round() as u8,
                    (z as f32 * COLOUR_MAP_STEP * 255.0).round() as u8,
                ]);
            }

            capture_image(
                webcam,
                &mut capture_buffer,
                &pattern,
                config.settle_time_ms,
                config.capture_samples,
                WINDOW_NAME,
                config.monitor_offset,
            )?;
            correct_with(&geometric.correction_map, &capture_buffer, &mut sample_buffer)?;
            sample_buffer.convert_to(&mut cpu_buffer, core::CV_32FC3, 1.0, 0.0)?;

            let sample_size = Size::new(
                self.output_resolution.width / PATTERN_COLS,
                self.output_resolution.height / PATTERN_ROWS,
            );

            for r in 0..PATTERN_ROWS {
                for c in 0..PATTERN_COLS {
                    let roi = Rect::new(
                        c * sample_size.width,
                        r * sample_size.height,
                        sample_size.width,
                        sample_size.height,
                    );

                    // Average the cell's block with the reflectance
                    // divided back out.
                    let mut measured = Vector3::<f32>::zeros();
                    for rr in 0..roi.height {
                        for rc in 0..roi.width {
                            let raw = *cpu_buffer.at_2d::<Vec3f>(rr + roi.y, rc + roi.x)?;
                            let reflectance =
                                *reflectance_map.at_2d::<Vec3f>(rr + roi.y, rc + roi.x)?;

                            measured += Vector3::new(
                                raw[0] / reflectance[0],
                                raw[1] / reflectance[1],
                                raw[2] / reflectance[2],
                            );
                        }
                    }
                    measured /= roi.area() as f32;

                    let map_index =
                        k * cells_per_pattern + (r * PATTERN_COLS + c) as usize;
                    colour_map[map_index] = measured;
                }
            }
        }

        Ok((reflectance_map, colour_map))
    }
}

/// Rectifies `src` through a correction map, as [`ViewCalibration::correct`]
/// does, before a full calibration object exists.
fn correct_with(correction_map: &Mat, src: &Mat, dst: &mut Mat) -> Result<()> {
    imgproc::remap(
        src,
        dst,
        correction_map,
        &core::no_array(),
        imgproc::INTER_CUBIC,
        core::BORDER_CONSTANT,
        Scalar::default(),
    )?;
    Ok(())
}

/// Orders four corners counter-clockwise starting at the top-left, by
/// which centroid-relative quadrant each corner falls in.
fn order_corners(corners: &[Point2f; 4]) -> [Point2f; 4] {
    let cx = 0.25 * (corners[0].x + corners[1].x + corners[2].x + corners[3].x);
    let cy = 0.25 * (corners[0].y + corners[1].y + corners[2].y + corners[3].y);

    let mut ordered = [Point2f::default(); 4];
    for &corner in corners {
        let index = if corner.x < cx {
            if corner.y < cy { 0 } else { 1 }
        } else {
            if corner.y < cy { 3 } else { 2 }
        };
        ordered[index] = corner;
    }
    ordered
}

fn homography_to_matrix(homography: &Mat) -> Result<Matrix3<f64>> {
    let mut matrix = Matrix3::zeros();
    for row in 0..3 {
        for col in 0..3 {
            matrix[(row, col)] = *homography.at_2d::<f64>(row as i32, col as i32)?;
        }
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_calibration(size: Size) -> ViewCalibration {
        // Linear colour map: entry (x,y,z) responds with (x,y,z) itself.
        let mut colour_map = vec![Vector3::zeros(); 512];
        for z in 0..COLOUR_MAP_SIZE {
            for y in 0..COLOUR_MAP_SIZE {
                for x in 0..COLOUR_MAP_SIZE {
                    colour_map[xyz_to_3d_index(x, y, z, COLOUR_MAP_SIZE)] =
                        Vector3::new(x as f32, y as f32, z as f32);
                }
            }
        }

        ViewCalibration {
            output_resolution: size,
            correction_map: Mat::default(),
            view_homography: Matrix3::identity(),
            screen_contour: vec![
                Point2f::new(10.0, 10.0),
                Point2f::new(10.0, 90.0),
                Point2f::new(90.0, 90.0),
                Point2f::new(90.0, 10.0),
            ],
            colour_map,
            reflectance_map: Mat::new_size_with_default(
                size,
                core::CV_32FC3,
                Scalar::all(1.0),
            )
            .unwrap(),
        }
    }

    #[test]
    fn colour_map_has_512_entries() {
        let calibration = test_calibration(Size::new(4, 4));
        assert_eq!(calibration.colour_map.len(), 512);
    }

    #[test]
    fn black_input_predicts_ambient_times_reflectance() {
        let size = Size::new(4, 4);
        let mut calibration = test_calibration(size);
        calibration.colour_map[0] = Vector3::new(5.0, 6.0, 7.0);

        let black = Mat::new_size_with_default(size, core::CV_8UC3, Scalar::default()).unwrap();
        let mut prediction = Mat::default();
        calibration.predict(&black, &mut prediction).unwrap();

        let expected = calibration.colour_map[0];
        let got = *prediction.at_2d::<Vec3f>(2, 1).unwrap();
        assert!((got[0] - expected[0]).abs() < 1e-5);
        assert!((got[1] - expected[1]).abs() < 1e-5);
        assert!((got[2] - expected[2]).abs() < 1e-5);
    }

    #[test]
    fn saturated_input_predicts_last_grid_entry() {
        let size = Size::new(2, 2);
        let calibration = test_calibration(size);

        let white = Mat::new_size_with_default(size, core::CV_8UC3, Scalar::all(255.0)).unwrap();
        let mut prediction = Mat::default();
        calibration.predict(&white, &mut prediction).unwrap();

        let got = *prediction.at_2d::<Vec3f>(0, 0).unwrap();
        assert!((got[0] - 7.0).abs() < 1e-4);
        assert!((got[1] - 7.0).abs() < 1e-4);
        assert!((got[2] - 7.0).abs() < 1e-4);
    }

    #[test]
    fn predict_is_pure() {
        let size = Size::new(3, 3);
        let calibration = test_calibration(size);

        let input = Mat::new_size_with_default(
            size,
            core::CV_8UC3,
            Scalar::new(37.0, 101.0, 220.0, 0.0),
        )
        .unwrap();

        let mut first = Mat::default();
        let mut second = Mat::default();
        calibration.predict(&input, &mut first).unwrap();
        calibration.predict(&input, &mut second).unwrap();

        for r in 0..size.height {
            for c in 0..size.width {
                assert_eq!(
                    *first.at_2d::<Vec3f>(r, c).unwrap(),
                    *second.at_2d::<Vec3f>(r, c).unwrap()
                );
            }
        }
    }

    #[test]
    fn ambient_intensity_averages_entry_zero() {
        let mut calibration = test_calibration(Size::new(2, 2));
        calibration.colour_map[0] = Vector3::new(30.0, 60.0, 90.0);
        assert!((calibration.ambient_intensity() - 60.0).abs() < 1e-5);
    }

    #[test]
    fn identity_homography_preserves_points() {
        let calibration = test_calibration(Size::new(2, 2));
        let p = Point2f::new(123.5, 45.25);
        let warped = calibration.warp_point(p);
        assert!((warped.x - p.x).abs() < 1e-5);
        assert!((warped.y - p.y).abs() < 1e-5);
    }

    #[test]
    fn corners_order_counter_clockwise_from_top_left() {
        let scrambled = [
            Point2f::new(95.0, 5.0),   // top-right
            Point2f::new(3.0, 4.0),    // top-left
            Point2f::new(97.0, 93.0),  // bottom-right
            Point2f::new(2.0, 95.0),   // bottom-left
        ];

        let ordered = order_corners(&scrambled);
        assert_eq!(ordered[0], Point2f::new(3.0, 4.0));
        assert_eq!(ordered[1], Point2f::new(2.0, 95.0));
        assert_eq!(ordered[2], Point2f::new(97.0, 93.0));
        assert_eq!(ordered[3], Point2f::new(95.0, 5.0));
    }

    #[test]
    fn ideal_grid_skips_outer_corners() {
        let calibrator = ViewCalibrator::new(Size::new(640, 480));
        let corners = calibrator.ideal_chessboard_corners(Size::new(22, 18));

        assert_eq!(corners.len(), 21 * 17);
        let square = Point2f::new(640.0 / 22.0, 480.0 / 18.0);
        assert!((corners[0].x - square.x).abs() < 1e-4);
        assert!((corners[0].y - square.y).abs() < 1e-4);
        let last = corners.last().unwrap();
        assert!((last.x - 21.0 * square.x).abs() < 1e-3);
        assert!((last.y - 17.0 * square.y).abs() < 1e-3);
    }
}
