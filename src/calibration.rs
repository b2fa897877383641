//! Calibration capture primitives: the fullscreen projector surface,
//! settle-and-average pattern capture, camera exposure locking and the
//! interactive feedback screen.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use opencv::core::{self, Mat, Point, Rect, Scalar, Size};
use opencv::prelude::*;
use opencv::videoio::{
    CAP_PROP_AUTOFOCUS, CAP_PROP_AUTO_EXPOSURE, CAP_PROP_AUTO_WB, CAP_PROP_EXPOSURE,
    CAP_PROP_FOCUS, CAP_PROP_GAIN, CAP_PROP_WB_TEMPERATURE,
};
use opencv::{highgui, imgproc};

use crate::webcam::Webcam;

/// Creates (or re-asserts) a borderless topmost fullscreen window on the
/// projector monitor and returns its screen rectangle.
pub fn make_fullscreen_window(window_name: &str, monitor_offset: (i32, i32)) -> Result<Rect> {
    highgui::named_window(window_name, highgui::WINDOW_GUI_NORMAL)?;
    highgui::move_window(window_name, monitor_offset.0, monitor_offset.1)?;
    highgui::set_window_property(window_name, highgui::WND_PROP_TOPMOST, 1.0)?;
    highgui::set_window_property(
        window_name,
        highgui::WND_PROP_FULLSCREEN,
        f64::from(highgui::WINDOW_FULLSCREEN),
    )?;
    Ok(highgui::get_window_image_rect(window_name)?)
}

/// Displays `pattern` fullscreen, waits for the camera and projector to
/// settle, then captures the pixelwise mean of `capture_samples` frames
/// into `dst` as 8-bit. The three frames buffered by the driver before
/// the settle period are discarded first.
pub fn capture_image(
    webcam: &mut Webcam,
    dst: &mut Mat,
    pattern: &Mat,
    settle_time_ms: u64,
    capture_samples: i32,
    window_name: &str,
    monitor_offset: (i32, i32),
) -> Result<()> {
    debug_assert!(capture_samples >= 1);

    make_fullscreen_window(window_name, monitor_offset)?;
    highgui::imshow(window_name, pattern)?;
    highgui::poll_key()?;

    thread::sleep(Duration::from_millis(settle_time_ms));

    webcam.drop_frame()?;
    webcam.drop_frame()?;
    webcam.drop_frame()?;

    let mut frame = Mat::default();
    let mut average = Mat::new_rows_cols_with_default(
        webcam.height,
        webcam.width,
        core::CV_64FC3,
        Scalar::all(0.0),
    )?;

    for _ in 0..capture_samples {
        webcam.next_frame(&mut frame)?;
        imgproc::accumulate(&frame, &mut average, &core::no_array())?;
    }

    average.convert_to(dst, core::CV_8UC3, 1.0 / f64::from(capture_samples), 0.0)?;
    Ok(())
}

/// Captures a solid colour displayed fullscreen, via [`capture_image`].
pub fn capture_colour(
    webcam: &mut Webcam,
    dst: &mut Mat,
    colour: Scalar,
    settle_time_ms: u64,
    capture_samples: i32,
    window_name: &str,
    monitor_offset: (i32, i32),
) -> Result<()> {
    let colour_image = Mat::new_rows_cols_with_default(1, 1, core::CV_8UC3, colour)?;

    capture_image(
        webcam,
        dst,
        &colour_image,
        settle_time_ms,
        capture_samples,
        window_name,
        monitor_offset,
    )
}

/// Locks the camera into a fixed exposure that does not clip the
/// projector highlights. Focus, white balance, auto-exposure and gain
/// are disabled best-effort; backends that ignore the properties are
/// tolerated. Exposure is then searched downward from zero against a
/// displayed white screen until the brightest pixel falls at or below
/// `brightness_target`.
pub fn calibrate_exposure(
    webcam: &mut Webcam,
    brightness_target: f64,
    window_name: &str,
    monitor_offset: (i32, i32),
) -> Result<()> {
    debug_assert!(brightness_target > 0.0 && brightness_target < 255.0);

    {
        let cam = webcam.raw();

        // Lock the focus, assuming the camera is already in focus.
        let _ = cam.set(CAP_PROP_AUTOFOCUS, 0.0);
        let current_focus = cam.get(CAP_PROP_FOCUS).unwrap_or(0.0);
        let _ = cam.set(CAP_PROP_FOCUS, current_focus);

        // Lock the white balance to neutral. Unsupported on many backends.
        let _ = cam.set(CAP_PROP_AUTO_WB, 0.0);
        let _ = cam.set(CAP_PROP_WB_TEMPERATURE, 4500.0);

        let _ = cam.set(CAP_PROP_AUTO_EXPOSURE, 0.25);
        let _ = cam.set(CAP_PROP_GAIN, 0.0);
    }

    let settle_time = u64::try_from(webcam.latency_ms * 2).unwrap_or(0);
    let mut webcam_sample = Mat::default();
    let mut intensity = Mat::default();

    let mut exposure_level = 0.0;
    loop {
        let _ = webcam.raw().set(CAP_PROP_EXPOSURE, exposure_level);
        exposure_level -= 1.0;

        capture_colour(
            webcam,
            &mut webcam_sample,
            Scalar::all(255.0),
            settle_time,
            3,
            window_name,
            monitor_offset,
        )?;
        imgproc::cvt_color(&webcam_sample, &mut intensity, imgproc::COLOR_BGR2GRAY, 0)?;

        let mut max_brightness = 0.0;
        core::min_max_loc(
            &intensity,
            None,
            Some(&mut max_brightness),
            None,
            None,
            &core::no_array(),
        )?;

        if max_brightness <= brightness_target {
            log::info!(
                "Locked exposure at level {} (max intensity {})",
                exposure_level + 1.0,
                max_brightness
            );
            return Ok(());
        }
    }
}

/// Shows a feedback screen with the live webcam view in the centre and
/// two text banners, until the user presses any key.
pub fn show_feedback(
    webcam: &mut Webcam,
    top_text: &str,
    bot_text: &str,
    window_name: &str,
    monitor_offset: (i32, i32),
) -> Result<()> {
    let window_region = make_fullscreen_window(window_name, monitor_offset)?;
    let window_size = Size::new(window_region.width, window_region.height);

    // Scale the webcam view to fit between the header and footer bands.
    const HEADER_SIZE: f32 = 80.0;
    const FOOTER_SIZE: f32 = 80.0;
    let vertical_space = window_size.height as f32 - HEADER_SIZE - FOOTER_SIZE;

    let hs = vertical_space / webcam.height as f32;
    let ws = window_size.width as f32 / webcam.width as f32;
    let scaling = hs.min(ws);

    let webcam_size = Size::new(
        (webcam.width as f32 * scaling) as i32,
        (webcam.height as f32 * scaling) as i32,
    );
    let webcam_slot = Rect::new(
        (window_size.width - webcam_size.width) / 2,
        (window_size.height - webcam_size.height) / 2,
        webcam_size.width,
        webcam_size.height,
    );

    let mut window_frame =
        Mat::new_size_with_default(window_size, core::CV_8UC3, Scalar::all(255.0))?;
    let mut webcam_frame = Mat::default();
    let mut webcam_scaled_frame = Mat::default();

    while highgui::wait_key(webcam.latency_ms)? == -1 {
        window_frame.set_to(&Scalar::all(255.0), &core::no_array())?;

        webcam.next_frame(&mut webcam_frame)?;
        imgproc::resize(
            &webcam_frame,
            &mut webcam_scaled_frame,
            webcam_size,
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;
        webcam_scaled_frame.copy_to(&mut Mat::roi_mut(&mut window_frame, webcam_slot)?)?;

        imgproc::put_text(
            &mut window_frame,
            top_text,
            Point::new(10, 50),
            imgproc::FONT_HERSHEY_COMPLEX_SMALL,
            2.0,
            Scalar::all(0.0),
            3,
            imgproc::LINE_AA,
            false,
        )?;
        imgproc::put_text(
            &mut window_frame,
            bot_text,
            Point::new(10, window_size.height - 50),
            imgproc::FONT_HERSHEY_COMPLEX_SMALL,
            2.0,
            Scalar::all(0.0),
            3,
            imgproc::LINE_AA,
            false,
        )?;

        highgui::imshow(window_name, &window_frame)?;
    }

    Ok(())
}
