use anyhow::Result;
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};

/// Thin wrapper around the webcam stream exposing the properties the
/// calibration stages need (actual resolution, framerate, frame latency).
pub struct Webcam {
    stream: VideoCapture,
    pub width: i32,
    pub height: i32,
    pub framerate: i32,
    pub latency_ms: i32,
}

impl Webcam {
    /// Opens the webcam with the given hardware id, requesting the target
    /// resolution and framerate. Returns `None` when the device cannot be
    /// opened. Property requests the backend ignores are tolerated; the
    /// actual values are read back after configuration.
    pub fn try_create(id: i32, target_size: Size, target_framerate: i32) -> Result<Option<Webcam>> {
        debug_assert!(target_size.width > 0 && target_size.height > 0);
        debug_assert!(target_framerate > 0);

        // The MSMF hardware transform stalls stream initialization for
        // several seconds on some capture devices.
        std::env::set_var("OPENCV_VIDEOIO_MSMF_ENABLE_HW_TRANSFORMS", "0");

        let mut stream = VideoCapture::new(id, videoio::CAP_ANY)?;
        if !stream.is_opened()? {
            return Ok(None);
        }

        let _ = stream.set(videoio::CAP_PROP_FPS, f64::from(target_framerate));
        let _ = stream.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(target_size.width));
        let _ = stream.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(target_size.height));

        let framerate = stream.get(videoio::CAP_PROP_FPS)? as i32;
        let width = stream.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = stream.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

        Ok(Some(Webcam {
            stream,
            width,
            height,
            framerate,
            latency_ms: (1000.0 / framerate.max(1) as f32).round() as i32,
        }))
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_opened().unwrap_or(false)
    }

    /// Reads the next frame into `dst`. Returns false at end of stream.
    pub fn next_frame(&mut self, dst: &mut Mat) -> Result<bool> {
        Ok(self.stream.read(dst)?)
    }

    /// Burns a frame without decoding it, used to flush stale buffers.
    pub fn drop_frame(&mut self) -> Result<()> {
        self.stream.grab()?;
        Ok(())
    }

    pub fn raw(&mut self) -> &mut VideoCapture {
        &mut self.stream
    }
}
