use std::io;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use opencv::core::{self, Mat, Scalar, Size};
use opencv::prelude::*;
use scrap::{Capturer, Display};

/// Captures the framebuffer of a monitor as BGRA frames.
///
/// The capturer only reports a frame when the screen content actually
/// changed, so [`ScreenCapture::read`] polls against a deadline and
/// returns false on timeout.
pub struct ScreenCapture {
    capturer: Capturer,
    width: usize,
    height: usize,
}

impl ScreenCapture {
    /// Opens a capture of the primary monitor.
    pub fn open_primary() -> Result<Self> {
        let display = Display::primary().context("Failed to query the primary display")?;
        let width = display.width();
        let height = display.height();

        let capturer = Capturer::new(display).context("Failed to open the screen capturer")?;

        log::info!("Opened screen capture ({}x{})", width, height);
        Ok(Self {
            capturer,
            width,
            height,
        })
    }

    /// Native resolution of the captured monitor.
    pub fn size(&self) -> Size {
        Size::new(self.width as i32, self.height as i32)
    }

    /// Reads the next framebuffer into `dst` as an 8-bit BGRA image of
    /// the monitor's native resolution. Returns true iff a new frame
    /// arrived within `timeout_ms`; on timeout `dst` is left untouched.
    pub fn read(&mut self, dst: &mut Mat, timeout_ms: u64) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            match self.capturer.frame() {
                Ok(frame) => {
                    if dst.size()? != self.size() || dst.typ() != core::CV_8UC4 {
                        *dst = Mat::new_rows_cols_with_default(
                            self.height as i32,
                            self.width as i32,
                            core::CV_8UC4,
                            Scalar::default(),
                        )?;
                    }

                    copy_bgra_rows(&frame, self.width, self.height, dst.data_bytes_mut()?);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e).context("Screen capture read failed"),
            }
        }
    }
}

/// Copies a captured BGRA buffer into a tightly packed destination,
/// stripping the per-row padding some backends add.
fn copy_bgra_rows(src: &[u8], width: usize, height: usize, dst: &mut [u8]) {
    let row_bytes = width * 4;
    let src_pitch = src.len() / height;
    debug_assert!(src_pitch >= row_bytes);
    debug_assert!(dst.len() >= row_bytes * height);

    for row in 0..height {
        let src_row = &src[row * src_pitch..row * src_pitch + row_bytes];
        dst[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(src_row);
    }
}
