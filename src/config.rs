use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use opencv::core::Size;
use serde::{Deserialize, Serialize};

/// Runtime configuration for the touch pipeline.
///
/// Loaded from an optional JSON file next to the executable; any missing
/// field falls back to its default, so a partial config is valid.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Requested webcam capture dimensions.
    pub webcam_width: i32,
    pub webcam_height: i32,
    /// Requested webcam framerate.
    pub webcam_fps: i32,
    /// Working view resolution; all rectified frames, masks and the
    /// reflectance map share this size.
    pub view_width: i32,
    pub view_height: i32,
    /// Chessboard squares per side for the lens calibration pattern.
    pub chessboard_cols: i32,
    pub chessboard_rows: i32,
    /// Number of frames averaged per calibration capture.
    pub capture_samples: i32,
    /// Milliseconds to wait after a display change before capturing.
    pub settle_time_ms: u64,
    /// Minimum fraction of the view the detected screen polygon must fill.
    pub min_coverage: f32,
    /// Size of the predicted-background delay queue.
    pub prediction_delay: usize,
    /// Virtual-desktop origin of the projector monitor.
    pub monitor_offset: (i32, i32),
    /// Apply pointer smoothing while tracking.
    pub smoothing: bool,
    /// Show a window with the view, predicted background and raw mask
    /// side by side while running.
    pub show_diagnostics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webcam_width: 640,
            webcam_height: 480,
            webcam_fps: 30,
            view_width: 640,
            view_height: 480,
            chessboard_cols: 22,
            chessboard_rows: 18,
            capture_samples: 6,
            settle_time_ms: 1000,
            min_coverage: 0.1,
            prediction_delay: 3,
            monitor_offset: (0, 0),
            smoothing: true,
            show_diagnostics: false,
        }
    }
}

impl Config {
    /// Loads the config from `path`, falling back to defaults when the
    /// file does not exist. A present but malformed file is an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn webcam_size(&self) -> Size {
        Size::new(self.webcam_width, self.webcam_height)
    }

    pub fn view_size(&self) -> Size {
        Size::new(self.view_width, self.view_height)
    }

    pub fn chessboard_size(&self) -> Size {
        Size::new(self.chessboard_cols, self.chessboard_rows)
    }
}
