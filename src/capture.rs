//! Image acquisition module
//! The pipeline never grabs the screen itself: it pulls frames from an `ImageSource`.
//! `FileImageSource` re-reads an image file on every scan, so an external screenshot tool
//! can keep overwriting it (e.g. `screenshots/current_board.png`).
//! Debug: set `DEBUG_RECTIFIED=1` to save each rectified board to `screenshots/debug_board.png`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::{DynamicImage, GenericImageView};
use tracing::{debug, warn};

use crate::detect::RectifiedBoard;
use crate::error::AnalyzerError;

pub const DEBUG_DIR: &str = "screenshots";
pub const DEBUG_BOARD_FILE: &str = "debug_board.png";

/// Produces one raw frame per call.
pub trait ImageSource: Send + Sync {
    fn capture(&self) -> Result<DynamicImage, AnalyzerError>;
}

/// Loads the image at `path` on every capture.
#[derive(Clone, Debug)]
pub struct FileImageSource {
    path: PathBuf,
}

impl FileImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileImageSource {
    fn capture(&self) -> Result<DynamicImage, AnalyzerError> {
        let start = Instant::now();
        let img = image::open(&self.path)?;
        let (w, h) = img.dimensions();
        debug!(
            path = %self.path.display(),
            width = w,
            height = h,
            latency_ms = start.elapsed().as_millis() as u64,
            "Frame loaded"
        );
        Ok(img)
    }
}

/// Hands out clones of a fixed frame. Handy for one-shot runs and tests.
#[derive(Clone, Debug)]
pub struct StaticImageSource {
    image: DynamicImage,
}

impl StaticImageSource {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }
}

impl ImageSource for StaticImageSource {
    fn capture(&self) -> Result<DynamicImage, AnalyzerError> {
        Ok(self.image.clone())
    }
}

pub fn debug_dump_enabled() -> bool {
    env::var_os("DEBUG_RECTIFIED").is_some()
}

/// Writes `board` under `dir` as `debug_board.png`, returning the written path.
pub fn save_debug_board(board: &RectifiedBoard, dir: &Path) -> Result<PathBuf, AnalyzerError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(DEBUG_BOARD_FILE);
    board.image().save(&path)?;
    Ok(path)
}

/// Saves the rectified board when `DEBUG_RECTIFIED` is set. Failures are logged, not raised.
pub fn maybe_dump_rectified(board: &RectifiedBoard) {
    if !debug_dump_enabled() {
        return;
    }
    match save_debug_board(board, Path::new(DEBUG_DIR)) {
        Ok(path) => debug!(path = %path.display(), "Saved rectified board"),
        Err(e) => warn!(error = %e, "Failed to save rectified board"),
    }
}
