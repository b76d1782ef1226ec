//! [`DirectoryCamera`] – replays recorded PNM frames as a live camera.

use std::fs;
use std::path::{Path, PathBuf};

use relume_types::RelumeError;
use tracing::{debug, info};

use crate::camera::{Camera, CameraFrame, CameraParam, CameraSettings};
use crate::pnm;

/// Serves `.ppm` / `.pgm` files from a directory in file-name order,
/// looping forever.
#[derive(Debug)]
pub struct DirectoryCamera {
    id: String,
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    open: bool,
}

impl DirectoryCamera {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            dir: dir.into(),
            files: Vec::new(),
            next: 0,
            open: false,
        }
    }

    fn scan(dir: &Path) -> Result<Vec<PathBuf>, RelumeError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| RelumeError::Camera(format!("cannot open frame directory {}: {e}", dir.display())))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("ppm") || ext.eq_ignore_ascii_case("pgm"))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

impl Camera for DirectoryCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn initialize(&mut self, _settings: &CameraSettings) -> Result<(), RelumeError> {
        let files = Self::scan(&self.dir)?;
        if files.is_empty() {
            return Err(RelumeError::Camera(format!(
                "no .ppm/.pgm frames in {}",
                self.dir.display()
            )));
        }
        info!(camera = %self.id, frames = files.len(), dir = %self.dir.display(), "replay camera opened");
        self.files = files;
        self.next = 0;
        self.open = true;
        Ok(())
    }

    fn apply(&mut self, param: &CameraParam) -> Result<(), RelumeError> {
        // Recorded frames have fixed geometry and exposure.
        debug!(camera = %self.id, ?param, "parameter ignored by replay camera");
        Ok(())
    }

    fn capture(&mut self) -> Result<CameraFrame, RelumeError> {
        if !self.open {
            return Err(RelumeError::Camera(format!("replay camera '{}' is closed", self.id)));
        }
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        pnm::read_frame(path).map_err(|e| RelumeError::Camera(e.to_string()))
    }

    fn release(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
