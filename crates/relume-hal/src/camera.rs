//! Generic `Camera` trait and supporting types for image-capture hardware.
//!
//! Drivers expose a small lifecycle (`initialize` → `capture`* → `release`)
//! plus typed runtime parameters ([`CameraParam`]).  Continuous capture with
//! failure recovery lives in [`crate::capture`].

use relume_types::RelumeError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A raw RGB24 image frame returned by a camera driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row-major RGB24 pixel data (`width * height * 3` bytes).
    pub data: Vec<u8>,
}

impl CameraFrame {
    /// Allocate an all-black frame.
    pub fn black(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * 3],
        }
    }

    /// `true` when the buffer length matches the declared dimensions.
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * 3
    }
}

/// Capture settings applied by [`Camera::initialize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Index of the capture device (`/dev/videoN` style).
    pub device_id: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Exposure value; `-1` requests automatic exposure.
    pub exposure: f32,
    /// White balance colour temperature (K).
    pub white_balance: u32,
    pub brightness: f32,
    pub contrast: f32,
    /// Time the sensor is given to settle after opening.
    pub warmup_ms: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device_id: 0,
            width: 640,
            height: 480,
            fps: 30,
            exposure: -4.0,
            white_balance: 4000,
            brightness: 150.0,
            contrast: 50.0,
            warmup_ms: 2000,
        }
    }
}

/// A single runtime-adjustable camera parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraParam {
    Width(u32),
    Height(u32),
    Fps(u32),
    Exposure(f32),
    WhiteBalance(u32),
    Brightness(f32),
    Contrast(f32),
}

impl CameraParam {
    /// Parse a `key=value` style parameter, e.g. `("exposure", "-3")`.
    ///
    /// # Errors
    ///
    /// Returns [`RelumeError::Camera`] for unknown keys or values that do not
    /// parse as the parameter's numeric type.
    pub fn parse(key: &str, value: &str) -> Result<Self, RelumeError> {
        let bad = |e: &dyn std::fmt::Display| {
            RelumeError::Camera(format!("invalid value '{value}' for '{key}': {e}"))
        };
        let v = value.trim();
        match key.trim() {
            "width" => v.parse().map(Self::Width).map_err(|e| bad(&e)),
            "height" => v.parse().map(Self::Height).map_err(|e| bad(&e)),
            "fps" => v.parse().map(Self::Fps).map_err(|e| bad(&e)),
            "exposure" => v.parse().map(Self::Exposure).map_err(|e| bad(&e)),
            "white_balance" => v.parse().map(Self::WhiteBalance).map_err(|e| bad(&e)),
            "brightness" => v.parse().map(Self::Brightness).map_err(|e| bad(&e)),
            "contrast" => v.parse().map(Self::Contrast).map_err(|e| bad(&e)),
            other => Err(RelumeError::Camera(format!("unknown parameter '{other}'"))),
        }
    }

    /// Record this parameter in `settings`.
    pub fn store(&self, settings: &mut CameraSettings) {
        match *self {
            Self::Width(v) => settings.width = v,
            Self::Height(v) => settings.height = v,
            Self::Fps(v) => settings.fps = v,
            Self::Exposure(v) => settings.exposure = v,
            Self::WhiteBalance(v) => settings.white_balance = v,
            Self::Brightness(v) => settings.brightness = v,
            Self::Contrast(v) => settings.contrast = v,
        }
    }
}

/// A camera or image-capture device.
pub trait Camera: Send {
    /// Stable identifier for this camera, e.g. `"front_rgb"`.
    fn id(&self) -> &str;

    /// Open the device and apply every field of `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`RelumeError::Camera`] if the device cannot be opened.
    fn initialize(&mut self, settings: &CameraSettings) -> Result<(), RelumeError>;

    /// Apply one parameter to an open device.
    fn apply(&mut self, param: &CameraParam) -> Result<(), RelumeError>;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelumeError::Camera`] if the frame cannot be captured
    /// (e.g. the device is disconnected or the buffer is unavailable).
    fn capture(&mut self) -> Result<CameraFrame, RelumeError>;

    /// Close the device.  Idempotent.
    fn release(&mut self);

    /// `true` between a successful `initialize` and `release`.
    fn is_open(&self) -> bool;
}

/// Apply `params` to an open camera and mirror them into `settings`.
///
/// A closed camera is left untouched and a warning is logged.  Individual
/// parameters the driver rejects are logged and skipped.
pub fn set_parameters(camera: &mut dyn Camera, settings: &mut CameraSettings, params: &[CameraParam]) {
    if !camera.is_open() {
        warn!(camera = camera.id(), "camera not initialised; parameters not applied");
        return;
    }
    for param in params {
        match camera.apply(param) {
            Ok(()) => param.store(settings),
            Err(e) => warn!(camera = camera.id(), ?param, error = %e, "parameter rejected"),
        }
    }
    info!(camera = camera.id(), "camera parameters updated");
}

/// Synchronous single-frame capture.
///
/// # Errors
///
/// Returns [`RelumeError::Camera`] if the camera has not been initialised or
/// the capture fails.
pub fn capture_once(camera: &mut dyn Camera) -> Result<CameraFrame, RelumeError> {
    if !camera.is_open() {
        return Err(RelumeError::Camera(format!(
            "camera '{}' is not initialised",
            camera.id()
        )));
    }
    camera.capture()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockCamera {
        id: String,
        open: bool,
        applied: Vec<CameraParam>,
    }

    impl MockCamera {
        fn new() -> Self {
            Self {
                id: "front_rgb".to_string(),
                open: false,
                applied: Vec::new(),
            }
        }
    }

    impl Camera for MockCamera {
        fn id(&self) -> &str {
            &self.id
        }

        fn initialize(&mut self, _settings: &CameraSettings) -> Result<(), RelumeError> {
            self.open = true;
            Ok(())
        }

        fn apply(&mut self, param: &CameraParam) -> Result<(), RelumeError> {
            if let CameraParam::Fps(0) = param {
                return Err(RelumeError::Camera("fps must be positive".to_string()));
            }
            self.applied.push(*param);
            Ok(())
        }

        fn capture(&mut self) -> Result<CameraFrame, RelumeError> {
            Ok(CameraFrame::black(2, 2))
        }

        fn release(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    #[test]
    fn default_settings_match_competition_profile() {
        let s = CameraSettings::default();
        assert_eq!((s.width, s.height, s.fps), (640, 480, 30));
        assert_eq!(s.white_balance, 4000);
        assert!((s.exposure - -4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn parse_known_and_unknown_keys() {
        assert_eq!(CameraParam::parse("exposure", "-3").unwrap(), CameraParam::Exposure(-3.0));
        assert_eq!(CameraParam::parse("width", " 1280 ").unwrap(), CameraParam::Width(1280));
        assert!(matches!(CameraParam::parse("gamma", "1.0"), Err(RelumeError::Camera(_))));
        assert!(matches!(CameraParam::parse("fps", "fast"), Err(RelumeError::Camera(_))));
    }

    #[test]
    fn set_parameters_on_closed_camera_is_noop() {
        let mut cam = MockCamera::new();
        let mut settings = CameraSettings::default();
        set_parameters(&mut cam, &mut settings, &[CameraParam::Brightness(160.0)]);
        assert!(cam.applied.is_empty());
        assert!((settings.brightness - 150.0).abs() < f32::EPSILON);
    }

    #[test]
    fn set_parameters_updates_settings_and_skips_rejected() {
        let mut cam = MockCamera::new();
        let mut settings = CameraSettings::default();
        cam.initialize(&settings).unwrap();
        set_parameters(
            &mut cam,
            &mut settings,
            &[CameraParam::Exposure(-3.0), CameraParam::Fps(0), CameraParam::Brightness(160.0)],
        );
        assert_eq!(cam.applied.len(), 2);
        assert!((settings.exposure - -3.0).abs() < f32::EPSILON);
        assert_eq!(settings.fps, 30);
        assert!((settings.brightness - 160.0).abs() < f32::EPSILON);
    }

    #[test]
    fn capture_once_requires_open_camera() {
        let mut cam = MockCamera::new();
        assert!(capture_once(&mut cam).is_err());
        cam.initialize(&CameraSettings::default()).unwrap();
        let frame = capture_once(&mut cam).unwrap();
        assert!(frame.is_consistent());
        assert_eq!(frame.data.len(), 12);
    }
}
