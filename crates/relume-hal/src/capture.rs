//! [`CaptureSupervisor`] – continuous camera capture on a dedicated thread.
//!
//! The supervisor owns a [`Camera`] and repeatedly captures frames, handing
//! each one to a registered callback.  Capture failures are tolerated: after
//! [`REINIT_THRESHOLD`] consecutive failures the camera is released and
//! re-initialised.  Callback errors are logged and never stop the loop.
//!
//! # Example
//!
//! ```rust
//! use relume_hal::camera::CameraSettings;
//! use relume_hal::capture::CaptureSupervisor;
//! use relume_hal::sim::SimCamera;
//!
//! let settings = CameraSettings { width: 32, height: 24, fps: 100, warmup_ms: 0, ..Default::default() };
//! let supervisor = CaptureSupervisor::start(
//!     Box::new(SimCamera::new("front")),
//!     settings,
//!     Box::new(|frame| {
//!         assert_eq!(frame.width, 32);
//!         Ok(())
//!     }),
//! )
//! .unwrap();
//! supervisor.stop();
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use relume_types::RelumeError;
use tracing::{debug, error, info, warn};

use crate::camera::{Camera, CameraFrame, CameraSettings};

/// Consecutive capture failures that trigger a camera re-initialisation.
pub const REINIT_THRESHOLD: u32 = 5;

/// Pause after a failed capture before retrying.
const FAILURE_BACKOFF: Duration = Duration::from_millis(100);

/// Per-frame callback.  Runs on the capture thread.
pub type FrameCallback = Box<dyn FnMut(CameraFrame) -> Result<(), RelumeError> + Send>;

/// Counters shared between the capture thread and its owner.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames: AtomicU64,
    failures: AtomicU64,
    reinitializations: AtomicU64,
}

impl CaptureStats {
    /// Frames successfully captured and handed to the callback.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Failed capture attempts.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Successful camera re-initialisations after repeated failures.
    pub fn reinitializations(&self) -> u64 {
        self.reinitializations.load(Ordering::Relaxed)
    }
}

/// Handle to a running capture thread.  Dropping it stops the thread.
pub struct CaptureSupervisor {
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    handle: Option<JoinHandle<Box<dyn Camera>>>,
}

impl std::fmt::Debug for CaptureSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSupervisor")
            .field("running", &self.is_running())
            .field("stats", &self.stats)
            .finish()
    }
}

impl CaptureSupervisor {
    /// Initialise `camera` if needed and start the capture thread.
    ///
    /// # Errors
    ///
    /// Returns [`RelumeError::Camera`] when the initial camera open fails or
    /// the thread cannot be spawned.
    pub fn start(
        mut camera: Box<dyn Camera>,
        settings: CameraSettings,
        callback: FrameCallback,
    ) -> Result<Self, RelumeError> {
        if !camera.is_open() {
            open_camera(camera.as_mut(), &settings)?;
        }

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CaptureStats::default());
        let thread_name = format!("capture-{}", camera.id());

        let handle = {
            let running = running.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(thread_name)
                .spawn(move || capture_loop(camera, settings, callback, running, stats))
                .map_err(|e| RelumeError::Camera(format!("failed to spawn capture thread: {e}")))?
        };
        info!("continuous capture started");

        Ok(Self {
            running,
            stats,
            handle: Some(handle),
        })
    }

    /// Live counters for this capture session.
    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    /// `true` until [`stop`][Self::stop] is called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the thread, wait for it and hand back the released camera.
    ///
    /// Returns `None` if the capture thread panicked.
    pub fn stop(mut self) -> Option<Box<dyn Camera>> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<Box<dyn Camera>> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(camera) => {
                info!("continuous capture stopped");
                Some(camera)
            }
            Err(_) => {
                error!("capture thread panicked");
                None
            }
        }
    }
}

impl Drop for CaptureSupervisor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

/// Initialise the camera and give the sensor its warm-up period.
fn open_camera(camera: &mut dyn Camera, settings: &CameraSettings) -> Result<(), RelumeError> {
    info!(camera = camera.id(), "initialising camera");
    camera.initialize(settings)?;
    if settings.warmup_ms > 0 {
        thread::sleep(Duration::from_millis(settings.warmup_ms));
    }
    info!(
        camera = camera.id(),
        device = settings.device_id,
        width = settings.width,
        height = settings.height,
        fps = settings.fps,
        "camera ready"
    );
    Ok(())
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(1)))
}

fn capture_loop(
    mut camera: Box<dyn Camera>,
    settings: CameraSettings,
    mut callback: FrameCallback,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
) -> Box<dyn Camera> {
    let mut fail_count: u32 = 0;

    while running.load(Ordering::SeqCst) {
        let frame = match camera.capture() {
            Ok(frame) => frame,
            Err(e) => {
                fail_count += 1;
                stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(camera = camera.id(), fail_count, error = %e, "frame capture failed");
                thread::sleep(FAILURE_BACKOFF);

                if fail_count >= REINIT_THRESHOLD {
                    warn!(camera = camera.id(), "too many consecutive failures; re-initialising camera");
                    camera.release();
                    match open_camera(camera.as_mut(), &settings) {
                        Ok(()) => {
                            fail_count = 0;
                            stats.reinitializations.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => error!(camera = camera.id(), error = %e, "re-initialisation failed"),
                    }
                }
                continue;
            }
        };

        fail_count = 0;
        stats.frames.fetch_add(1, Ordering::Relaxed);
        debug!(width = frame.width, height = frame.height, "frame captured");

        if let Err(e) = callback(frame) {
            error!(camera = camera.id(), error = %e, "frame callback failed");
        }

        thread::sleep(frame_interval(settings.fps));
    }

    camera.release();
    camera
}
