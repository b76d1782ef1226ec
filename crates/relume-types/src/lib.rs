use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Motion command sent from the host tier to the controller tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Differential drive velocity set-point.
    Drive {
        linear_mps: f32,
        angular_radps: f32,
    },
    /// Bring both wheels to rest and clear the controller's integrators.
    Stop,
}

/// A [`Command`] stamped with the host's monotonically increasing sequence
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostMessage {
    pub seq: u32,
    pub command: Command,
}

/// Planar robot pose in the world frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x_m: f32,
    pub y_m: f32,
    /// Counter-clockwise from +X (radians).
    pub heading_rad: f32,
}

/// Periodic state snapshot reported by the controller tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Sequence number of the last host command applied.
    pub seq_ack: u32,
    pub pose: Pose2D,
    /// Measured wheel speeds (m/s).
    pub left_mps: f32,
    pub right_mps: f32,
    /// Duty cycles currently applied, in `[-1, 1]`.
    pub left_duty: f32,
    pub right_duty: f32,
    /// `true` while the command-timeout failsafe holds the motors.
    pub failsafe: bool,
}

/// A single IMU measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuData {
    /// Angular velocity around the vertical (Z) axis (rad/s).
    pub angular_velocity_z: f32,
    /// Linear acceleration along the robot's X axis (m/s²).
    pub linear_accel_x: f32,
    /// Linear acceleration along the robot's Y axis (m/s²).
    pub linear_accel_y: f32,
}

/// Messages flowing from the controller tier back to the host tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerReport {
    Telemetry(Telemetry),
    Fault { component: String, message: String },
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A detected target in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub centroid_x: f32,
    pub centroid_y: f32,
    pub bbox: BoundingBox,
    pub area_px: u32,
    /// Horizontal angle from the optical axis, positive to the right.
    pub bearing_rad: f32,
    /// Estimated distance, when the physical target size is known.
    pub range_m: Option<f32>,
    /// Fraction of the bounding box covered by the blob, in `(0, 1]`.
    pub confidence: f32,
}

/// Global error type spanning hardware, vision, planning and link failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelumeError {
    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Camera Error: {0}")]
    Camera(String),

    #[error("Image Error: {0}")]
    Image(String),

    #[error("Planning Error: {0}")]
    Planning(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Link Error: {0}")]
    Link(String),

    #[error("Config Error: {0}")]
    Config(String),
}
