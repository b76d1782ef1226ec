//! `relume-hal` – Hardware Abstraction Layer
//!
//! Every piece of hardware the two tiers touch sits behind a trait so the
//! perception and control code never depends on a concrete driver.
//!
//! # Modules
//!
//! - [`camera`] – [`Camera`][camera::Camera] trait, [`CameraFrame`][camera::CameraFrame],
//!   [`CameraSettings`][camera::CameraSettings] and typed runtime
//!   [`CameraParam`][camera::CameraParam]s.
//! - [`capture`] – [`CaptureSupervisor`][capture::CaptureSupervisor]: continuous
//!   capture thread with failure counting and automatic re-initialisation.
//! - [`motor`] – [`Motor`][motor::Motor] and [`Imu`][motor::Imu] traits.
//! - [`pid`] – [`PidController`][pid::PidController] with output saturation
//!   and integral anti-windup.
//! - [`registry`] – [`DriveRegistry`][registry::DriveRegistry] and
//!   differential-drive [`DriveKinematics`][registry::DriveKinematics].
//! - [`sim`] – simulated world, motors, IMU and camera for CI and `relume sim`.
//! - [`replay`] – [`DirectoryCamera`][replay::DirectoryCamera]: replays
//!   recorded frames.
//! - [`pnm`] – binary PGM/PPM frame files.

pub mod camera;
pub mod capture;
pub mod motor;
pub mod pid;
pub mod pnm;
pub mod registry;
pub mod replay;
pub mod sim;

pub use camera::{Camera, CameraFrame, CameraParam, CameraSettings};
pub use capture::CaptureSupervisor;
pub use motor::{Imu, Motor};
pub use pid::{PidController, PidGains};
pub use registry::{DriveKinematics, DriveRegistry};
