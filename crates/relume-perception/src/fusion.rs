//! Sensor Fusion Engine.
//!
//! Dead-reckons a planar [`Pose2D`] from wheel odometry and corrects the
//! heading with the IMU gyroscope through a complementary filter.
//!
//! - **Odometry** – body velocities derived from the wheel encoders; biased
//!   by wheel slip but free of integration drift in the rate itself.
//! - **IMU** – gyroscope yaw rate; high-frequency and locally accurate.
//!
//! Each step the heading is advanced with both rates and blended:
//! ```text
//! heading' = α * (heading + ω_imu * dt) + (1 − α) * (heading + ω_odom * dt)
//! ```
//! where α ∈ [0, 1] controls how much the gyroscope is trusted.  Position is
//! then advanced along the fused heading with the odometry linear velocity.
//!
//! # Example
//!
//! ```rust
//! use relume_perception::fusion::{OdometryData, SensorFusion};
//! use relume_types::ImuData;
//!
//! let mut fusion = SensorFusion::new(0.98);
//! fusion.update_imu(ImuData { angular_velocity_z: 0.0, ..Default::default() });
//!
//! let pose = fusion.step(OdometryData { linear_mps: 0.5, angular_radps: 0.0 }, 1.0);
//! assert!((pose.x_m - 0.5).abs() < 1e-5);
//! ```

use relume_types::{ImuData, Pose2D};

/// Body-frame velocities measured by the wheel encoders.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OdometryData {
    /// Forward speed (m/s).
    pub linear_mps: f32,
    /// Yaw rate implied by the wheel speed difference (rad/s).
    pub angular_radps: f32,
}

/// Complementary filter producing a dead-reckoned [`Pose2D`].
///
/// Feed the latest gyroscope reading with [`SensorFusion::update_imu`] and
/// advance the estimate with [`SensorFusion::step`].
#[derive(Debug, Clone)]
pub struct SensorFusion {
    /// Complementary filter coefficient (0–1).  Higher values trust the IMU
    /// gyroscope more for heading estimation.
    alpha: f32,
    pose: Pose2D,
    last_imu: Option<ImuData>,
}

impl SensorFusion {
    /// Create a new fusion engine at the origin.
    ///
    /// `alpha` is clamped to `[0, 1]`.  `0.98` suits a 100 Hz control loop.
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            pose: Pose2D::default(),
            last_imu: None,
        }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Feed a new IMU measurement into the filter.
    pub fn update_imu(&mut self, data: ImuData) {
        self.last_imu = Some(data);
    }

    /// Advance the estimate by `dt` seconds (negative values count as zero)
    /// and return the new pose.
    ///
    /// Without an IMU reading the heading follows odometry alone.
    pub fn step(&mut self, odometry: OdometryData, dt: f32) -> Pose2D {
        let dt = dt.max(0.0);
        let heading = self.pose.heading_rad;

        let odom_heading = heading + odometry.angular_radps * dt;
        let fused = match &self.last_imu {
            Some(imu) => {
                let imu_heading = heading + imu.angular_velocity_z * dt;
                self.alpha * imu_heading + (1.0 - self.alpha) * odom_heading
            }
            None => odom_heading,
        };
        let fused = wrap_angle(fused);

        // Integrate along the mid-step heading.
        let mid = heading + wrap_angle(fused - heading) * 0.5;
        self.pose.x_m += odometry.linear_mps * mid.cos() * dt;
        self.pose.y_m += odometry.linear_mps * mid.sin() * dt;
        self.pose.heading_rad = fused;
        self.pose
    }

    pub fn pose(&self) -> Pose2D {
        self.pose
    }

    /// Re-seed the estimate, e.g. from an external localisation fix.
    pub fn reset(&mut self, pose: Pose2D) {
        self.pose = Pose2D {
            heading_rad: wrap_angle(pose.heading_rad),
            ..pose
        };
    }
}

/// Wrap an angle into `(-π, π]`.
pub fn wrap_angle(a: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    let mut a = a.rem_euclid(TAU);
    if a > PI {
        a -= TAU;
    }
    a
}
