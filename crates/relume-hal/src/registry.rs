//! [`DriveRegistry`] – motor driver registry and differential-drive mapping.
//!
//! The registry stores every registered [`Motor`] and an optional [`Imu`].
//! The controller loop addresses the two drive wheels by the well-known
//! identifiers [`LEFT_WHEEL`] and [`RIGHT_WHEEL`].
//!
//! # Differential-drive mapping
//!
//! A body velocity `(v, ω)` is decomposed into wheel surface speeds with
//! [`DriveKinematics::wheel_targets`]:
//!
//! ```text
//! left  = v − ω · b / 2
//! right = v + ω · b / 2
//! ```
//!
//! where `b` is the track width.  Both targets are clamped to the wheel's
//! maximum speed.

use std::collections::HashMap;

use relume_types::{ImuData, RelumeError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::motor::{Imu, Motor};

/// Identifier of the left drive wheel motor.
pub const LEFT_WHEEL: &str = "drive_left";
/// Identifier of the right drive wheel motor.
pub const RIGHT_WHEEL: &str = "drive_right";

/// Geometry and speed limits of a differential-drive base.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveKinematics {
    /// Distance between the wheel contact points (m).
    pub track_width_m: f32,
    /// Maximum wheel surface speed (m/s).
    pub max_wheel_mps: f32,
}

impl Default for DriveKinematics {
    fn default() -> Self {
        Self {
            track_width_m: 0.3,
            max_wheel_mps: 1.0,
        }
    }
}

impl DriveKinematics {
    /// Decompose `(v, ω)` into clamped `(left, right)` wheel speeds.
    pub fn wheel_targets(&self, linear_mps: f32, angular_radps: f32) -> (f32, f32) {
        let half = angular_radps * self.track_width_m * 0.5;
        let max = self.max_wheel_mps.abs();
        (
            (linear_mps - half).clamp(-max, max),
            (linear_mps + half).clamp(-max, max),
        )
    }

    /// Recover `(v, ω)` from measured wheel speeds.
    pub fn body_velocity(&self, left_mps: f32, right_mps: f32) -> (f32, f32) {
        let v = 0.5 * (left_mps + right_mps);
        let w = if self.track_width_m.abs() > f32::EPSILON {
            (right_mps - left_mps) / self.track_width_m
        } else {
            0.0
        };
        (v, w)
    }
}

/// Central motor driver registry.
#[derive(Default)]
pub struct DriveRegistry {
    motors: HashMap<String, Box<dyn Motor>>,
    imu: Option<Box<dyn Imu>>,
}

impl std::fmt::Debug for DriveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.motors.keys().collect();
        ids.sort();
        f.debug_struct("DriveRegistry")
            .field("motors", &ids)
            .field("imu", &self.imu.as_ref().map(|i| i.id().to_string()))
            .finish()
    }
}

impl DriveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a motor driver.  Any previously registered driver with the
    /// same `id` is replaced.
    pub fn register_motor(&mut self, motor: Box<dyn Motor>) {
        self.motors.insert(motor.id().to_string(), motor);
    }

    /// Register the IMU, replacing any previous one.
    pub fn register_imu(&mut self, imu: Box<dyn Imu>) {
        self.imu = Some(imu);
    }

    /// `true` when both drive wheels are registered.
    pub fn has_drive_base(&self) -> bool {
        self.motors.contains_key(LEFT_WHEEL) && self.motors.contains_key(RIGHT_WHEEL)
    }

    /// Apply duty cycles to the two drive wheels, clamped to `[-1, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`RelumeError::HardwareFault`] when a wheel is not registered
    /// or its driver rejects the command.
    pub fn set_drive_outputs(&mut self, left: f32, right: f32) -> Result<(), RelumeError> {
        self.motor_mut(LEFT_WHEEL)?.set_output(left.clamp(-1.0, 1.0))?;
        self.motor_mut(RIGHT_WHEEL)?.set_output(right.clamp(-1.0, 1.0))?;
        Ok(())
    }

    /// Duty cycles currently applied to `(left, right)`.
    pub fn drive_outputs(&self) -> (f32, f32) {
        let get = |id: &str| self.motors.get(id).map_or(0.0, |m| m.output());
        (get(LEFT_WHEEL), get(RIGHT_WHEEL))
    }

    /// Sample `(left, right)` wheel speeds over the last `dt` seconds.
    pub fn sample_drive(&mut self, dt: f32) -> Result<(f32, f32), RelumeError> {
        let left = self.motor_mut(LEFT_WHEEL)?.sample_velocity(dt)?;
        let right = self.motor_mut(RIGHT_WHEEL)?.sample_velocity(dt)?;
        Ok((left, right))
    }

    /// Read the IMU, if one is registered.
    pub fn read_imu(&mut self) -> Result<Option<ImuData>, RelumeError> {
        match self.imu.as_mut() {
            Some(imu) => imu.read().map(Some),
            None => Ok(None),
        }
    }

    /// Command zero duty on every registered motor.
    ///
    /// Every motor is attempted even when an earlier one fails; the first
    /// error is returned.
    pub fn stop_all(&mut self) -> Result<(), RelumeError> {
        let mut first_err = None;
        for (id, motor) in self.motors.iter_mut() {
            if let Err(e) = motor.set_output(0.0) {
                warn!(motor = %id, error = %e, "failed to stop motor");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn motor_mut(&mut self, id: &str) -> Result<&mut Box<dyn Motor>, RelumeError> {
        self.motors.get_mut(id).ok_or_else(|| RelumeError::HardwareFault {
            component: id.to_string(),
            details: format!("motor '{id}' is not registered"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockMotor {
        id: String,
        duty: f32,
        broken: bool,
    }

    impl MockMotor {
        fn new(id: &str) -> Box<Self> {
            Box::new(Self {
                id: id.to_string(),
                duty: 0.0,
                broken: false,
            })
        }

        fn broken(id: &str) -> Box<Self> {
            Box::new(Self {
                id: id.to_string(),
                duty: 0.3,
                broken: true,
            })
        }
    }

    impl Motor for MockMotor {
        fn id(&self) -> &str {
            &self.id
        }
        fn set_output(&mut self, duty: f32) -> Result<(), RelumeError> {
            if self.broken {
                return Err(RelumeError::HardwareFault {
                    component: self.id.clone(),
                    details: "driver fault".to_string(),
                });
            }
            self.duty = duty;
            Ok(())
        }
        fn output(&self) -> f32 {
            self.duty
        }
        fn sample_velocity(&mut self, _dt: f32) -> Result<f32, RelumeError> {
            Ok(self.duty)
        }
    }

    fn drive_base() -> DriveRegistry {
        let mut registry = DriveRegistry::new();
        registry.register_motor(MockMotor::new(LEFT_WHEEL));
        registry.register_motor(MockMotor::new(RIGHT_WHEEL));
        registry
    }

    #[test]
    fn straight_line_drives_both_wheels_equally() {
        let k = DriveKinematics::default();
        let (l, r) = k.wheel_targets(0.5, 0.0);
        assert!((l - 0.5).abs() < f32::EPSILON);
        assert!((r - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn turn_in_place_counter_rotates_wheels() {
        let k = DriveKinematics {
            track_width_m: 0.4,
            max_wheel_mps: 1.0,
        };
        // ω = 1 rad/s, b = 0.4 → ±0.2 m/s
        let (l, r) = k.wheel_targets(0.0, 1.0);
        assert!((l - -0.2).abs() < 1e-6);
        assert!((r - 0.2).abs() < 1e-6);
        let (v, w) = k.body_velocity(l, r);
        assert!(v.abs() < 1e-6);
        assert!((w - 1.0).abs() < 1e-5);
    }

    #[test]
    fn wheel_targets_are_saturated() {
        let k = DriveKinematics {
            track_width_m: 0.3,
            max_wheel_mps: 0.8,
        };
        let (l, r) = k.wheel_targets(5.0, 0.0);
        assert_eq!((l, r), (0.8, 0.8));
    }

    #[test]
    fn drive_outputs_are_clamped_and_recorded() {
        let mut registry = drive_base();
        assert!(registry.has_drive_base());
        registry.set_drive_outputs(1.5, -0.25).unwrap();
        assert_eq!(registry.drive_outputs(), (1.0, -0.25));
        assert_eq!(registry.sample_drive(0.01).unwrap(), (1.0, -0.25));
    }

    #[test]
    fn missing_wheel_is_a_hardware_fault() {
        let mut registry = DriveRegistry::new();
        registry.register_motor(MockMotor::new(LEFT_WHEEL));
        assert!(!registry.has_drive_base());
        let err = registry.set_drive_outputs(0.1, 0.1).unwrap_err();
        assert!(matches!(err, RelumeError::HardwareFault { ref component, .. } if component == RIGHT_WHEEL));
    }

    #[test]
    fn stop_all_zeroes_every_motor_and_reports_failures() {
        let mut registry = drive_base();
        registry.register_motor(MockMotor::broken("winch"));
        registry.set_drive_outputs(0.5, 0.5).unwrap();

        let result = registry.stop_all();
        assert!(result.is_err(), "broken winch must surface");
        assert_eq!(registry.drive_outputs(), (0.0, 0.0));
    }

    #[test]
    fn read_imu_without_imu_is_none() {
        let mut registry = drive_base();
        assert_eq!(registry.read_imu().unwrap(), None);
    }
}
