//! `Motor` and `Imu` traits for the controller tier's drive hardware.
//!
//! Drivers implement these traits and register with a
//! [`DriveRegistry`][crate::registry::DriveRegistry].  The control loop only
//! ever talks to the traits, so drivers can be swapped without touching the
//! PID or odometry code.

use relume_types::{ImuData, RelumeError};

/// A velocity-controlled wheel motor with an encoder.
pub trait Motor: Send {
    /// Stable identifier for this motor, e.g. `"drive_left"`.
    fn id(&self) -> &str;

    /// Apply a duty cycle in `[-1, 1]`.  Values outside the range are
    /// clamped by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`RelumeError::HardwareFault`] if the command cannot be applied
    /// (e.g. the driver reports a fault).
    fn set_output(&mut self, duty: f32) -> Result<(), RelumeError>;

    /// The duty cycle most recently applied.
    fn output(&self) -> f32;

    /// Read the encoder and return the wheel's surface speed (m/s) averaged
    /// over the last `dt` seconds.
    fn sample_velocity(&mut self, dt: f32) -> Result<f32, RelumeError>;
}

/// An inertial measurement unit.
pub trait Imu: Send {
    fn id(&self) -> &str;

    /// Return the latest measurement.
    fn read(&mut self) -> Result<ImuData, RelumeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-process motor used only for tests.
    struct MockMotor {
        id: String,
        duty: f32,
    }

    impl Motor for MockMotor {
        fn id(&self) -> &str {
            &self.id
        }

        fn set_output(&mut self, duty: f32) -> Result<(), RelumeError> {
            self.duty = duty;
            Ok(())
        }

        fn output(&self) -> f32 {
            self.duty
        }

        fn sample_velocity(&mut self, _dt: f32) -> Result<f32, RelumeError> {
            Ok(self.duty * 2.0)
        }
    }

    #[test]
    fn mock_motor_set_and_sample() {
        let mut motor = MockMotor {
            id: "drive_left".to_string(),
            duty: 0.0,
        };
        assert_eq!(motor.id(), "drive_left");
        motor.set_output(0.25).unwrap();
        assert!((motor.output() - 0.25).abs() < f32::EPSILON);
        assert!((motor.sample_velocity(0.01).unwrap() - 0.5).abs() < f32::EPSILON);
    }
}
