//! PID (Proportional–Integral–Derivative) wheel-speed controller.
//!
//! The controller computes a corrective duty cycle that drives a measured
//! wheel speed toward its set-point.  It is hardware-agnostic: the caller
//! supplies the measurement and elapsed time and applies the output to a
//! [`Motor`][crate::motor::Motor].
//!
//! # Example
//!
//! ```rust
//! use relume_hal::pid::{PidController, PidGains};
//!
//! let mut pid = PidController::new(PidGains { kp: 1.0, ki: 0.1, kd: 0.05 });
//! pid.set_output_limits(-1.0, 1.0);
//! pid.set_set_point(0.5); // m/s
//!
//! let duty = pid.update(0.0, 0.01); // measurement=0, dt=10 ms
//! assert!(duty > 0.0 && duty <= 1.0);
//! ```

use serde::{Deserialize, Serialize};

/// Proportional, integral and derivative gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    /// Gains tuned for the simulated drive base (duty per m/s of error).
    fn default() -> Self {
        Self {
            kp: 1.2,
            ki: 4.0,
            kd: 0.0,
        }
    }
}

/// A tunable PID controller for closed-loop feedback control.
#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    set_point: f32,
    integral: f32,
    last_error: Option<f32>,
    output_min: f32,
    output_max: f32,
}

impl PidController {
    /// Create a new controller with the given gains.
    ///
    /// Output is unclamped by default (`f32::NEG_INFINITY` to `f32::INFINITY`).
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            set_point: 0.0,
            integral: 0.0,
            last_error: None,
            output_min: f32::NEG_INFINITY,
            output_max: f32::INFINITY,
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn set_set_point(&mut self, set_point: f32) {
        self.set_point = set_point;
    }

    pub fn set_point(&self) -> f32 {
        self.set_point
    }

    /// Clamp the controller output to `[min, max]`.
    ///
    /// The integral contribution is held inside the same range, and the
    /// accumulator stops integrating while the output is saturated in the
    /// direction the error pushes it.
    pub fn set_output_limits(&mut self, min: f32, max: f32) {
        self.output_min = min.min(max);
        self.output_max = max.max(min);
    }

    /// Compute the next controller output.
    ///
    /// Returns `0.0` without touching internal state if `dt` is not positive.
    pub fn update(&mut self, measurement: f32, dt: f32) -> f32 {
        if dt <= 0.0 {
            return 0.0;
        }
        let PidGains { kp, ki, kd } = self.gains;
        let error = self.set_point - measurement;

        let p = kp * error;

        let d = match self.last_error {
            Some(prev) => kd * (error - prev) / dt,
            None => 0.0,
        };
        self.last_error = Some(error);

        // Integral clamping: ki * integral stays inside the output range.
        let held = self.integral;
        self.integral += error * dt;
        let mut i = self.clamped_integral_term();
        let raw = p + i + d;
        let pushes_up = raw > self.output_max && ki * error > 0.0;
        let pushes_down = raw < self.output_min && ki * error < 0.0;
        if pushes_up || pushes_down {
            // Conditional integration: hold the accumulator while saturated.
            self.integral = held;
            i = self.clamped_integral_term();
        }

        (p + i + d).clamp(self.output_min, self.output_max)
    }

    fn clamped_integral_term(&mut self) -> f32 {
        let ki = self.gains.ki;
        let i = (ki * self.integral).clamp(self.output_min, self.output_max);
        if ki.abs() > f32::EPSILON {
            self.integral = i / ki;
        }
        i
    }

    /// Reset the integral accumulator and derivative memory.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }
}
