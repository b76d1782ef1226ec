//! [`ControllerLoop`] – the controller tier's fixed-period control cycle.
//!
//! Each tick:
//!
//! 1. **Receive** – apply the newest [`HostMessage`] (older ones in the same
//!    tick are superseded) and feed the command watchdog.
//! 2. **Guard** – when no command has arrived for `command_timeout_ms` the
//!    failsafe engages: targets are zeroed, integrators reset, motors stopped
//!    and one [`ControllerReport::Fault`] is emitted.
//! 3. **Sense** – sample both wheel encoders and the IMU.
//! 4. **Estimate** – fuse odometry and yaw rate into a [`Pose2D`].
//! 5. **Act** – one PID per wheel turns the speed error into a duty cycle.
//! 6. **Report** – every `telemetry_every` ticks a [`Telemetry`] snapshot.
//!
//! [`ControllerLoop::step`] is synchronous and hardware-agnostic;
//! [`ControllerLoop::run`] drives it from a Tokio interval over a link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use relume_hal::pid::{PidController, PidGains};
use relume_hal::registry::{DriveKinematics, DriveRegistry};
use relume_link::{LinkRx, LinkTx};
use relume_perception::fusion::{OdometryData, SensorFusion};
use relume_types::{Command, ControllerReport, HostMessage, Pose2D, RelumeError, Telemetry};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::watchdog::{ComponentHealth, Watchdog};

/// Watchdog id for the host command stream.
pub const HOST_COMMANDS: &str = "host_commands";

/// Component named in faults raised by the drive hardware.
const DRIVE_COMPONENT: &str = "drive_base";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub period_ms: u64,
    pub command_timeout_ms: u64,
    /// Send telemetry every this many ticks.
    pub telemetry_every: u32,
    /// Complementary filter coefficient for heading fusion.
    pub fusion_alpha: f32,
    pub pid: PidGains,
    pub kinematics: DriveKinematics,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            period_ms: 10,
            command_timeout_ms: 500,
            telemetry_every: 10,
            fusion_alpha: 0.98,
            pid: PidGains::default(),
            kinematics: DriveKinematics::default(),
        }
    }
}

impl ControllerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

pub struct ControllerLoop {
    config: ControllerConfig,
    registry: DriveRegistry,
    left_pid: PidController,
    right_pid: PidController,
    fusion: SensorFusion,
    watchdog: Watchdog,
    targets: (f32, f32),
    measured: (f32, f32),
    last_seq: Option<u32>,
    ticks: u64,
    failsafe: bool,
    hardware_fault: bool,
}

impl std::fmt::Debug for ControllerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerLoop")
            .field("registry", &self.registry)
            .field("targets", &self.targets)
            .field("last_seq", &self.last_seq)
            .field("failsafe", &self.failsafe)
            .finish_non_exhaustive()
    }
}

impl ControllerLoop {
    /// Build the loop around a registry holding both drive wheels.
    ///
    /// # Errors
    ///
    /// [`RelumeError::HardwareFault`] when a drive wheel is missing.
    pub fn new(config: ControllerConfig, registry: DriveRegistry) -> Result<Self, RelumeError> {
        if !registry.has_drive_base() {
            return Err(RelumeError::HardwareFault {
                component: DRIVE_COMPONENT.to_string(),
                details: "both drive wheels must be registered".to_string(),
            });
        }
        let make_pid = || {
            let mut pid = PidController::new(config.pid);
            pid.set_output_limits(-1.0, 1.0);
            pid
        };
        let mut watchdog = Watchdog::new();
        watchdog.register(HOST_COMMANDS, Duration::from_millis(config.command_timeout_ms));
        Ok(Self {
            left_pid: make_pid(),
            right_pid: make_pid(),
            fusion: SensorFusion::new(config.fusion_alpha),
            watchdog,
            registry,
            targets: (0.0, 0.0),
            measured: (0.0, 0.0),
            last_seq: None,
            ticks: 0,
            failsafe: false,
            hardware_fault: false,
            config,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn pose(&self) -> Pose2D {
        self.fusion.pose()
    }

    /// Current `(left, right)` wheel speed targets.
    pub fn targets(&self) -> (f32, f32) {
        self.targets
    }

    pub fn failsafe(&self) -> bool {
        self.failsafe
    }

    pub fn registry(&self) -> &DriveRegistry {
        &self.registry
    }

    /// Snapshot of the loop state.
    pub fn telemetry(&self) -> Telemetry {
        let (left_duty, right_duty) = self.registry.drive_outputs();
        Telemetry {
            seq_ack: self.last_seq.unwrap_or(0),
            pose: self.fusion.pose(),
            left_mps: self.measured.0,
            right_mps: self.measured.1,
            left_duty,
            right_duty,
            failsafe: self.failsafe,
        }
    }

    /// Run one control cycle covering `dt` of wall time, applying the newest
    /// of `messages`.  Returns the reports to send to the host.
    #[instrument(name = "controller_step", level = "debug", skip_all, fields(tick = self.ticks))]
    pub fn step(&mut self, dt: Duration, messages: impl IntoIterator<Item = HostMessage>) -> Vec<ControllerReport> {
        let mut reports = Vec::new();
        let dt_s = dt.as_secs_f32();

        // ── 1. Receive ─────────────────────────────────────────────────────────
        let mut newest = None;
        for msg in messages {
            if let Some(prev) = self.last_seq {
                if msg.seq != prev.wrapping_add(1) {
                    debug!(expected = prev.wrapping_add(1), got = msg.seq, "command sequence gap");
                }
            }
            self.last_seq = Some(msg.seq);
            newest = Some(msg);
        }
        if let Some(msg) = newest {
            self.watchdog.heartbeat(HOST_COMMANDS);
            self.apply_command(msg.command);
        }
        self.watchdog.advance(dt);

        // ── 2. Guard ───────────────────────────────────────────────────────────
        if !self.failsafe && self.watchdog.health(HOST_COMMANDS) == ComponentHealth::TimedOut {
            self.engage_failsafe(&mut reports);
        }

        // ── 3. Sense ───────────────────────────────────────────────────────────
        let sensed = self.registry.sample_drive(dt_s).and_then(|wheels| {
            let imu = self.registry.read_imu()?;
            Ok((wheels, imu))
        });
        let ((left, right), imu) = match sensed {
            Ok(v) => v,
            Err(e) => {
                self.handle_hardware_error(e, &mut reports);
                self.ticks += 1;
                return reports;
            }
        };
        self.measured = (left, right);

        // ── 4. Estimate ────────────────────────────────────────────────────────
        if let Some(imu) = imu {
            self.fusion.update_imu(imu);
        }
        let (linear_mps, angular_radps) = self.config.kinematics.body_velocity(left, right);
        self.fusion.step(
            OdometryData {
                linear_mps,
                angular_radps,
            },
            dt_s,
        );

        // ── 5. Act ─────────────────────────────────────────────────────────────
        let (left_duty, right_duty) = if self.failsafe {
            (0.0, 0.0)
        } else {
            self.left_pid.set_set_point(self.targets.0);
            self.right_pid.set_set_point(self.targets.1);
            (self.left_pid.update(left, dt_s), self.right_pid.update(right, dt_s))
        };
        match self.registry.set_drive_outputs(left_duty, right_duty) {
            Ok(()) => {
                if self.hardware_fault {
                    info!("drive hardware recovered");
                    self.hardware_fault = false;
                }
            }
            Err(e) => self.handle_hardware_error(e, &mut reports),
        }

        // ── 6. Report ──────────────────────────────────────────────────────────
        self.ticks += 1;
        if self.ticks % u64::from(self.config.telemetry_every.max(1)) == 0 {
            reports.push(ControllerReport::Telemetry(self.telemetry()));
        }
        reports
    }

    fn apply_command(&mut self, command: Command) {
        if self.failsafe {
            info!("host commands resumed, failsafe released");
            self.failsafe = false;
        }
        match command {
            Command::Drive {
                linear_mps,
                angular_radps,
            } => {
                self.targets = self.config.kinematics.wheel_targets(linear_mps, angular_radps);
            }
            Command::Stop => {
                self.targets = (0.0, 0.0);
                self.left_pid.reset();
                self.right_pid.reset();
            }
        }
    }

    fn engage_failsafe(&mut self, reports: &mut Vec<ControllerReport>) {
        let timeout = self.config.command_timeout_ms;
        warn!(timeout_ms = timeout, "no host command received, failsafe engaged");
        self.failsafe = true;
        self.targets = (0.0, 0.0);
        self.left_pid.reset();
        self.right_pid.reset();
        if let Err(e) = self.registry.stop_all() {
            error!(error = %e, "failed to stop motors on failsafe");
        }
        reports.push(ControllerReport::Fault {
            component: HOST_COMMANDS.to_string(),
            message: format!("no command for {timeout} ms, motors stopped"),
        });
    }

    fn handle_hardware_error(&mut self, e: RelumeError, reports: &mut Vec<ControllerReport>) {
        if let Err(stop_err) = self.registry.stop_all() {
            error!(error = %stop_err, "failed to stop motors after hardware error");
        }
        self.left_pid.reset();
        self.right_pid.reset();
        if self.hardware_fault {
            debug!(error = %e, "drive hardware still failing");
            return;
        }
        self.hardware_fault = true;
        error!(error = %e, "drive hardware fault, motors stopped");
        let component = match &e {
            RelumeError::HardwareFault { component, .. } => component.clone(),
            _ => DRIVE_COMPONENT.to_string(),
        };
        reports.push(ControllerReport::Fault {
            component,
            message: e.to_string(),
        });
    }

    /// Drive [`step`][Self::step] from a fixed-period interval until
    /// `shutdown` is set, or until the host link has closed and the failsafe
    /// has stopped the motors.
    pub async fn run(
        &mut self,
        tx: &mut LinkTx<ControllerReport>,
        rx: &mut LinkRx<HostMessage>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), RelumeError> {
        let period = self.config.period();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_millis() as u64, "controller loop started");

        let mut last = Instant::now();
        let mut link_open = true;
        while !shutdown.load(Ordering::Relaxed) {
            interval.tick().await;
            let now = Instant::now();
            let dt = now.duration_since(last);
            last = now;

            let messages = if link_open {
                rx.drain().unwrap_or_else(|e| {
                    warn!(error = %e, "host link closed");
                    link_open = false;
                    Vec::new()
                })
            } else {
                Vec::new()
            };

            for report in self.step(dt, messages) {
                if !link_open {
                    break;
                }
                if let Err(e) = tx.send(&report).await {
                    warn!(error = %e, "failed to send report");
                }
            }

            if !link_open && self.failsafe {
                break;
            }
        }

        self.registry.stop_all()?;
        info!(ticks = self.ticks, "controller loop stopped");
        Ok(())
    }
}
