//! In-process simulated drivers for CI and the `relume sim` command.
//!
//! [`SimWorld`] holds the ground-truth state of a differential-drive robot:
//! two first-order wheel plants and the integrated pose.  [`SimMotor`],
//! [`SimImu`] and [`SimCamera`] are views onto that world, so commands sent
//! to the motors move the robot and change what the camera sees.
//!
//! # Example
//!
//! ```rust
//! use relume_hal::registry::DriveKinematics;
//! use relume_hal::sim::{SimDriveBase, SimWorld};
//!
//! let world = SimWorld::new(DriveKinematics::default());
//! let mut registry = SimDriveBase::new(world.clone()).build();
//!
//! registry.set_drive_outputs(0.5, 0.5).expect("sim drive must succeed");
//! for _ in 0..100 {
//!     registry.sample_drive(0.01).unwrap();
//! }
//! assert!(world.pose().x_m > 0.0);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use relume_types::{ImuData, Pose2D, RelumeError};

use crate::camera::{Camera, CameraFrame, CameraParam, CameraSettings};
use crate::motor::{Imu, Motor};
use crate::registry::{DriveKinematics, DriveRegistry, LEFT_WHEEL, RIGHT_WHEEL};

// ────────────────────────────────────────────────────────────────────────────
// World state
// ────────────────────────────────────────────────────────────────────────────

/// Which side of the drive base a wheel sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelSide {
    Left,
    Right,
}

#[derive(Debug, Default)]
struct WorldState {
    pose: Pose2D,
    left_mps: f32,
    right_mps: f32,
    left_duty: f32,
    right_duty: f32,
}

/// Shared ground truth for all simulated drivers.  Clones share state.
#[derive(Debug, Clone)]
pub struct SimWorld {
    kinematics: DriveKinematics,
    /// Wheel response time constant (s).
    time_constant_s: f32,
    state: Arc<Mutex<WorldState>>,
}

impl SimWorld {
    pub fn new(kinematics: DriveKinematics) -> Self {
        Self {
            kinematics,
            time_constant_s: 0.1,
            state: Arc::new(Mutex::new(WorldState::default())),
        }
    }

    /// Override the wheel time constant (clamped to at least 1 ms).
    pub fn with_time_constant(mut self, seconds: f32) -> Self {
        self.time_constant_s = seconds.max(0.001);
        self
    }

    pub fn kinematics(&self) -> DriveKinematics {
        self.kinematics
    }

    /// Ground-truth pose.
    pub fn pose(&self) -> Pose2D {
        self.lock().pose
    }

    pub fn set_pose(&self, pose: Pose2D) {
        self.lock().pose = pose;
    }

    /// Ground-truth `(left, right)` wheel speeds.
    pub fn wheel_speeds(&self) -> (f32, f32) {
        let s = self.lock();
        (s.left_mps, s.right_mps)
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_duty(&self, side: WheelSide, duty: f32) {
        let mut s = self.lock();
        match side {
            WheelSide::Left => s.left_duty = duty,
            WheelSide::Right => s.right_duty = duty,
        }
    }

    fn duty(&self, side: WheelSide) -> f32 {
        let s = self.lock();
        match side {
            WheelSide::Left => s.left_duty,
            WheelSide::Right => s.right_duty,
        }
    }

    /// Advance one wheel's plant by `dt` and fold its displacement into the
    /// pose.  The pose update is linear in each wheel's displacement, so the
    /// two wheels can be stepped independently.
    fn step_wheel(&self, side: WheelSide, dt: f32) -> f32 {
        let dt = dt.max(0.0);
        let tau = self.time_constant_s;
        let max = self.kinematics.max_wheel_mps;
        let b = self.kinematics.track_width_m;
        let mut s = self.lock();

        let (speed, duty) = match side {
            WheelSide::Left => (s.left_mps, s.left_duty),
            WheelSide::Right => (s.right_mps, s.right_duty),
        };
        let alpha = (dt / tau).min(1.0);
        let next = speed + (duty * max - speed) * alpha;
        let ds = next * dt;

        let (sign, new_speed) = match side {
            WheelSide::Left => {
                s.left_mps = next;
                (-1.0, next)
            }
            WheelSide::Right => {
                s.right_mps = next;
                (1.0, next)
            }
        };
        let heading = s.pose.heading_rad;
        s.pose.x_m += 0.5 * ds * heading.cos();
        s.pose.y_m += 0.5 * ds * heading.sin();
        if b.abs() > f32::EPSILON {
            s.pose.heading_rad = wrap_angle(heading + sign * ds / b);
        }
        new_speed
    }
}

/// Wrap an angle into `(-π, π]`.
fn wrap_angle(a: f32) -> f32 {
    let two_pi = std::f32::consts::TAU;
    let mut a = a % two_pi;
    if a > std::f32::consts::PI {
        a -= two_pi;
    } else if a <= -std::f32::consts::PI {
        a += two_pi;
    }
    a
}

// ────────────────────────────────────────────────────────────────────────────
// Motors and IMU
// ────────────────────────────────────────────────────────────────────────────

/// A simulated wheel motor: duty drives a first-order speed response.
#[derive(Debug)]
pub struct SimMotor {
    id: String,
    side: WheelSide,
    world: SimWorld,
}

impl SimMotor {
    pub fn new(id: impl Into<String>, side: WheelSide, world: SimWorld) -> Box<Self> {
        Box::new(Self {
            id: id.into(),
            side,
            world,
        })
    }
}

impl Motor for SimMotor {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_output(&mut self, duty: f32) -> Result<(), RelumeError> {
        self.world.set_duty(self.side, duty.clamp(-1.0, 1.0));
        Ok(())
    }

    fn output(&self) -> f32 {
        self.world.duty(self.side)
    }

    fn sample_velocity(&mut self, dt: f32) -> Result<f32, RelumeError> {
        Ok(self.world.step_wheel(self.side, dt))
    }
}

/// A simulated gyro reporting the yaw rate implied by the wheel speeds.
#[derive(Debug)]
pub struct SimImu {
    world: SimWorld,
}

impl SimImu {
    pub fn new(world: SimWorld) -> Box<Self> {
        Box::new(Self { world })
    }
}

impl Imu for SimImu {
    fn id(&self) -> &str {
        "sim_imu"
    }

    fn read(&mut self) -> Result<ImuData, RelumeError> {
        let (l, r) = self.world.wheel_speeds();
        let (_, w) = self.world.kinematics().body_velocity(l, r);
        Ok(ImuData {
            angular_velocity_z: w,
            ..ImuData::default()
        })
    }
}

/// Builder for a [`DriveRegistry`] backed by a [`SimWorld`].
#[derive(Debug)]
pub struct SimDriveBase {
    world: SimWorld,
    with_imu: bool,
}

impl SimDriveBase {
    pub fn new(world: SimWorld) -> Self {
        Self {
            world,
            with_imu: true,
        }
    }

    /// Leave the IMU out (odometry-only heading).
    pub fn without_imu(mut self) -> Self {
        self.with_imu = false;
        self
    }

    pub fn build(self) -> DriveRegistry {
        let mut registry = DriveRegistry::new();
        registry.register_motor(SimMotor::new(LEFT_WHEEL, WheelSide::Left, self.world.clone()));
        registry.register_motor(SimMotor::new(RIGHT_WHEEL, WheelSide::Right, self.world.clone()));
        if self.with_imu {
            registry.register_imu(SimImu::new(self.world));
        }
        registry
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Camera
// ────────────────────────────────────────────────────────────────────────────

/// A round, bright target placed in the simulated world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimTarget {
    pub x_m: f32,
    pub y_m: f32,
    pub diameter_m: f32,
}

#[derive(Debug, Clone)]
enum Scene {
    /// Disc fixed in the image: centre as a fraction of the frame, radius in
    /// pixels plus a fraction of the frame width.
    Fixed {
        cx: f32,
        cy: f32,
        radius_px: f32,
        radius_frac: f32,
    },
    /// Disc projected from a world target through a forward pinhole camera.
    World {
        world: SimWorld,
        target: SimTarget,
        hfov_rad: f32,
    },
    Empty,
}

const BACKGROUND: u8 = 30;
const NOISE_AMPLITUDE: u32 = 8;
const TARGET_RGB: [u8; 3] = [255, 255, 255];
const DEFAULT_RADIUS_FRAC: f32 = 0.05;

/// A simulated camera rendering a bright disc on a dark, noisy background.
///
/// Scripted faults are available for exercising capture recovery:
/// [`with_failures`][Self::with_failures] makes the first `n` captures fail
/// and [`failing_to_open`][Self::failing_to_open] makes every
/// `initialize` call fail.
#[derive(Debug)]
pub struct SimCamera {
    id: String,
    open: bool,
    width: u32,
    height: u32,
    frame_index: u32,
    failures_remaining: u32,
    fail_open: bool,
    scene: Scene,
}

impl SimCamera {
    /// A camera looking at a disc centred in the frame whose radius is 5 % of
    /// the frame width, so the apparent size is resolution independent.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            open: false,
            width: 0,
            height: 0,
            frame_index: 0,
            failures_remaining: 0,
            fail_open: false,
            scene: Scene::Fixed {
                cx: 0.5,
                cy: 0.5,
                radius_px: 0.0,
                radius_frac: DEFAULT_RADIUS_FRAC,
            },
        }
    }

    /// Place the disc at `(cx, cy)` (fractions of the frame) with
    /// `radius_px`.
    pub fn with_fixed_target(mut self, cx: f32, cy: f32, radius_px: f32) -> Self {
        self.scene = Scene::Fixed {
            cx,
            cy,
            radius_px,
            radius_frac: 0.0,
        };
        self
    }

    /// Render nothing but background.
    pub fn with_empty_scene(mut self) -> Self {
        self.scene = Scene::Empty;
        self
    }

    /// Render `target` as seen from the robot pose held by `world`.
    pub fn observing(mut self, world: SimWorld, target: SimTarget, hfov_deg: f32) -> Self {
        self.scene = Scene::World {
            world,
            target,
            hfov_rad: hfov_deg.to_radians(),
        };
        self
    }

    /// Make the next `n` captures fail.
    pub fn with_failures(mut self, n: u32) -> Self {
        self.failures_remaining = n;
        self
    }

    /// Make every `initialize` call fail.
    pub fn failing_to_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Disc centre and radius in pixels for the current scene, if visible.
    fn disc(&self) -> Option<(f32, f32, f32)> {
        let (w, h) = (self.width as f32, self.height as f32);
        match &self.scene {
            Scene::Fixed {
                cx,
                cy,
                radius_px,
                radius_frac,
            } => Some((cx * w, cy * h, radius_px + radius_frac * w)),
            Scene::Empty => None,
            Scene::World {
                world,
                target,
                hfov_rad,
            } => {
                let pose = world.pose();
                let dx = target.x_m - pose.x_m;
                let dy = target.y_m - pose.y_m;
                let range = (dx * dx + dy * dy).sqrt();
                // Positive bearing is to the right, i.e. clockwise.
                let bearing = wrap_angle(pose.heading_rad - dy.atan2(dx));
                if range < 1e-3 || bearing.abs() >= hfov_rad * 0.5 {
                    return None;
                }
                let f = (w * 0.5) / (hfov_rad * 0.5).tan();
                let cx = w * 0.5 + f * bearing.tan();
                let radius = f * target.diameter_m * 0.5 / range;
                Some((cx, h * 0.5, radius))
            }
        }
    }

    fn render(&self) -> CameraFrame {
        let mut frame = CameraFrame::black(self.width, self.height);
        let disc = self.disc();
        let mut rng = XorShift32::new(0x9E37_79B9 ^ self.frame_index.wrapping_mul(2_654_435_761));

        for y in 0..self.height {
            for x in 0..self.width {
                let i = (y as usize * self.width as usize + x as usize) * 3;
                let inside = disc.is_some_and(|(cx, cy, r)| {
                    let (px, py) = (x as f32 + 0.5 - cx, y as f32 + 0.5 - cy);
                    px * px + py * py <= r * r
                });
                if inside {
                    frame.data[i..i + 3].copy_from_slice(&TARGET_RGB);
                } else {
                    let noise = rng.next_u32() % (2 * NOISE_AMPLITUDE + 1);
                    let v = (u32::from(BACKGROUND) + noise).saturating_sub(NOISE_AMPLITUDE) as u8;
                    frame.data[i..i + 3].copy_from_slice(&[v, v, v]);
                }
            }
        }
        frame
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn initialize(&mut self, settings: &CameraSettings) -> Result<(), RelumeError> {
        if self.fail_open {
            return Err(RelumeError::Camera(format!("sim camera '{}' refused to open", self.id)));
        }
        self.width = settings.width;
        self.height = settings.height;
        self.open = true;
        Ok(())
    }

    fn apply(&mut self, param: &CameraParam) -> Result<(), RelumeError> {
        match *param {
            CameraParam::Width(w) => self.width = w,
            CameraParam::Height(h) => self.height = h,
            _ => {}
        }
        Ok(())
    }

    fn capture(&mut self) -> Result<CameraFrame, RelumeError> {
        if !self.open {
            return Err(RelumeError::Camera(format!("sim camera '{}' is closed", self.id)));
        }
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(RelumeError::Camera("simulated read failure".to_string()));
        }
        let frame = self.render();
        self.frame_index = self.frame_index.wrapping_add(1);
        Ok(frame)
    }

    fn release(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Small deterministic PRNG for background noise.
struct XorShift32(u32);

impl XorShift32 {
    fn new(seed: u32) -> Self {
        Self(seed.max(1))
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
