//! [`HostLoop`] – the host tier's perception and planning cycle.
//!
//! Every `period_ms` the host:
//!
//! 1. drains controller reports, updating the robot pose from telemetry and
//!    logging faults;
//! 2. takes the newest camera frame from the [`FrameSlot`];
//! 3. runs [`HostPipeline::decide_with`] on a blocking worker: preprocess,
//!    detect, project the target into the world, plan on the inflated grid,
//!    pull the path straight and follow it;
//! 4. sends the resulting command with the next sequence number.
//!
//! Between sightings the host remembers the target in a [`Pursuit`]: a target
//! that drops out of view is chased to its last goal for `target_memory_ms`,
//! after which the robot rotates in place toward the side it was last seen
//! on.  When no new frame is available the previous command is repeated
//! until the newest frame is older than `frame_timeout_ms`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relume_hal::camera::CameraFrame;
use relume_hal::capture::FrameCallback;
use relume_link::{LinkRx, LinkTx};
use relume_perception::detection::{DetectionConfig, TargetDetector};
use relume_perception::preprocess::{PreprocessConfig, Preprocessor};
use relume_planning::{AStarPlanner, GridConfig, OccupancyGrid, WaypointFollower};
use relume_types::{Command, ControllerReport, HostMessage, Pose2D, RelumeError, TargetInfo};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::watchdog::{ComponentHealth, Watchdog};

/// Watchdog id for the controller's telemetry stream.
pub const CONTROLLER_TELEMETRY: &str = "controller_telemetry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub period_ms: u64,
    pub telemetry_timeout_ms: u64,
    /// Repeat the last command for at most this long without a new frame.
    pub frame_timeout_ms: u64,
    /// How long a lost target's last goal is still pursued.
    pub target_memory_ms: u64,
    /// Rotation speed while searching; `0` waits in place instead.
    pub search_angular_radps: f32,
    /// Distance to keep from the target.
    pub standoff_m: f32,
    pub preprocess: PreprocessConfig,
    pub detection: DetectionConfig,
    pub grid: GridConfig,
    pub planner: AStarPlanner,
    pub follower: WaypointFollower,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            period_ms: 100,
            telemetry_timeout_ms: 1000,
            frame_timeout_ms: 300,
            target_memory_ms: 2000,
            search_angular_radps: 0.4,
            standoff_m: 0.5,
            preprocess: PreprocessConfig::default(),
            detection: DetectionConfig::default(),
            grid: GridConfig::default(),
            planner: AStarPlanner::default(),
            follower: WaypointFollower::default(),
        }
    }
}

impl HostConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn target_memory(&self) -> Duration {
        Duration::from_millis(self.target_memory_ms)
    }
}

/// Why a [`Decision`] carries the command it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Following a fresh route toward the target.
    Approaching,
    /// Within stand-off distance of the target.
    Arrived,
    /// Target in view but its range is unknown.
    NoRange,
    /// No route to the goal.
    NoRoute,
    /// Target not in view.
    Lost,
    /// Target not in view; heading for its last goal.
    Recalled,
    /// Rotating in place to find the target.
    Searching,
}

/// Outcome of one perception/planning pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub command: Command,
    pub outcome: Outcome,
    pub target: Option<TargetInfo>,
    /// World point the planner was asked to reach.
    pub goal: Option<(f32, f32)>,
    /// Waypoints of the followed path, `0` when nothing was planned.
    pub waypoints: usize,
}

impl Decision {
    fn stop(outcome: Outcome, target: Option<TargetInfo>, goal: Option<(f32, f32)>) -> Self {
        Self {
            command: Command::Stop,
            outcome,
            target,
            goal,
            waypoints: 0,
        }
    }
}

/// What the host remembers about the target between frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pursuit {
    /// No usable sighting; turn clockwise or counter-clockwise to look.
    Searching { clockwise: bool },
    /// Goal of the last sighting, the side it was on and how long ago.
    Tracking {
        goal: (f32, f32),
        clockwise: bool,
        unseen: Duration,
    },
    /// Target reached; hold still until it is seen again.
    Arrived,
}

impl Default for Pursuit {
    fn default() -> Self {
        Self::Searching { clockwise: false }
    }
}

impl Pursuit {
    /// Fold in `decision`, made `dt` after the previous one.  A sighting
    /// older than `memory` turns into a search.
    pub fn update(self, decision: &Decision, dt: Duration, memory: Duration) -> Self {
        match decision.outcome {
            Outcome::Arrived => return Self::Arrived,
            Outcome::NoRange => return self,
            _ => {}
        }
        if let (Some(target), Some(goal)) = (decision.target, decision.goal) {
            // Positive bearing is to the right.
            return Self::Tracking {
                goal,
                clockwise: target.bearing_rad > 0.0,
                unseen: Duration::ZERO,
            };
        }
        match self {
            Self::Tracking {
                goal,
                clockwise,
                unseen,
            } => {
                let unseen = unseen + dt;
                if unseen > memory {
                    Self::Searching { clockwise }
                } else {
                    Self::Tracking {
                        goal,
                        clockwise,
                        unseen,
                    }
                }
            }
            other => other,
        }
    }
}

/// Stateless frame → command pipeline.  Shared with blocking workers.
#[derive(Debug)]
pub struct HostPipeline {
    preprocessor: Preprocessor,
    detector: TargetDetector,
    grid: OccupancyGrid,
    planner: AStarPlanner,
    follower: WaypointFollower,
    standoff_m: f32,
    search_angular_radps: f32,
}

impl HostPipeline {
    /// Build the pipeline; the occupancy grid is rasterised and inflated once.
    pub fn new(config: &HostConfig) -> Result<Self, RelumeError> {
        let grid = OccupancyGrid::from_config(&config.grid)?.inflate(config.grid.inflation_radius_m);
        debug!(occupied = grid.occupied_count(), "occupancy grid ready");
        Ok(Self {
            preprocessor: Preprocessor::new(config.preprocess.clone()),
            detector: TargetDetector::new(config.detection.clone()),
            grid,
            planner: config.planner,
            follower: config.follower.clone(),
            standoff_m: config.standoff_m.max(0.0),
            search_angular_radps: config.search_angular_radps.abs(),
        })
    }

    pub fn grid(&self) -> &OccupancyGrid {
        &self.grid
    }

    /// Decide the next command for a robot at `pose` seeing `frame`, with no
    /// memory of earlier frames.  A frame without a target yields
    /// [`Outcome::Lost`] and [`Command::Stop`].
    ///
    /// # Errors
    ///
    /// Image errors from preprocessing and planning errors (pose or goal off
    /// the map or inside an obstacle).
    #[instrument(name = "host_decide", skip_all, fields(width = frame.width, height = frame.height))]
    pub fn decide(&self, frame: &CameraFrame, pose: &Pose2D) -> Result<Decision, RelumeError> {
        let image = self.preprocessor.run(frame)?;
        let Some(target) = self.detector.detect(&image) else {
            debug!("target lost");
            return Ok(Decision::stop(Outcome::Lost, None, None));
        };
        let Some(range) = target.range_m else {
            debug!("target has no range estimate");
            return Ok(Decision::stop(Outcome::NoRange, Some(target), None));
        };

        // Bearing is positive to the right, i.e. clockwise.
        let direction = pose.heading_rad - target.bearing_rad;
        let (dx, dy) = (direction.cos(), direction.sin());
        if range <= self.standoff_m + self.follower.goal_tolerance_m {
            debug!(range, "target reached");
            return Ok(Decision::stop(Outcome::Arrived, Some(target), None));
        }
        let approach = range - self.standoff_m;
        let goal = self.clamp_to_map((pose.x_m + approach * dx, pose.y_m + approach * dy));
        self.approach(pose, goal, Some(target), Outcome::Approaching)
    }

    /// Pull `goal` onto the map so far sightings still get a route.
    fn clamp_to_map(&self, goal: (f32, f32)) -> (f32, f32) {
        let (ox, oy) = self.grid.origin();
        let half = 0.5 * self.grid.resolution_m();
        let max_x = ox + self.grid.width() as f32 * self.grid.resolution_m() - half;
        let max_y = oy + self.grid.height() as f32 * self.grid.resolution_m() - half;
        let clamped = (goal.0.clamp(ox + half, max_x), goal.1.clamp(oy + half, max_y));
        if clamped != goal {
            debug!(?goal, ?clamped, "goal pulled onto the map");
        }
        clamped
    }

    /// [`decide`][Self::decide], falling back on `pursuit` when the target
    /// is not in view: chase the remembered goal, rotate to search, or hold
    /// still after arrival.
    pub fn decide_with(&self, frame: &CameraFrame, pose: &Pose2D, pursuit: Pursuit) -> Result<Decision, RelumeError> {
        let decision = self.decide(frame, pose)?;
        if decision.outcome != Outcome::Lost {
            return Ok(decision);
        }
        match pursuit {
            Pursuit::Tracking { goal, .. } => self.approach(pose, goal, None, Outcome::Recalled),
            Pursuit::Searching { clockwise } => Ok(self.search(clockwise)),
            Pursuit::Arrived => Ok(decision),
        }
    }

    /// Plan from `pose` to `goal`, straighten the path and follow it.
    fn approach(
        &self,
        pose: &Pose2D,
        goal: (f32, f32),
        target: Option<TargetInfo>,
        outcome: Outcome,
    ) -> Result<Decision, RelumeError> {
        let Some(path) = self.planner.plan(&self.grid, (pose.x_m, pose.y_m), goal)? else {
            warn!(?goal, "no route to target");
            return Ok(Decision::stop(Outcome::NoRoute, target, Some(goal)));
        };
        let path = path.shortcut(&self.grid);
        let command = self.follower.command(pose, &path);
        debug!(?outcome, ?goal, waypoints = path.len(), ?command, "decision");
        Ok(Decision {
            command,
            outcome,
            target,
            goal: Some(goal),
            waypoints: path.len(),
        })
    }

    fn search(&self, clockwise: bool) -> Decision {
        if self.search_angular_radps <= 0.0 {
            return Decision::stop(Outcome::Searching, None, None);
        }
        let angular_radps = if clockwise {
            -self.search_angular_radps
        } else {
            self.search_angular_radps
        };
        Decision {
            command: Command::Drive {
                linear_mps: 0.0,
                angular_radps,
            },
            outcome: Outcome::Searching,
            target: None,
            goal: None,
            waypoints: 0,
        }
    }
}

/// Newest-frame mailbox filled by the capture thread.
#[derive(Debug, Clone, Default)]
pub struct FrameSlot(Arc<Mutex<Option<CameraFrame>>>);

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any frame not yet taken.
    pub fn store(&self, frame: CameraFrame) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Some(frame);
    }

    pub fn take(&self) -> Option<CameraFrame> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Capture callback that stores every frame in this slot.
    pub fn callback(&self) -> FrameCallback {
        let slot = self.clone();
        Box::new(move |frame| {
            slot.store(frame);
            Ok(())
        })
    }
}

#[derive(Debug)]
pub struct HostLoop {
    config: HostConfig,
    pipeline: Arc<HostPipeline>,
    watchdog: Watchdog,
    pose: Pose2D,
    seq: u32,
    controller_stale: bool,
    faults: u64,
    pursuit: Pursuit,
    last_command: Command,
    since_frame: Duration,
}

impl HostLoop {
    pub fn new(config: HostConfig) -> Result<Self, RelumeError> {
        let pipeline = Arc::new(HostPipeline::new(&config)?);
        let mut watchdog = Watchdog::new();
        watchdog.register(CONTROLLER_TELEMETRY, Duration::from_millis(config.telemetry_timeout_ms));
        Ok(Self {
            config,
            pipeline,
            watchdog,
            pose: Pose2D::default(),
            seq: 0,
            controller_stale: false,
            faults: 0,
            pursuit: Pursuit::default(),
            last_command: Command::Stop,
            since_frame: Duration::ZERO,
        })
    }

    /// Last pose reported by the controller.
    pub fn pose(&self) -> Pose2D {
        self.pose
    }

    pub fn controller_stale(&self) -> bool {
        self.controller_stale
    }

    /// Faults reported by the controller so far.
    pub fn faults(&self) -> u64 {
        self.faults
    }

    pub fn pursuit(&self) -> Pursuit {
        self.pursuit
    }

    pub fn pipeline(&self) -> &HostPipeline {
        &self.pipeline
    }

    /// Fold in controller reports and let `dt` pass on the telemetry
    /// watchdog.
    pub fn ingest(&mut self, dt: Duration, reports: impl IntoIterator<Item = ControllerReport>) {
        for report in reports {
            match report {
                ControllerReport::Telemetry(t) => {
                    self.pose = t.pose;
                    self.watchdog.heartbeat(CONTROLLER_TELEMETRY);
                    if t.failsafe {
                        debug!(seq_ack = t.seq_ack, "controller reports failsafe");
                    }
                }
                ControllerReport::Fault { component, message } => {
                    self.faults += 1;
                    warn!(%component, %message, "controller fault");
                }
            }
        }
        self.watchdog.advance(dt);

        let stale = self.watchdog.health(CONTROLLER_TELEMETRY) == ComponentHealth::TimedOut;
        if stale != self.controller_stale {
            if stale {
                warn!(timeout_ms = self.config.telemetry_timeout_ms, "controller telemetry stale");
            } else {
                info!("controller telemetry resumed");
            }
            self.controller_stale = stale;
        }
    }

    /// Stamp `command` with the next sequence number.
    pub fn next_message(&mut self, command: Command) -> HostMessage {
        self.seq = self.seq.wrapping_add(1);
        HostMessage { seq: self.seq, command }
    }

    /// One host cycle decided inline: fold in `reports`, decide on `frame`
    /// (or hold the last command when there is none) and return the message
    /// to send.
    pub fn tick(
        &mut self,
        dt: Duration,
        reports: impl IntoIterator<Item = ControllerReport>,
        frame: Option<CameraFrame>,
    ) -> HostMessage {
        self.ingest(dt, reports);
        let command = match frame {
            Some(frame) => {
                let result = self.pipeline.decide_with(&frame, &self.pose, self.pursuit);
                self.conclude(dt, result)
            }
            None => self.hold(dt),
        };
        self.next_message(command)
    }

    /// Record the result of a vision pass on a fresh frame.
    fn conclude(&mut self, dt: Duration, result: Result<Decision, RelumeError>) -> Command {
        self.since_frame = Duration::ZERO;
        let command = match result {
            Ok(decision) => {
                let next = self.pursuit.update(&decision, dt, self.config.target_memory());
                if std::mem::discriminant(&next) != std::mem::discriminant(&self.pursuit) {
                    info!(from = ?self.pursuit, to = ?next, "pursuit changed");
                }
                self.pursuit = next;
                decision.command
            }
            Err(e) => {
                warn!(error = %e, "vision pass failed, stopping");
                Command::Stop
            }
        };
        self.last_command = command;
        command
    }

    /// Command for a cycle without a new frame.
    fn hold(&mut self, dt: Duration) -> Command {
        self.since_frame = self.since_frame.saturating_add(dt);
        if self.since_frame <= self.config.frame_timeout() {
            debug!("no new frame, repeating last command");
            return self.last_command;
        }
        if self.last_command != Command::Stop {
            warn!(
                stale_ms = self.since_frame.as_millis() as u64,
                "camera frames stale, stopping"
            );
            self.last_command = Command::Stop;
        }
        Command::Stop
    }

    async fn decide_off_thread(&self, frame: CameraFrame) -> Result<Decision, RelumeError> {
        let pipeline = Arc::clone(&self.pipeline);
        let (pose, pursuit) = (self.pose, self.pursuit);
        let started = Instant::now();
        let joined = tokio::task::spawn_blocking(move || pipeline.decide_with(&frame, &pose, pursuit)).await;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "vision pass finished");
        joined.map_err(|e| RelumeError::Image(format!("vision worker aborted: {e}")))?
    }

    /// Run the fixed-period loop until `shutdown` is set or the controller
    /// link closes.
    ///
    /// # Errors
    ///
    /// [`RelumeError::Link`] when a command cannot be written.
    pub async fn run(
        &mut self,
        frames: &FrameSlot,
        tx: &mut LinkTx<HostMessage>,
        rx: &mut LinkRx<ControllerReport>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), RelumeError> {
        let period = self.config.period();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_millis() as u64, "host loop started");

        let mut last = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            interval.tick().await;
            let now = Instant::now();
            let dt = now.duration_since(last);
            last = now;

            let reports = match rx.drain() {
                Ok(reports) => reports,
                Err(e) => {
                    warn!(error = %e, "controller link closed");
                    break;
                }
            };
            self.ingest(dt, reports);

            let command = match frames.take() {
                Some(frame) => {
                    let result = self.decide_off_thread(frame).await;
                    self.conclude(dt, result)
                }
                None => self.hold(dt),
            };
            let msg = self.next_message(command);
            tx.send(&msg).await?;
        }

        // Leave the robot at rest; the link may already be gone.
        let stop = self.next_message(Command::Stop);
        if let Err(e) = tx.send(&stop).await {
            debug!(error = %e, "final stop not delivered");
        }
        info!(last_seq = self.seq, "host loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relume_hal::camera::{Camera, CameraSettings, capture_once};
    use relume_hal::registry::DriveKinematics;
    use relume_hal::sim::{SimCamera, SimDriveBase, SimTarget, SimWorld};
    use relume_link::Link;
    use relume_planning::grid::Obstacle;
    use relume_types::Telemetry;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use crate::controller::{ControllerConfig, ControllerLoop};

    const PERIOD: Duration = Duration::from_millis(100);

    fn small_config() -> HostConfig {
        HostConfig::default()
    }

    /// No denoising, for long closed-loop runs in unoptimised builds.
    fn fast_config() -> HostConfig {
        HostConfig {
            preprocess: PreprocessConfig {
                denoise_h: 0.0,
                denoise_h_color: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn settings(width: u32, height: u32) -> CameraSettings {
        CameraSettings {
            width,
            height,
            warmup_ms: 0,
            ..Default::default()
        }
    }

    fn distance(world: &SimWorld, target: &SimTarget) -> f32 {
        let pose = world.pose();
        (target.x_m - pose.x_m).hypot(target.y_m - pose.y_m)
    }

    /// Step both tiers on simulated time: the controller every 10 ms and the
    /// host every tenth controller tick with a freshly rendered frame.
    fn closed_loop(target: SimTarget, seconds: u32) -> (SimWorld, HostLoop) {
        let controller_config = ControllerConfig::default();
        let world = SimWorld::new(controller_config.kinematics);
        let mut controller =
            ControllerLoop::new(controller_config, SimDriveBase::new(world.clone()).build()).unwrap();
        let mut host = HostLoop::new(fast_config()).unwrap();
        let mut camera = SimCamera::new("front").observing(
            world.clone(),
            target,
            DetectionConfig::default().horizontal_fov_deg,
        );
        camera.initialize(&settings(160, 120)).unwrap();

        let tick = Duration::from_millis(10);
        let host_every = 10u32;
        let mut to_controller = Vec::new();
        let mut to_host = Vec::new();
        for i in 0..seconds * 100 {
            if i % host_every == 0 {
                let frame = camera.capture().unwrap();
                to_controller.push(host.tick(tick * host_every, to_host.drain(..), Some(frame)));
            }
            to_host.extend(controller.step(tick, to_controller.drain(..)));
        }
        (world, host)
    }

    fn frame_of(target: Option<(f32, f32)>) -> CameraFrame {
        let world = SimWorld::new(DriveKinematics::default());
        let cam = SimCamera::new("front");
        let mut cam = match target {
            Some((x, y)) => cam.observing(
                world,
                SimTarget {
                    x_m: x,
                    y_m: y,
                    diameter_m: 0.2,
                },
                62.2,
            ),
            None => cam.with_empty_scene(),
        };
        cam.initialize(&settings(160, 120)).unwrap();
        capture_once(&mut cam).unwrap()
    }

    fn drive_parts(command: Command) -> (f32, f32) {
        match command {
            Command::Drive {
                linear_mps,
                angular_radps,
            } => (linear_mps, angular_radps),
            Command::Stop => panic!("expected to drive"),
        }
    }

    #[test]
    fn drives_toward_target_ahead() {
        let pipeline = HostPipeline::new(&small_config()).unwrap();
        let decision = pipeline.decide(&frame_of(Some((2.0, 0.0))), &Pose2D::default()).unwrap();
        let target = decision.target.unwrap();
        assert!(target.bearing_rad.abs() < 0.05);
        let range = target.range_m.unwrap();
        assert!((range - 2.0).abs() < 0.3, "range {range}");
        match decision.command {
            Command::Drive {
                linear_mps,
                angular_radps,
            } => {
                assert!(linear_mps > 0.3);
                assert!(angular_radps.abs() < 0.2);
            }
            Command::Stop => panic!("expected to drive"),
        }
        let goal = decision.goal.unwrap();
        assert!((goal.0 - 1.5).abs() < 0.3 && goal.1.abs() < 0.1);
    }

    #[test]
    fn turns_toward_target_on_the_left() {
        let pipeline = HostPipeline::new(&small_config()).unwrap();
        let decision = pipeline.decide(&frame_of(Some((2.0, 0.6))), &Pose2D::default()).unwrap();
        assert!(decision.target.unwrap().bearing_rad < 0.0);
        match decision.command {
            Command::Drive { angular_radps, .. } => assert!(angular_radps > 0.0),
            Command::Stop => panic!("expected to drive"),
        }
    }

    #[test]
    fn stops_when_target_lost() {
        let pipeline = HostPipeline::new(&small_config()).unwrap();
        let decision = pipeline.decide(&frame_of(None), &Pose2D::default()).unwrap();
        assert_eq!(decision.command, Command::Stop);
        assert_eq!(decision.outcome, Outcome::Lost);
        assert!(decision.target.is_none());
    }

    #[test]
    fn stops_at_standoff_distance() {
        let pipeline = HostPipeline::new(&small_config()).unwrap();
        let decision = pipeline.decide(&frame_of(Some((0.55, 0.0))), &Pose2D::default()).unwrap();
        assert!(decision.target.is_some());
        assert_eq!(decision.command, Command::Stop);
        assert_eq!(decision.outcome, Outcome::Arrived);
    }

    #[test]
    fn stops_when_no_route() {
        let mut config = small_config();
        config.grid.obstacles.push(Obstacle {
            min_x_m: 0.8,
            min_y_m: -5.0,
            max_x_m: 1.0,
            max_y_m: 5.0,
        });
        let pipeline = HostPipeline::new(&config).unwrap();
        let decision = pipeline.decide(&frame_of(Some((2.0, 0.0))), &Pose2D::default()).unwrap();
        assert_eq!(decision.command, Command::Stop);
        assert_eq!(decision.outcome, Outcome::NoRoute);
        assert!(decision.goal.is_some());
    }

    #[test]
    fn distant_goal_is_clamped_onto_the_map() {
        let mut config = small_config();
        config.grid.width_cells = 20;
        config.grid.height_cells = 20;
        config.grid.origin_x_m = -1.0;
        config.grid.origin_y_m = -1.0;
        let pipeline = HostPipeline::new(&config).unwrap();
        let decision = pipeline.decide(&frame_of(Some((2.0, 0.0))), &Pose2D::default()).unwrap();
        assert_eq!(decision.outcome, Outcome::Approaching);
        let goal = decision.goal.unwrap();
        assert!(goal.0 <= 1.0 && goal.0 > 0.9, "goal {goal:?}");
        let (linear, _) = drive_parts(decision.command);
        assert!(linear > 0.3);
    }

    #[test]
    fn off_axis_target_gets_a_straight_path() {
        let pipeline = HostPipeline::new(&small_config()).unwrap();
        let decision = pipeline.decide(&frame_of(Some((2.5, 0.8))), &Pose2D::default()).unwrap();
        assert_eq!(decision.outcome, Outcome::Approaching);
        assert_eq!(decision.waypoints, 2, "open floor needs no corners");
        let (_, angular) = drive_parts(decision.command);
        // Steer at the target's bearing, not along a 45° grid leg.
        let bearing = -decision.target.unwrap().bearing_rad;
        let expected = (2.0 * bearing).clamp(-1.5, 1.5);
        assert!((angular - expected).abs() < 0.15, "angular {angular}, expected {expected}");
    }

    #[test]
    fn default_pipeline_keeps_up_with_the_host_period() {
        let config = HostConfig::default();
        let pipeline = HostPipeline::new(&config).unwrap();
        let mut cam = SimCamera::new("front");
        cam.initialize(&settings(640, 480)).unwrap();
        let frame = capture_once(&mut cam).unwrap();

        let started = Instant::now();
        let decision = pipeline.decide(&frame, &Pose2D::default()).unwrap();
        let elapsed = started.elapsed();

        // Unoptimised builds get headroom; optimised ones must fit a period.
        let budget = if cfg!(debug_assertions) {
            config.period() * 20
        } else {
            config.period()
        };
        assert!(elapsed < budget, "decide took {elapsed:?}, budget {budget:?}");

        // The default disc sits well inside the default map.
        let range = decision.target.and_then(|t| t.range_m).unwrap();
        assert!((1.0..2.5).contains(&range), "range {range}");
        assert_eq!(decision.outcome, Outcome::Approaching);
        let (linear, _) = drive_parts(decision.command);
        assert!(linear > 0.3);
    }

    #[test]
    fn lost_target_is_chased_then_searched_for() {
        let mut host = HostLoop::new(small_config()).unwrap();
        let seen = host.tick(PERIOD, [], Some(frame_of(Some((2.0, 0.5)))));
        let (_, seen_angular) = drive_parts(seen.command);
        assert!(seen_angular > 0.0);
        assert!(matches!(host.pursuit(), Pursuit::Tracking { clockwise: false, .. }));

        // Out of view: keep heading for the remembered goal.
        let blind = host.tick(PERIOD, [], Some(frame_of(None)));
        let (linear, angular) = drive_parts(blind.command);
        assert!(linear > 0.3 && angular > 0.0);

        // Memory runs out: rotate toward the side the target was last seen.
        for _ in 0..20 {
            host.tick(PERIOD, [], Some(frame_of(None)));
        }
        assert_eq!(host.pursuit(), Pursuit::Searching { clockwise: false });
        let search = host.tick(PERIOD, [], Some(frame_of(None)));
        assert_eq!(search.command, Command::Drive {
            linear_mps: 0.0,
            angular_radps: 0.4,
        });
    }

    #[test]
    fn search_can_be_disabled() {
        let mut host = HostLoop::new(HostConfig {
            search_angular_radps: 0.0,
            ..small_config()
        })
        .unwrap();
        let msg = host.tick(PERIOD, [], Some(frame_of(None)));
        assert_eq!(msg.command, Command::Stop);
    }

    #[test]
    fn arrival_holds_still_when_target_leaves_view() {
        let mut host = HostLoop::new(small_config()).unwrap();
        assert_eq!(host.tick(PERIOD, [], Some(frame_of(Some((0.55, 0.0))))).command, Command::Stop);
        assert_eq!(host.pursuit(), Pursuit::Arrived);
        assert_eq!(host.tick(PERIOD, [], Some(frame_of(None))).command, Command::Stop);
        assert_eq!(host.pursuit(), Pursuit::Arrived);
    }

    #[test]
    fn last_command_repeats_until_frames_go_stale() {
        let mut host = HostLoop::new(small_config()).unwrap();
        let first = host.tick(PERIOD, [], Some(frame_of(Some((2.0, 0.0))))).command;
        drive_parts(first);
        // 100, 200 and 300 ms without a frame stay within the timeout.
        for _ in 0..3 {
            assert_eq!(host.tick(PERIOD, [], None).command, first);
        }
        assert_eq!(host.tick(PERIOD, [], None).command, Command::Stop);
        assert_eq!(host.tick(PERIOD, [], None).command, Command::Stop);

        // A fresh frame resumes the approach.
        let resumed = host.tick(PERIOD, [], Some(frame_of(Some((2.0, 0.0)))));
        drive_parts(resumed.command);
    }

    #[test]
    fn closed_loop_stops_at_standoff_from_off_axis_target() {
        let target = SimTarget {
            x_m: 2.5,
            y_m: 0.8,
            diameter_m: 0.2,
        };
        let (world, host) = closed_loop(target, 15);
        let config = HostConfig::default();
        let d = distance(&world, &target);
        assert!(
            d <= config.standoff_m + config.follower.goal_tolerance_m && d > 0.3,
            "ended {d} m from the target at {:?}",
            world.pose()
        );
        assert_eq!(host.pursuit(), Pursuit::Arrived);
    }

    #[test]
    fn closed_loop_finds_target_behind_the_robot() {
        let target = SimTarget {
            x_m: -1.0,
            y_m: 1.5,
            diameter_m: 0.2,
        };
        let (world, host) = closed_loop(target, 25);
        let config = HostConfig::default();
        let d = distance(&world, &target);
        assert!(
            d <= config.standoff_m + config.follower.goal_tolerance_m,
            "ended {d} m from the target at {:?}",
            world.pose()
        );
        assert_eq!(host.pursuit(), Pursuit::Arrived);
    }

    /// Records the name of every span opened.
    struct SpanNames(Arc<Mutex<Vec<&'static str>>>);

    impl<S: tracing::Subscriber> Layer<S> for SpanNames {
        fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, _id: &tracing::span::Id, _ctx: Context<'_, S>) {
            self.0.lock().unwrap().push(attrs.metadata().name());
        }
    }

    #[test]
    fn decide_and_controller_step_open_spans() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(SpanNames(Arc::clone(&names)));
        tracing::subscriber::with_default(subscriber, || {
            let pipeline = HostPipeline::new(&small_config()).unwrap();
            pipeline.decide(&frame_of(None), &Pose2D::default()).unwrap();

            let config = ControllerConfig::default();
            let world = SimWorld::new(config.kinematics);
            let mut controller = ControllerLoop::new(config, SimDriveBase::new(world).build()).unwrap();
            controller.step(Duration::from_millis(10), []);
        });
        let names = names.lock().unwrap();
        assert!(names.contains(&"host_decide"), "{names:?}");
        assert!(names.contains(&"controller_step"), "{names:?}");
    }

    #[test]
    fn invalid_frame_is_an_error() {
        let pipeline = HostPipeline::new(&small_config()).unwrap();
        let bad = CameraFrame {
            width: 4,
            height: 4,
            data: vec![0; 5],
        };
        assert!(pipeline.decide(&bad, &Pose2D::default()).is_err());
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut host = HostLoop::new(small_config()).unwrap();
        let a = host.next_message(Command::Stop);
        let b = host.next_message(Command::Stop);
        assert_eq!((a.seq, b.seq), (1, 2));
    }

    #[test]
    fn telemetry_updates_pose_and_staleness() {
        let mut host = HostLoop::new(small_config()).unwrap();
        let pose = Pose2D {
            x_m: 1.0,
            y_m: -0.5,
            heading_rad: 0.3,
        };
        host.ingest(Duration::from_millis(100), vec![ControllerReport::Telemetry(Telemetry {
            pose,
            ..Default::default()
        })]);
        assert_eq!(host.pose(), pose);
        assert!(!host.controller_stale());

        for _ in 0..10 {
            host.ingest(Duration::from_millis(100), vec![]);
        }
        assert!(host.controller_stale());

        host.ingest(Duration::from_millis(100), vec![
            ControllerReport::Fault {
                component: "drive_left".to_string(),
                message: "encoder offline".to_string(),
            },
            ControllerReport::Telemetry(Telemetry::default()),
        ]);
        assert!(!host.controller_stale());
        assert_eq!(host.faults(), 1);
    }

    #[test]
    fn frame_slot_keeps_only_newest() {
        let slot = FrameSlot::new();
        let mut callback = slot.callback();
        callback(CameraFrame::black(1, 1)).unwrap();
        callback(CameraFrame::black(2, 2)).unwrap();
        assert_eq!(slot.take().map(|f| f.width), Some(2));
        assert!(slot.take().is_none());
    }

    #[tokio::test]
    async fn run_sends_stop_without_frames() {
        let mut host = HostLoop::new(HostConfig {
            period_ms: 5,
            ..small_config()
        })
        .unwrap();
        let (host_io, ctrl_io) = tokio::io::duplex(4096);
        let (mut host_tx, mut host_rx) = Link::spawn::<_, HostMessage, ControllerReport>(host_io);
        let (ctrl_tx, mut ctrl_rx) = Link::spawn::<_, ControllerReport, HostMessage>(ctrl_io);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let frames = FrameSlot::new();
        let handle = tokio::spawn(async move {
            host.run(&frames, &mut host_tx, &mut host_rx, flag).await
        });

        for expected in 1..=3 {
            let msg = tokio::time::timeout(Duration::from_secs(2), ctrl_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.seq, expected);
            assert_eq!(msg.command, Command::Stop);
        }
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        drop(ctrl_tx);
    }
}
