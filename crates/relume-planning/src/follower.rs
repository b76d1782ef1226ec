//! Pure-pursuit style waypoint follower producing drive [`Command`]s.

use relume_types::{Command, Pose2D};
use serde::{Deserialize, Serialize};

use crate::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaypointFollower {
    /// Steer toward the first waypoint at least this far away.
    pub lookahead_m: f32,
    pub max_linear_mps: f32,
    pub max_angular_radps: f32,
    /// Proportional gain from heading error (rad) to yaw rate (rad/s).
    pub heading_gain: f32,
    /// Distance to the final waypoint at which the robot stops.
    pub goal_tolerance_m: f32,
}

impl Default for WaypointFollower {
    fn default() -> Self {
        Self {
            lookahead_m: 0.3,
            max_linear_mps: 0.4,
            max_angular_radps: 1.5,
            heading_gain: 2.0,
            goal_tolerance_m: 0.15,
        }
    }
}

impl WaypointFollower {
    /// Next command for a robot at `pose` following `path`.
    ///
    /// An empty path, or a pose within `goal_tolerance_m` of its end, yields
    /// [`Command::Stop`].
    pub fn command(&self, pose: &Pose2D, path: &Path) -> Command {
        let Some(goal) = path.goal() else {
            return Command::Stop;
        };
        let dist = |p: (f32, f32)| (p.0 - pose.x_m).hypot(p.1 - pose.y_m);
        if dist(goal) <= self.goal_tolerance_m {
            return Command::Stop;
        }

        let target = path
            .waypoints()
            .iter()
            .copied()
            .find(|&p| dist(p) >= self.lookahead_m)
            .unwrap_or(goal);

        let bearing = (target.1 - pose.y_m).atan2(target.0 - pose.x_m);
        let err = wrap_angle(bearing - pose.heading_rad);
        let angular_radps = (self.heading_gain * err).clamp(-self.max_angular_radps, self.max_angular_radps);
        // Turn in place while facing away from the target.
        let linear_mps = self.max_linear_mps * err.cos().max(0.0);

        Command::Drive {
            linear_mps,
            angular_radps,
        }
    }
}

fn wrap_angle(a: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    let a = a.rem_euclid(TAU);
    if a > PI { a - TAU } else { a }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn pose(x: f32, y: f32, h: f32) -> Pose2D {
        Pose2D {
            x_m: x,
            y_m: y,
            heading_rad: h,
        }
    }

    fn drive(cmd: Command) -> (f32, f32) {
        match cmd {
            Command::Drive {
                linear_mps,
                angular_radps,
            } => (linear_mps, angular_radps),
            Command::Stop => panic!("expected a drive command"),
        }
    }

    #[test]
    fn empty_path_stops() {
        assert_eq!(WaypointFollower::default().command(&pose(0.0, 0.0, 0.0), &Path::default()), Command::Stop);
    }

    #[test]
    fn stops_inside_goal_tolerance() {
        let path = Path::new(vec![(0.0, 0.0), (1.0, 0.0)]);
        let f = WaypointFollower::default();
        assert_eq!(f.command(&pose(0.9, 0.05, 0.0), &path), Command::Stop);
    }

    #[test]
    fn aligned_robot_drives_straight_at_full_speed() {
        let path = Path::new(vec![(0.0, 0.0), (2.0, 0.0)]);
        let f = WaypointFollower::default();
        let (v, w) = drive(f.command(&pose(0.0, 0.0, 0.0), &path));
        assert!((v - f.max_linear_mps).abs() < 1e-6);
        assert!(w.abs() < 1e-6);
    }

    #[test]
    fn target_to_the_left_turns_counter_clockwise() {
        let path = Path::new(vec![(0.0, 0.0), (0.0, 2.0)]);
        let f = WaypointFollower::default();
        let (v, w) = drive(f.command(&pose(0.0, 0.0, 0.0), &path));
        assert!(v.abs() < 1e-5, "perpendicular target gives no forward speed");
        assert!((w - f.max_angular_radps).abs() < 1e-6, "saturated: {w}");
    }

    #[test]
    fn target_behind_turns_in_place() {
        let path = Path::new(vec![(-2.0, -0.1)]);
        let (v, w) = drive(WaypointFollower::default().command(&pose(0.0, 0.0, 0.0), &path));
        assert_eq!(v, 0.0);
        assert!(w < 0.0);
    }

    #[test]
    fn lookahead_skips_nearby_waypoints() {
        let path = Path::new(vec![(0.1, 0.0), (0.2, 0.1), (1.0, 1.0)]);
        let f = WaypointFollower {
            heading_gain: 1.0,
            max_angular_radps: 10.0,
            ..Default::default()
        };
        let (_, w) = drive(f.command(&pose(0.0, 0.0, 0.0), &path));
        assert!((w - PI / 4.0).abs() < 1e-5);
    }

    #[test]
    fn heading_error_wraps_across_pi() {
        let path = Path::new(vec![(-2.0, 0.1)]);
        let f = WaypointFollower::default();
        // Facing almost exactly at the target across the ±π seam.
        let (v, w) = drive(f.command(&pose(0.0, 0.0, PI - 0.01), &path));
        assert!(v > 0.9 * f.max_linear_mps);
        assert!(w.abs() < 0.2);
    }
}
