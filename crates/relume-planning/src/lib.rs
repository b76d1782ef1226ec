//! `relume-planning` – Path Planning
//!
//! Plans a collision-free route across a static occupancy grid and turns it
//! into drive commands.
//!
//! # Example
//!
//! ```rust
//! use relume_planning::{AStarPlanner, OccupancyGrid, WaypointFollower};
//! use relume_types::{Command, Pose2D};
//!
//! let grid = OccupancyGrid::new(20, 20, 0.1, (0.0, 0.0));
//! let path = AStarPlanner::default()
//!     .plan(&grid, (0.05, 0.05), (1.5, 0.05))
//!     .unwrap()
//!     .unwrap()
//!     .simplify();
//! assert_eq!(path.len(), 2);
//!
//! let cmd = WaypointFollower::default().command(&Pose2D::default(), &path);
//! assert!(matches!(cmd, Command::Drive { .. }));
//! ```

pub mod astar;
pub mod follower;
pub mod grid;
pub mod path;

pub use astar::AStarPlanner;
pub use follower::WaypointFollower;
pub use grid::{GridConfig, Obstacle, OccupancyGrid};
pub use path::Path;
