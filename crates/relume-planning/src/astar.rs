//! A* search over an [`OccupancyGrid`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use relume_types::RelumeError;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::grid::OccupancyGrid;
use crate::path::Path;

const SQRT_2: f32 = std::f32::consts::SQRT_2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AStarPlanner {
    /// 8-connected moves with an octile heuristic when `true`, otherwise
    /// 4-connected with Manhattan distance.
    pub allow_diagonal: bool,
}

impl Default for AStarPlanner {
    fn default() -> Self {
        Self { allow_diagonal: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OpenNode {
    f: f32,
    h: f32,
    /// Insertion counter; earlier pushes win remaining ties.
    order: u64,
    cell: usize,
}

impl Eq for OpenNode {}

impl Ord for OpenNode {
    // BinaryHeap is a max-heap, so every comparison is reversed.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.h.total_cmp(&self.h))
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl AStarPlanner {
    pub fn new(allow_diagonal: bool) -> Self {
        Self { allow_diagonal }
    }

    fn heuristic(&self, a: (usize, usize), b: (usize, usize)) -> f32 {
        let dx = a.0.abs_diff(b.0) as f32;
        let dy = a.1.abs_diff(b.1) as f32;
        if self.allow_diagonal {
            dx.max(dy) + (SQRT_2 - 1.0) * dx.min(dy)
        } else {
            dx + dy
        }
    }

    /// Cheapest cell path from `start` to `goal`, both inclusive.
    ///
    /// # Errors
    ///
    /// [`RelumeError::Planning`] when either endpoint is outside the grid or
    /// occupied.  An unreachable goal is `Ok(None)`.
    pub fn plan_cells(
        &self,
        grid: &OccupancyGrid,
        start: (usize, usize),
        goal: (usize, usize),
    ) -> Result<Option<Vec<(usize, usize)>>, RelumeError> {
        for (name, (cx, cy)) in [("start", start), ("goal", goal)] {
            if cx >= grid.width() || cy >= grid.height() {
                return Err(RelumeError::Planning(format!("{name} ({cx}, {cy}) is outside the grid")));
            }
            if !grid.is_free(cx, cy) {
                return Err(RelumeError::Planning(format!("{name} ({cx}, {cy}) is occupied")));
            }
        }

        let w = grid.width();
        let n = w * grid.height();
        let index = |c: (usize, usize)| c.1 * w + c.0;
        let mut g = vec![f32::INFINITY; n];
        let mut parent = vec![usize::MAX; n];
        let mut closed = vec![false; n];
        let mut open = BinaryHeap::new();
        let mut order = 0u64;

        let s = index(start);
        g[s] = 0.0;
        let h0 = self.heuristic(start, goal);
        open.push(OpenNode {
            f: h0,
            h: h0,
            order,
            cell: s,
        });

        let moves: &[(i64, i64)] = if self.allow_diagonal {
            &[(1, 0), (0, 1), (-1, 0), (0, -1), (1, 1), (-1, 1), (-1, -1), (1, -1)]
        } else {
            &[(1, 0), (0, 1), (-1, 0), (0, -1)]
        };

        let goal_idx = index(goal);
        let mut expanded = 0usize;
        while let Some(node) = open.pop() {
            if closed[node.cell] {
                continue;
            }
            closed[node.cell] = true;
            expanded += 1;
            if node.cell == goal_idx {
                let mut cells = vec![goal];
                let mut cur = goal_idx;
                while parent[cur] != usize::MAX {
                    cur = parent[cur];
                    cells.push((cur % w, cur / w));
                }
                cells.reverse();
                debug!(expanded, length = cells.len(), "path found");
                return Ok(Some(cells));
            }

            let (cx, cy) = ((node.cell % w) as i64, (node.cell / w) as i64);
            for &(dx, dy) in moves {
                let (nx, ny) = (cx + dx, cy + dy);
                if !grid.in_bounds(nx, ny) || !grid.is_free(nx as usize, ny as usize) {
                    continue;
                }
                // Never squeeze between two occupied orthogonal neighbours
                // or clip an occupied corner.
                if dx != 0
                    && dy != 0
                    && (!grid.is_free((cx + dx) as usize, cy as usize) || !grid.is_free(cx as usize, (cy + dy) as usize))
                {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if closed[j] {
                    continue;
                }
                let step = if dx != 0 && dy != 0 { SQRT_2 } else { 1.0 };
                let tentative = g[node.cell] + step;
                if tentative < g[j] {
                    g[j] = tentative;
                    parent[j] = node.cell;
                    let h = self.heuristic((nx as usize, ny as usize), goal);
                    order += 1;
                    open.push(OpenNode {
                        f: tentative + h,
                        h,
                        order,
                        cell: j,
                    });
                }
            }
        }
        debug!(expanded, "goal unreachable");
        Ok(None)
    }

    /// Plan between two world points.
    ///
    /// Interior waypoints are cell centres; the endpoints are the requested
    /// points themselves.
    pub fn plan(
        &self,
        grid: &OccupancyGrid,
        start_m: (f32, f32),
        goal_m: (f32, f32),
    ) -> Result<Option<Path>, RelumeError> {
        let start = grid
            .world_to_cell(start_m.0, start_m.1)
            .ok_or_else(|| RelumeError::Planning(format!("start {start_m:?} is outside the grid")))?;
        let goal = grid
            .world_to_cell(goal_m.0, goal_m.1)
            .ok_or_else(|| RelumeError::Planning(format!("goal {goal_m:?} is outside the grid")))?;
        Ok(self.plan_cells(grid, start, goal)?.map(|cells| {
            let mut waypoints: Vec<_> = cells.into_iter().map(|(cx, cy)| grid.cell_to_world(cx, cy)).collect();
            if let Some(first) = waypoints.first_mut() {
                *first = start_m;
            }
            if waypoints.len() == 1 {
                waypoints.push(goal_m);
            } else if let Some(last) = waypoints.last_mut() {
                *last = goal_m;
            }
            Path::new(waypoints)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(w: usize, h: usize) -> OccupancyGrid {
        OccupancyGrid::new(w, h, 1.0, (0.0, 0.0))
    }

    fn cost(cells: &[(usize, usize)]) -> f32 {
        cells
            .windows(2)
            .map(|p| {
                if p[0].0 != p[1].0 && p[0].1 != p[1].1 {
                    SQRT_2
                } else {
                    1.0
                }
            })
            .sum()
    }

    #[test]
    fn straight_line_on_empty_grid() {
        let cells = AStarPlanner::default().plan_cells(&grid(10, 5), (0, 2), (9, 2)).unwrap().unwrap();
        assert_eq!(cells.len(), 10);
        assert_eq!(cells.first(), Some(&(0, 2)));
        assert_eq!(cells.last(), Some(&(9, 2)));
    }

    #[test]
    fn diagonal_path_is_optimal() {
        let cells = AStarPlanner::default().plan_cells(&grid(8, 8), (0, 0), (7, 4)).unwrap().unwrap();
        let expected = 3.0 + 4.0 * SQRT_2;
        assert!((cost(&cells) - expected).abs() < 1e-4);
    }

    #[test]
    fn four_connected_uses_manhattan_moves() {
        let cells = AStarPlanner::new(false).plan_cells(&grid(6, 6), (0, 0), (3, 4)).unwrap().unwrap();
        assert_eq!(cells.len(), 8);
        for pair in cells.windows(2) {
            assert_eq!(pair[0].0.abs_diff(pair[1].0) + pair[0].1.abs_diff(pair[1].1), 1);
        }
    }

    #[test]
    fn routes_around_a_wall() {
        let mut g = grid(7, 7);
        for y in 0..6 {
            g.set_occupied(3, y, true);
        }
        let cells = AStarPlanner::default().plan_cells(&g, (0, 0), (6, 0)).unwrap().unwrap();
        assert!(cells.iter().all(|&(x, y)| g.is_free(x, y)));
        assert!(cells.contains(&(3, 6)));
    }

    #[test]
    fn does_not_cut_corners() {
        let mut g = grid(3, 3);
        g.set_occupied(1, 0, true);
        g.set_occupied(0, 1, true);
        // (0,0) → (1,1) would squeeze between two obstacles.
        assert_eq!(AStarPlanner::default().plan_cells(&g, (0, 0), (2, 2)).unwrap(), None);

        let mut g = grid(3, 3);
        g.set_occupied(1, 0, true);
        let cells = AStarPlanner::default().plan_cells(&g, (0, 0), (2, 0)).unwrap().unwrap();
        for pair in cells.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.0 != b.0 && a.1 != b.1 {
                assert!(g.is_free(b.0, a.1) && g.is_free(a.0, b.1), "corner cut {a:?} → {b:?}");
            }
        }
    }

    #[test]
    fn unreachable_goal_is_none() {
        let mut g = grid(5, 5);
        for y in 0..5 {
            g.set_occupied(2, y, true);
        }
        assert_eq!(AStarPlanner::default().plan_cells(&g, (0, 0), (4, 4)).unwrap(), None);
    }

    #[test]
    fn invalid_endpoints_are_errors() {
        let mut g = grid(4, 4);
        g.set_occupied(3, 3, true);
        let planner = AStarPlanner::default();
        assert!(matches!(planner.plan_cells(&g, (0, 0), (3, 3)), Err(RelumeError::Planning(_))));
        assert!(matches!(planner.plan_cells(&g, (4, 0), (1, 1)), Err(RelumeError::Planning(_))));
        assert!(planner.plan(&g, (-1.0, 0.5), (1.5, 1.5)).is_err());
    }

    #[test]
    fn start_equals_goal() {
        let cells = AStarPlanner::default().plan_cells(&grid(3, 3), (1, 1), (1, 1)).unwrap().unwrap();
        assert_eq!(cells, vec![(1, 1)]);
    }

    #[test]
    fn planning_is_deterministic() {
        let planner = AStarPlanner::default();
        let a = planner.plan_cells(&grid(12, 12), (0, 0), (11, 7)).unwrap();
        let b = planner.plan_cells(&grid(12, 12), (0, 0), (11, 7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn world_plan_keeps_exact_endpoints() {
        let g = OccupancyGrid::new(10, 10, 0.5, (0.0, 0.0));
        let path = AStarPlanner::default().plan(&g, (0.1, 0.1), (2.4, 0.2)).unwrap().unwrap();
        assert_eq!(path.waypoints().first(), Some(&(0.1, 0.1)));
        assert_eq!(path.waypoints().last(), Some(&(2.4, 0.2)));
        assert_eq!(path.waypoints()[1], (0.75, 0.25), "interior waypoints are cell centres");

        let same_cell = AStarPlanner::default().plan(&g, (0.1, 0.1), (0.2, 0.4)).unwrap().unwrap();
        assert_eq!(same_cell.waypoints(), &[(0.1, 0.1), (0.2, 0.4)]);
    }
}
