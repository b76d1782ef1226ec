//! World-frame waypoint paths.

use crate::grid::OccupancyGrid;

/// Ordered list of `(x, y)` waypoints in world metres.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Path {
    waypoints: Vec<(f32, f32)>,
}

impl Path {
    pub fn new(waypoints: Vec<(f32, f32)>) -> Self {
        Self { waypoints }
    }

    pub fn waypoints(&self) -> &[(f32, f32)] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn goal(&self) -> Option<(f32, f32)> {
        self.waypoints.last().copied()
    }

    /// Total polyline length in metres.
    pub fn length_m(&self) -> f32 {
        self.waypoints
            .windows(2)
            .map(|p| (p[1].0 - p[0].0).hypot(p[1].1 - p[0].1))
            .sum()
    }

    /// Drop interior waypoints that lie on the straight segment joining
    /// their neighbours.  Endpoints are always kept.
    pub fn simplify(&self) -> Self {
        if self.waypoints.len() < 3 {
            return self.clone();
        }
        let mut out = vec![self.waypoints[0]];
        for i in 1..self.waypoints.len() - 1 {
            let a = out[out.len() - 1];
            let b = self.waypoints[i];
            let c = self.waypoints[i + 1];
            let cross = (b.0 - a.0) * (c.1 - b.1) - (b.1 - a.1) * (c.0 - b.0);
            let dot = (b.0 - a.0) * (c.0 - b.0) + (b.1 - a.1) * (c.1 - b.1);
            // Keep turns and reversals.
            if cross.abs() > 1e-6 || dot < 0.0 {
                out.push(b);
            }
        }
        if let Some(&last) = self.waypoints.last() {
            out.push(last);
        }
        Self { waypoints: out }
    }

    /// Greedy string pulling: from each kept waypoint jump to the farthest
    /// later waypoint that is in line of sight on `grid`.
    ///
    /// Removes the staircase and 45° legs of an 8-connected grid path so the
    /// robot heads straight at the goal whenever nothing is in the way.
    /// Paths that leave the grid are returned unchanged.
    pub fn shortcut(&self, grid: &OccupancyGrid) -> Self {
        if self.waypoints.len() < 3 {
            return self.clone();
        }
        let Some(cells) = self
            .waypoints
            .iter()
            .map(|&(x, y)| grid.world_to_cell(x, y))
            .collect::<Option<Vec<_>>>()
        else {
            return self.clone();
        };

        let last = cells.len() - 1;
        let mut out = vec![self.waypoints[0]];
        let mut anchor = 0;
        while anchor < last {
            let next = (anchor + 2..=last)
                .rev()
                .find(|&j| grid.line_of_sight(cells[anchor], cells[j]))
                .unwrap_or(anchor + 1);
            out.push(self.waypoints[next]);
            anchor = next;
        }
        Self { waypoints: out }
    }
}
